//! Queue items and the host-provisioning stand-in task.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use dockyard_core::HostAddress;
use dockyard_discovery::HostResolver;

use crate::state::SubstitutionTable;

/// A scheduler task as the substitution protocol sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedTask {
    pub id: String,
    pub name: String,
    /// Label expression the task is assigned to.
    #[serde(default)]
    pub label: Option<String>,
    /// Whether the task runs on a container agent.
    #[serde(default)]
    pub wants_container: bool,
}

impl QueuedTask {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            label: None,
            wants_container: false,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn on_container(mut self) -> Self {
        self.wants_container = true;
        self
    }
}

/// Anything the scheduler queue holds.
#[derive(Clone)]
pub enum QueueItem {
    Task(QueuedTask),
    HostProvisioning(Arc<HostProvisioningTask>),
}

impl QueueItem {
    pub fn id(&self) -> &str {
        match self {
            QueueItem::Task(task) => &task.id,
            QueueItem::HostProvisioning(task) => task.id(),
        }
    }

    pub fn display_name(&self) -> String {
        match self {
            QueueItem::Task(task) => task.name.clone(),
            QueueItem::HostProvisioning(task) => task.display_name(),
        }
    }
}

/// The scheduler's queue.
pub trait TaskQueue: Send + Sync {
    fn schedule(&self, item: QueueItem);

    /// Remove an item. Returns whether it was queued.
    fn cancel(&self, id: &str) -> bool;
}

/// Asks the capacity side to look at a label again soon.
pub trait ProvisionerNudge: Send + Sync {
    fn suggest_review(&self, label: &str);
}

/// Nudge for deployments where host capacity is managed elsewhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingNudge;

impl ProvisionerNudge for LoggingNudge {
    fn suggest_review(&self, label: &str) {
        info!(%label, "host capacity review suggested");
    }
}

/// Stands in for a container task until an engine host is ready.
///
/// Running it blocks on [`HostResolver::find_one`], then puts the
/// original task back in the queue and cancels itself.
pub struct HostProvisioningTask {
    id: String,
    host_label: String,
    cloud_name: String,
    original: QueuedTask,
    resolver: Arc<dyn HostResolver>,
    budget: Duration,
    queue: Arc<dyn TaskQueue>,
    table: Arc<SubstitutionTable>,
}

impl HostProvisioningTask {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: String,
        host_label: String,
        cloud_name: String,
        original: QueuedTask,
        resolver: Arc<dyn HostResolver>,
        budget: Duration,
        queue: Arc<dyn TaskQueue>,
        table: Arc<SubstitutionTable>,
    ) -> Self {
        Self {
            id,
            host_label,
            cloud_name,
            original,
            resolver,
            budget,
            queue,
            table,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn host_label(&self) -> &str {
        &self.host_label
    }

    pub fn cloud_name(&self) -> &str {
        &self.cloud_name
    }

    pub fn original(&self) -> &QueuedTask {
        &self.original
    }

    pub fn display_name(&self) -> String {
        format!("Provisioning Docker Host ({})", self.host_label)
    }

    /// Wait for a host, then swap the original task back in.
    ///
    /// Returns the host found, or `None` if the substitution was dropped
    /// while waiting and nothing was rescheduled.
    pub async fn run(&self) -> Option<HostAddress> {
        info!(
            task = %self.original.name,
            host_label = %self.host_label,
            "waiting for an engine host"
        );
        let host = self.resolver.find_one(self.budget).await;

        if !self.table.mark_rescheduled(&self.original.id, &self.id) {
            info!(task = %self.original.name, "substitution cancelled, not rescheduling");
            return None;
        }

        info!(
            task = %self.original.name,
            %host,
            host_label = %self.host_label,
            "rescheduling task and cancelling host provisioning"
        );
        self.queue.schedule(QueueItem::Task(self.original.clone()));
        self.queue.cancel(&self.id);
        Some(host)
    }
}
