//! Queue substitution controller.
//!
//! Watches queue transitions. A container task entering the wait state
//! is pulled from the queue and replaced by a [`HostProvisioningTask`]
//! that waits for an engine host; once one is found the original goes
//! back in. The scheduler never runs the original while the stand-in is
//! queued, and never sees it queued twice.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use dockyard_provisioner::CloudRegistry;

use crate::error::{QueueError, QueueResult};
use crate::state::{SubstitutionRecord, SubstitutionState, SubstitutionTable};
use crate::task::{HostProvisioningTask, ProvisionerNudge, QueueItem, QueuedTask, TaskQueue};

/// What [`QueueSubstitutionController::on_enter_waiting`] did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum SubstitutionOutcome {
    /// Not a container task.
    Ignored,
    /// A substitution for this task is already in progress.
    AlreadyActive,
    Substituted { provisioning_id: String },
}

pub struct QueueSubstitutionController {
    clouds: CloudRegistry,
    queue: Arc<dyn TaskQueue>,
    nudge: Arc<dyn ProvisionerNudge>,
    table: Arc<SubstitutionTable>,
    budget: Duration,
    next_id: AtomicU64,
}

impl QueueSubstitutionController {
    pub fn new(clouds: CloudRegistry, queue: Arc<dyn TaskQueue>, nudge: Arc<dyn ProvisionerNudge>) -> Self {
        Self {
            clouds,
            queue,
            nudge,
            table: Arc::new(SubstitutionTable::new()),
            budget: Duration::from_secs(120),
            next_id: AtomicU64::new(0),
        }
    }

    /// How long host provisioning tasks wait before using the fallback.
    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    pub fn on_enter_waiting(&self, task: &QueuedTask) -> QueueResult<SubstitutionOutcome> {
        if !task.wants_container {
            return Ok(SubstitutionOutcome::Ignored);
        }
        if self.table.state_of(&task.id).is_some() {
            debug!(task = %task.name, "substitution already active");
            return Ok(SubstitutionOutcome::AlreadyActive);
        }

        let cloud = self
            .clouds
            .for_label(task.label.as_deref())
            .ok_or_else(|| QueueError::NoMatchingCloud {
                label: task.label.clone(),
            })?;
        let config = cloud.config();
        let host_label = config
            .discovery_label
            .clone()
            .unwrap_or_else(|| config.name.clone());

        let provisioning_id = format!(
            "host-provisioning-{}",
            self.next_id.fetch_add(1, Ordering::Relaxed) + 1
        );
        if !self.table.begin(&task.id, &provisioning_id) {
            return Ok(SubstitutionOutcome::AlreadyActive);
        }

        info!(
            task = %task.name,
            label = task.label.as_deref().unwrap_or_default(),
            %host_label,
            "cancelling task and scheduling host provisioning"
        );
        self.queue.cancel(&task.id);

        let provisioning = Arc::new(HostProvisioningTask::new(
            provisioning_id.clone(),
            host_label.clone(),
            config.name.clone(),
            task.clone(),
            Arc::clone(cloud.resolver()),
            self.budget,
            Arc::clone(&self.queue),
            Arc::clone(&self.table),
        ));
        self.queue.schedule(QueueItem::HostProvisioning(provisioning));
        self.table.mark_substituted(&task.id);

        self.nudge.suggest_review(&host_label);
        Ok(SubstitutionOutcome::Substituted { provisioning_id })
    }

    pub fn on_enter_buildable(&self, item: &QueueItem) {
        match item {
            QueueItem::Task(task) if task.wants_container => {
                info!(task = %task.name, "container task about to run");
            }
            QueueItem::HostProvisioning(task) => {
                info!(host_label = %task.host_label(), "host provisioning task about to run");
            }
            QueueItem::Task(_) => {}
        }
    }

    /// An item left the queue for good.
    pub fn on_left(&self, id: &str) {
        if self.table.left(id) {
            debug!(%id, "substitution mapping dropped");
        }
    }

    pub fn state_of(&self, task_id: &str) -> Option<SubstitutionState> {
        self.table.state_of(task_id)
    }

    pub fn records(&self) -> Vec<SubstitutionRecord> {
        self.table.records()
    }
}
