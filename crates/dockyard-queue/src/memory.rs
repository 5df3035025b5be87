//! In-process task queue.
//!
//! Holds queued items in order. When built with a dispatcher, every
//! host-provisioning task scheduled is also handed to a channel so a
//! worker can run it.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::debug;

use crate::task::{HostProvisioningTask, QueueItem, TaskQueue};

#[derive(Default)]
pub struct InMemoryQueue {
    items: Mutex<Vec<QueueItem>>,
    dispatch: Option<mpsc::UnboundedSender<Arc<HostProvisioningTask>>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue plus the receiving end of its host-provisioning dispatch.
    pub fn with_dispatcher() -> (Self, mpsc::UnboundedReceiver<Arc<HostProvisioningTask>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Self {
            items: Mutex::new(Vec::new()),
            dispatch: Some(tx),
        };
        (queue, rx)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<QueueItem>> {
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of queued items, oldest first.
    pub fn items(&self) -> Vec<QueueItem> {
        self.lock().clone()
    }

    pub fn ids(&self) -> Vec<String> {
        self.lock().iter().map(|i| i.id().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl TaskQueue for InMemoryQueue {
    fn schedule(&self, item: QueueItem) {
        {
            let mut items = self.lock();
            if items.iter().any(|i| i.id() == item.id()) {
                debug!(id = %item.id(), "already queued");
                return;
            }
            items.push(item.clone());
        }
        debug!(id = %item.id(), name = %item.display_name(), "scheduled");

        if let (QueueItem::HostProvisioning(task), Some(tx)) = (&item, &self.dispatch) {
            if tx.send(Arc::clone(task)).is_err() {
                debug!(id = %task.id(), "no dispatcher listening");
            }
        }
    }

    fn cancel(&self, id: &str) -> bool {
        let mut items = self.lock();
        let before = items.len();
        items.retain(|i| i.id() != id);
        before != items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::QueuedTask;

    #[test]
    fn schedule_is_idempotent_per_id() {
        let queue = InMemoryQueue::new();
        queue.schedule(QueueItem::Task(QueuedTask::new("a", "first")));
        queue.schedule(QueueItem::Task(QueuedTask::new("a", "again")));
        queue.schedule(QueueItem::Task(QueuedTask::new("b", "second")));
        assert_eq!(queue.ids(), vec!["a", "b"]);
    }

    #[test]
    fn cancel_reports_presence() {
        let queue = InMemoryQueue::new();
        queue.schedule(QueueItem::Task(QueuedTask::new("a", "first")));
        assert!(queue.cancel("a"));
        assert!(!queue.cancel("a"));
        assert!(queue.is_empty());
    }
}
