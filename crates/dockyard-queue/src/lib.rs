//! dockyard-queue — hiding host readiness from the scheduler's queue.
//!
//! ```text
//!   job waits ──► controller.on_enter_waiting
//!                   ├─ cancel(job)
//!                   ├─ schedule(HostProvisioningTask)
//!                   └─ nudge(host label)
//!
//!   HostProvisioningTask::run
//!                   ├─ resolver.find_one(budget)
//!                   ├─ schedule(job)
//!                   └─ cancel(self)
//! ```

pub mod controller;
pub mod error;
pub mod memory;
pub mod state;
pub mod task;

pub use controller::{QueueSubstitutionController, SubstitutionOutcome};
pub use error::{QueueError, QueueResult};
pub use memory::InMemoryQueue;
pub use state::{SubstitutionRecord, SubstitutionState, SubstitutionTable};
pub use task::{
    HostProvisioningTask, LoggingNudge, ProvisionerNudge, QueueItem, QueuedTask, TaskQueue,
};
