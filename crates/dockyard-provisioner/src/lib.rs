//! dockyard-provisioner — capacity-aware provisioning of container agents.
//!
//! ```text
//!   provision(label, workload)
//!        │
//!        ├─ template_for_label ──────────────► NoTemplate
//!        ├─ resolver.find_all()
//!        └─ for each host while workload > 0
//!             ├─ ledger.try_reserve ── denied / error ─► next host
//!             └─ spawn ContainerLifecycle::run ──► PlannedUnit
//!                   pull → create → start → inspect → launcher.wait_up → Agent
//! ```
//!
//! The [`CapacityLedger`] is shared by every coordinator that is handed
//! it, so concurrent provisioning against the same hosts sees one set of
//! in-flight counts.

pub mod agent;
pub mod cloud;
pub mod coordinator;
pub mod error;
pub mod launcher;
pub mod ledger;
pub mod lifecycle;

pub use agent::{Agent, AgentSummary};
pub use cloud::{Cloud, CloudRegistry};
pub use coordinator::{AgentFuture, PlannedUnit, ProvisioningCoordinator};
pub use error::{LifecycleError, LifecycleResult, ProvisionError, ProvisionResult};
pub use launcher::{
    AgentLauncher, AgentPresence, AttachLauncher, ConfiguredLaunchers, LauncherHandle,
    LauncherProvider, PresenceRegistry, SshLauncher,
};
pub use ledger::{CapacityCaps, CapacityLedger, LedgerEntry, LedgerKey, Reservation};
pub use lifecycle::{ContainerLifecycle, LifecycleState};
