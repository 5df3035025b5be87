//! dockyard-engine — container engine access.
//!
//! The provisioner only ever talks to an engine through [`EngineClient`].
//! Two implementations ship here:
//!
//! ```text
//!                 ┌────────────────┐
//!                 │  EngineClient  │  list / pull / create / start /
//!                 └───────┬────────┘  inspect / remove / stop / version
//!            ┌────────────┴────────────┐
//!   ┌────────▼────────┐       ┌────────▼────────┐
//!   │  DockerEngine   │       │ InMemoryEngine  │
//!   │ (bollard, per-  │       │ (fake daemon,   │
//!   │  host clients)  │       │  fault inject)  │
//!   └─────────────────┘       └─────────────────┘
//! ```
//!
//! [`ContainerSpec`] is the engine-neutral creation config that templates
//! and launchers fill in before it is translated for the engine.

pub mod client;
pub mod docker;
pub mod error;
pub mod memory;
pub mod spec;
pub mod types;

pub use client::EngineClient;
pub use docker::{DockerEngine, EngineSettings};
pub use error::{EngineError, EngineResult};
pub use memory::{EngineCall, EngineOp, InMemoryEngine};
pub use spec::{CLOUD_LABEL, ContainerSpec, TEMPLATE_LABEL};
pub use types::{
    ContainerInspection, ContainerSummary, EngineVersion, ImageSummary, PortBinding, PullProgress,
    short_id,
};
