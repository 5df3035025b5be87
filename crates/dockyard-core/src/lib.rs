//! dockyard-core — shared configuration and addressing types.
//!
//! Everything the other crates agree on lives here: the cloud/template
//! model loaded from `dockyard.toml`, engine host addresses, image
//! reference normalization, label matching and pull strategies.

pub mod address;
pub mod config;
pub mod error;
pub mod image;
pub mod label;
pub mod pull;

pub use address::{HostAddress, Scheme};
pub use config::{
    AttachLauncherConfig, CloudConfig, ContainerBase, DockyardConfig, LauncherConfig, NodeConfig,
    NodeMode, ProvisioningSettings, RollbackPolicy, SshLauncherConfig, Template,
};
pub use error::{ConfigError, ConfigResult};
pub use image::ImageRef;
pub use label::LabelExpr;
pub use pull::{PullPolicy, PullStrategy};
