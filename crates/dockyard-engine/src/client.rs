//! The container engine client contract.

use async_trait::async_trait;
use futures::stream::BoxStream;

use dockyard_core::HostAddress;

use crate::error::EngineResult;
use crate::spec::ContainerSpec;
use crate::types::{ContainerInspection, ContainerSummary, EngineVersion, ImageSummary, PullProgress};

/// Operations the provisioner needs from a container engine.
///
/// Every call names the host it targets. Any error means "this host
/// attempt failed" to callers; nothing here is fatal to the process.
#[async_trait]
pub trait EngineClient: Send + Sync {
    /// Live containers on the host.
    async fn list_containers(&self, host: &HostAddress) -> EngineResult<Vec<ContainerSummary>>;

    async fn list_images(&self, host: &HostAddress) -> EngineResult<Vec<ImageSummary>>;

    /// Pull progress stream; the pull is complete once the stream ends.
    fn pull_image<'a>(
        &'a self,
        host: &'a HostAddress,
        image: &'a str,
    ) -> BoxStream<'a, EngineResult<PullProgress>>;

    /// Create a container and return its id.
    async fn create_container(&self, host: &HostAddress, spec: &ContainerSpec) -> EngineResult<String>;

    async fn start_container(&self, host: &HostAddress, id: &str) -> EngineResult<()>;

    async fn inspect_container(&self, host: &HostAddress, id: &str) -> EngineResult<ContainerInspection>;

    async fn remove_container(&self, host: &HostAddress, id: &str, force: bool) -> EngineResult<()>;

    async fn stop_container(&self, host: &HostAddress, id: &str) -> EngineResult<()>;

    async fn version(&self, host: &HostAddress) -> EngineResult<EngineVersion>;
}
