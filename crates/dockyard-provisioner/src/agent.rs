//! Provisioned agents.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use dockyard_core::{HostAddress, Template};
use dockyard_engine::{EngineClient, EngineResult, short_id};

use crate::launcher::LauncherHandle;

/// A scheduler-visible compute unit backed by a running container.
pub struct Agent {
    /// `<short container id>@<cloud>`.
    pub name: String,
    pub container_id: String,
    pub host: HostAddress,
    pub cloud_name: String,
    /// Template as it was when the container was created.
    pub template: Template,
    pub description: String,
    pub launcher: LauncherHandle,
    engine: Arc<dyn EngineClient>,
}

impl Agent {
    pub fn new(
        container_id: impl Into<String>,
        host: HostAddress,
        cloud_name: impl Into<String>,
        template: Template,
        launcher: LauncherHandle,
        engine: Arc<dyn EngineClient>,
    ) -> Self {
        let container_id = container_id.into();
        let cloud_name = cloud_name.into();
        Self {
            name: format!("{}@{}", short_id(&container_id), cloud_name),
            description: format!("Docker Node [{} on {}@{}]", template.image, cloud_name, host),
            container_id,
            host,
            cloud_name,
            template,
            launcher,
            engine,
        }
    }

    pub fn executors(&self) -> u32 {
        self.template.executors
    }

    /// Stop the container, then force-remove it.
    ///
    /// A failed stop is logged; removal is still attempted.
    pub async fn terminate(&self) -> EngineResult<()> {
        if let Err(e) = self.engine.stop_container(&self.host, &self.container_id).await {
            warn!(agent = %self.name, error = %e, "failed to stop container, removing anyway");
        }
        self.engine
            .remove_container(&self.host, &self.container_id, true)
            .await?;
        info!(agent = %self.name, host = %self.host, "agent terminated");
        Ok(())
    }

    pub fn summary(&self) -> AgentSummary {
        AgentSummary {
            name: self.name.clone(),
            container_id: self.container_id.clone(),
            host: self.host.to_string(),
            cloud: self.cloud_name.clone(),
            image: self.template.image.clone(),
            description: self.description.clone(),
            launcher: self.launcher.clone(),
        }
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("container_id", &self.container_id)
            .field("host", &self.host)
            .field("cloud_name", &self.cloud_name)
            .field("launcher", &self.launcher)
            .finish_non_exhaustive()
    }
}

/// Serializable view of an [`Agent`].
#[derive(Debug, Clone, Serialize)]
pub struct AgentSummary {
    pub name: String,
    pub container_id: String,
    pub host: String,
    pub cloud: String,
    pub image: String,
    pub description: String,
    pub launcher: LauncherHandle,
}
