//! Container lifecycle, from an admitted slot to a ready agent.
//!
//! ```text
//!   Admitted ─► Pulling ─► Creating ─► Starting ─► Inspecting ─► AwaitingReadiness ─► Ready
//!       │          │          │           │            │                 │
//!       └──────────┴──────────┴───────────┴────────────┴─────────────────┴──► Failed
//! ```
//!
//! An inspect failure always force-removes the container. With
//! [`RollbackPolicy::PostCreate`] any failure after creation does.

use std::fmt;
use std::sync::Arc;

use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use dockyard_core::{HostAddress, ImageRef, PullPolicy, RollbackPolicy, Template};
use dockyard_engine::{CLOUD_LABEL, ContainerSpec, EngineClient, EngineError, short_id};

use crate::agent::Agent;
use crate::error::{LifecycleError, LifecycleResult};
use crate::launcher::AgentLauncher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LifecycleState {
    Admitted,
    Pulling,
    Creating,
    Starting,
    Inspecting,
    AwaitingReadiness,
    Ready,
    Failed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Admitted => "admitted",
            LifecycleState::Pulling => "pulling",
            LifecycleState::Creating => "creating",
            LifecycleState::Starting => "starting",
            LifecycleState::Inspecting => "inspecting",
            LifecycleState::AwaitingReadiness => "awaiting-readiness",
            LifecycleState::Ready => "ready",
            LifecycleState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Runs the pull / create / start / inspect / readiness sequence on one host.
pub struct ContainerLifecycle {
    engine: Arc<dyn EngineClient>,
    cloud_name: String,
    rollback: RollbackPolicy,
}

impl ContainerLifecycle {
    pub fn new(engine: Arc<dyn EngineClient>, cloud_name: impl Into<String>, rollback: RollbackPolicy) -> Self {
        Self {
            engine,
            cloud_name: cloud_name.into(),
            rollback,
        }
    }

    pub async fn run(
        &self,
        host: &HostAddress,
        template: &Template,
        launcher: &dyn AgentLauncher,
    ) -> LifecycleResult<Agent> {
        self.transition(host, template, LifecycleState::Admitted);

        let result = self.provision(host, template, launcher).await;
        match &result {
            Ok(agent) => {
                self.transition(host, template, LifecycleState::Ready);
                info!(agent = %agent.name, %host, image = %template.image, "agent ready");
            }
            Err(e) => {
                self.transition(host, template, LifecycleState::Failed);
                error!(%host, image = %template.image, cloud = %self.cloud_name, error = %e, "provisioning failed");
            }
        }
        result
    }

    async fn provision(
        &self,
        host: &HostAddress,
        template: &Template,
        launcher: &dyn AgentLauncher,
    ) -> LifecycleResult<Agent> {
        self.transition(host, template, LifecycleState::Pulling);
        self.pull_if_needed(host, template).await?;

        self.transition(host, template, LifecycleState::Creating);
        let mut spec = ContainerSpec::from_template(template)
            .map_err(LifecycleError::Create)?
            .with_label(CLOUD_LABEL, self.cloud_name.clone());
        launcher.append_container_config(template, &mut spec)?;
        let id = self
            .engine
            .create_container(host, &spec)
            .await
            .map_err(LifecycleError::Create)?;
        debug!(%host, container = %short_id(&id), "container created");

        match self.after_create(host, template, launcher, &id).await {
            Ok(agent) => Ok(agent),
            Err(e) => {
                let inspect_failed = matches!(e, LifecycleError::Inspect { .. });
                if inspect_failed || self.rollback == RollbackPolicy::PostCreate {
                    self.remove_quietly(host, &id).await;
                }
                Err(e)
            }
        }
    }

    async fn after_create(
        &self,
        host: &HostAddress,
        template: &Template,
        launcher: &dyn AgentLauncher,
        id: &str,
    ) -> LifecycleResult<Agent> {
        self.transition(host, template, LifecycleState::Starting);
        self.engine
            .start_container(host, id)
            .await
            .map_err(|source| LifecycleError::Start {
                id: id.to_string(),
                source,
            })?;

        self.transition(host, template, LifecycleState::Inspecting);
        let inspection = self
            .engine
            .inspect_container(host, id)
            .await
            .map_err(|source| LifecycleError::Inspect {
                id: id.to_string(),
                source,
            })?;

        self.transition(host, template, LifecycleState::AwaitingReadiness);
        if !launcher.wait_up(host, template, &inspection).await {
            return Err(LifecycleError::NotReady { id: id.to_string() });
        }

        let handle = launcher.prepared_launcher(host, template, &inspection)?;
        Ok(Agent::new(
            id,
            host.clone(),
            self.cloud_name.clone(),
            template.clone(),
            handle,
            Arc::clone(&self.engine),
        ))
    }

    async fn pull_if_needed(&self, host: &HostAddress, template: &Template) -> LifecycleResult<()> {
        let reference = ImageRef::parse(&template.image);
        let image = reference.pull_name();
        let pull_error = |source: EngineError| LifecycleError::Pull {
            image: image.clone(),
            source,
        };

        let images = self.engine.list_images(host).await.map_err(pull_error)?;
        let present = images.iter().any(|i| i.matches(&reference));

        if !template.pull_strategy.should_pull(&image, present) {
            debug!(%host, %image, present, "skipping pull");
            return Ok(());
        }

        info!(%host, %image, "pulling image");
        let mut progress = self.engine.pull_image(host, &image);
        while let Some(item) = progress.next().await {
            let item = item.map_err(pull_error)?;
            debug!(
                %image,
                layer = item.id.as_deref().unwrap_or_default(),
                status = item.status.as_deref().unwrap_or_default(),
                "pull progress"
            );
        }
        Ok(())
    }

    async fn remove_quietly(&self, host: &HostAddress, id: &str) {
        match self.engine.remove_container(host, id, true).await {
            Ok(()) => info!(%host, container = %short_id(id), "rolled back container"),
            Err(e) => warn!(%host, container = %short_id(id), error = %e, "rollback removal failed"),
        }
    }

    fn transition(&self, host: &HostAddress, template: &Template, state: LifecycleState) {
        debug!(%host, image = %template.image, cloud = %self.cloud_name, %state, "lifecycle state");
    }
}
