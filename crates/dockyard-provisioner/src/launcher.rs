//! Agent launch strategies.
//!
//! A launcher adds what it needs to the container config before
//! creation, decides when the agent in a started container is usable,
//! and describes how the scheduler should reach it afterwards.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use dockyard_core::{AttachLauncherConfig, HostAddress, LauncherConfig, Scheme, SshLauncherConfig, Template};
use dockyard_discovery::ConnectivityProbe;
use dockyard_engine::{ContainerInspection, ContainerSpec, PortBinding};

use crate::error::{LifecycleError, LifecycleResult};

/// How the scheduler reaches a ready agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum LauncherHandle {
    Ssh {
        host: String,
        port: u16,
        credentials_ref: Option<String>,
    },
    Attach {
        container_id: String,
        user: Option<String>,
    },
}

/// Strategy for bringing an agent up inside a container.
#[async_trait]
pub trait AgentLauncher: Send + Sync {
    /// Second configuration phase, after the template's own settings.
    fn append_container_config(
        &self,
        template: &Template,
        spec: &mut ContainerSpec,
    ) -> LifecycleResult<()>;

    /// Whether the agent became usable. `false` is a readiness failure.
    async fn wait_up(
        &self,
        host: &HostAddress,
        template: &Template,
        inspection: &ContainerInspection,
    ) -> bool;

    fn prepared_launcher(
        &self,
        host: &HostAddress,
        template: &Template,
        inspection: &ContainerInspection,
    ) -> LifecycleResult<LauncherHandle>;
}

/// Whether an agent attached to a container has connected back.
pub trait AgentPresence: Send + Sync {
    fn is_connected(&self, container_id: &str) -> bool;
}

/// Presence fed by agents reporting in.
#[derive(Default)]
pub struct PresenceRegistry {
    connected: Mutex<HashSet<String>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_connected(&self, container_id: &str) {
        self.connected
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(container_id.to_string());
        info!(container = %container_id, "agent connected");
    }

    pub fn mark_disconnected(&self, container_id: &str) -> bool {
        self.connected
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(container_id)
    }
}

impl AgentPresence for PresenceRegistry {
    fn is_connected(&self, container_id: &str) -> bool {
        self.connected
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(container_id)
    }
}

// ── SSH ────────────────────────────────────────────────────────────

/// The controller connects into the container over SSH.
pub struct SshLauncher {
    config: SshLauncherConfig,
    probe: Arc<dyn ConnectivityProbe>,
}

impl SshLauncher {
    pub fn new(config: SshLauncherConfig, probe: Arc<dyn ConnectivityProbe>) -> Self {
        Self { config, probe }
    }

    fn container_port(&self) -> String {
        format!("{}/tcp", self.config.port)
    }

    /// Externally reachable `(host, port)` for the SSH port.
    fn endpoint(&self, host: &HostAddress, inspection: &ContainerInspection) -> Option<(String, u16)> {
        let binding = inspection.binding_for(&self.container_port())?;
        let port = binding.host_port?;
        let ip = binding.host_ip.as_deref().unwrap_or_default();
        let address = if ip.is_empty() || ip == "0.0.0.0" {
            host.host.clone()
        } else {
            ip.to_string()
        };
        Some((address, port))
    }
}

#[async_trait]
impl AgentLauncher for SshLauncher {
    fn append_container_config(
        &self,
        template: &Template,
        spec: &mut ContainerSpec,
    ) -> LifecycleResult<()> {
        let port = self.container_port();
        spec.publish(
            &port,
            PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: None,
            },
        );

        if template.base.command.is_empty() {
            spec.set_command([
                "bash".to_string(),
                "-c".to_string(),
                format!("/usr/sbin/sshd -D -p {}", self.config.port),
            ]);
        }
        Ok(())
    }

    async fn wait_up(
        &self,
        host: &HostAddress,
        _template: &Template,
        inspection: &ContainerInspection,
    ) -> bool {
        if !inspection.running {
            warn!(container = %inspection.short_id(), "container is not running");
            return false;
        }

        let Some((address, port)) = self.endpoint(host, inspection) else {
            warn!(
                container = %inspection.short_id(),
                port = %self.container_port(),
                "ssh port is not published"
            );
            return false;
        };
        let target = HostAddress::new(Scheme::Tcp, address, port);
        let interval = Duration::from_secs(self.config.retry_interval_secs);

        for attempt in 1..=self.config.retries.max(1) {
            if self.probe.probe(&target).await {
                debug!(%target, attempt, "ssh port reachable");
                return true;
            }
            if attempt < self.config.retries {
                tokio::time::sleep(interval).await;
            }
        }
        warn!(%target, retries = self.config.retries, "ssh port never became reachable");
        false
    }

    fn prepared_launcher(
        &self,
        host: &HostAddress,
        _template: &Template,
        inspection: &ContainerInspection,
    ) -> LifecycleResult<LauncherHandle> {
        let (address, port) = self.endpoint(host, inspection).ok_or_else(|| {
            LifecycleError::Launcher(format!(
                "container {} has no binding for {}",
                inspection.short_id(),
                self.container_port()
            ))
        })?;
        Ok(LauncherHandle::Ssh {
            host: address,
            port,
            credentials_ref: self.config.credentials_ref.clone(),
        })
    }
}

// ── Attach ─────────────────────────────────────────────────────────

/// The agent inside the container dials back to the controller.
pub struct AttachLauncher {
    config: AttachLauncherConfig,
    presence: Arc<dyn AgentPresence>,
}

impl AttachLauncher {
    pub fn new(config: AttachLauncherConfig, presence: Arc<dyn AgentPresence>) -> Self {
        Self { config, presence }
    }
}

#[async_trait]
impl AgentLauncher for AttachLauncher {
    fn append_container_config(
        &self,
        template: &Template,
        spec: &mut ContainerSpec,
    ) -> LifecycleResult<()> {
        spec.tty = true;
        spec.open_stdin = true;
        if !self.config.init_command.is_empty() {
            spec.set_command(self.config.init_command.iter().cloned());
        }
        spec.working_dir = Some(template.remote_fs.clone());
        if let Some(user) = &self.config.user {
            spec.user = Some(user.clone());
        }
        Ok(())
    }

    async fn wait_up(
        &self,
        _host: &HostAddress,
        _template: &Template,
        inspection: &ContainerInspection,
    ) -> bool {
        if !inspection.running {
            warn!(container = %inspection.short_id(), "container is not running");
            return false;
        }

        let deadline = Instant::now() + Duration::from_secs(self.config.launch_timeout_secs);
        let interval = Duration::from_secs(self.config.poll_interval_secs.max(1));
        loop {
            if self.presence.is_connected(&inspection.id) {
                debug!(container = %inspection.short_id(), "agent attached");
                return true;
            }
            if Instant::now() >= deadline {
                warn!(
                    container = %inspection.short_id(),
                    timeout_secs = self.config.launch_timeout_secs,
                    "agent did not attach in time"
                );
                return false;
            }
            tokio::time::sleep(interval).await;
        }
    }

    fn prepared_launcher(
        &self,
        _host: &HostAddress,
        _template: &Template,
        inspection: &ContainerInspection,
    ) -> LifecycleResult<LauncherHandle> {
        Ok(LauncherHandle::Attach {
            container_id: inspection.id.clone(),
            user: self.config.user.clone(),
        })
    }
}

// ── Provider ───────────────────────────────────────────────────────

/// Maps a template to the launcher its config asks for.
pub trait LauncherProvider: Send + Sync {
    fn launcher_for(&self, template: &Template) -> Arc<dyn AgentLauncher>;
}

/// Builds launchers from [`LauncherConfig`] with shared collaborators.
pub struct ConfiguredLaunchers {
    probe: Arc<dyn ConnectivityProbe>,
    presence: Arc<dyn AgentPresence>,
}

impl ConfiguredLaunchers {
    pub fn new(probe: Arc<dyn ConnectivityProbe>, presence: Arc<dyn AgentPresence>) -> Self {
        Self { probe, presence }
    }
}

impl LauncherProvider for ConfiguredLaunchers {
    fn launcher_for(&self, template: &Template) -> Arc<dyn AgentLauncher> {
        match &template.launcher {
            LauncherConfig::Ssh(config) => {
                Arc::new(SshLauncher::new(config.clone(), Arc::clone(&self.probe)))
            }
            LauncherConfig::Attach(config) => {
                Arc::new(AttachLauncher::new(config.clone(), Arc::clone(&self.presence)))
            }
        }
    }
}
