//! dockyard.toml configuration parser.
//!
//! ```toml
//! [provisioning]
//! find_one_budget_secs = 120
//!
//! [[nodes]]
//! name = "docker-host-1"
//! address = "10.0.0.7"
//! labels = ["docker-hosts"]
//!
//! [[clouds]]
//! name = "docker-local"
//! fallback_url = "tcp://docker.host:2375"
//! discovery_label = "docker-hosts"
//! container_cap = 10
//!
//! [[clouds.templates]]
//! image = "jenkins/ssh-agent"
//! labels = ["docker", "linux"]
//! launcher = { kind = "ssh", port = 22 }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::address::HostAddress;
use crate::error::{ConfigError, ConfigResult};
use crate::label::LabelExpr;
use crate::pull::PullStrategy;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockyardConfig {
    #[serde(default)]
    pub provisioning: ProvisioningSettings,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub clouds: Vec<CloudConfig>,
}

impl DockyardConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate a TOML document.
    pub fn parse(content: &str) -> ConfigResult<Self> {
        let config: DockyardConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let mut names = HashSet::new();
        for cloud in &self.clouds {
            cloud.validate()?;
            if !names.insert(cloud.name.as_str()) {
                return Err(ConfigError::DuplicateCloud(cloud.name.clone()));
            }
        }
        Ok(())
    }

    pub fn cloud(&self, name: &str) -> Option<&CloudConfig> {
        self.clouds.iter().find(|c| c.name == name)
    }
}

// ── Provisioning timings ───────────────────────────────────────

/// Timings for host discovery and node liveness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningSettings {
    /// Total time `find_one` waits for a dynamic host before falling back.
    #[serde(default = "default_find_one_budget")]
    pub find_one_budget_secs: u64,
    /// Per-attempt connectivity probe timeout.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
    /// Sleep between discovery rounds.
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,
    /// A node without a heartbeat for this long is offline.
    #[serde(default = "default_node_dead_after")]
    pub node_dead_after_secs: u64,
}

impl ProvisioningSettings {
    pub fn find_one_budget(&self) -> Duration {
        Duration::from_secs(self.find_one_budget_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn node_dead_after(&self) -> Duration {
        Duration::from_secs(self.node_dead_after_secs)
    }
}

impl Default for ProvisioningSettings {
    fn default() -> Self {
        Self {
            find_one_budget_secs: default_find_one_budget(),
            probe_timeout_secs: default_probe_timeout(),
            retry_interval_secs: default_retry_interval(),
            node_dead_after_secs: default_node_dead_after(),
        }
    }
}

fn default_find_one_budget() -> u64 {
    120
}

fn default_probe_timeout() -> u64 {
    10
}

fn default_retry_interval() -> u64 {
    10
}

fn default_node_dead_after() -> u64 {
    30
}

/// A statically declared node seeding the label-indexed node pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    /// Externally reachable hostname or IP; nodes without one are skipped.
    pub address: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
}

// ── Clouds ─────────────────────────────────────────────────────

/// Failure handling after a container has been created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RollbackPolicy {
    /// Force-remove only when inspection of the new container fails.
    #[default]
    Inspect,
    /// Force-remove on any failure after the container was created.
    PostCreate,
}

/// One logical provisioning domain: templates plus engine connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudConfig {
    pub name: String,
    pub fallback_url: String,
    pub discovery_label: Option<String>,
    #[serde(default = "default_container_cap")]
    pub container_cap: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    /// Directory holding `key.pem`, `cert.pem` and `ca.pem` for TLS hosts.
    pub credentials_ref: Option<String>,
    /// Engine API version to negotiate, e.g. `1.41`.
    pub engine_version: Option<String>,
    #[serde(default)]
    pub rollback: RollbackPolicy,
    #[serde(default)]
    pub templates: Vec<Template>,
}

fn default_container_cap() -> u32 {
    100
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_read_timeout() -> u64 {
    120
}

impl CloudConfig {
    pub fn new(name: impl Into<String>, fallback_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fallback_url: fallback_url.into(),
            discovery_label: None,
            container_cap: default_container_cap(),
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            credentials_ref: None,
            engine_version: None,
            rollback: RollbackPolicy::default(),
            templates: Vec::new(),
        }
    }

    pub fn with_container_cap(mut self, cap: u32) -> Self {
        self.container_cap = cap;
        self
    }

    pub fn with_discovery_label(mut self, label: impl Into<String>) -> Self {
        self.discovery_label = Some(label.into());
        self
    }

    pub fn with_rollback(mut self, rollback: RollbackPolicy) -> Self {
        self.rollback = rollback;
        self
    }

    pub fn with_template(mut self, template: Template) -> Self {
        self.templates.push(template);
        self
    }

    pub fn fallback_address(&self) -> ConfigResult<HostAddress> {
        HostAddress::parse(&self.fallback_url)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// Template whose image is exactly `image`.
    pub fn template_by_image(&self, image: &str) -> Option<&Template> {
        self.templates.iter().find(|t| t.image == image)
    }

    /// All templates matching `label`, in declaration order.
    ///
    /// With no label, only templates in [`NodeMode::Normal`] qualify.
    pub fn templates_for_label(&self, label: Option<&str>) -> Vec<&Template> {
        self.templates
            .iter()
            .filter(|t| t.matches_label(label))
            .collect()
    }

    /// First template matching `label`.
    pub fn template_for_label(&self, label: Option<&str>) -> Option<&Template> {
        self.templates.iter().find(|t| t.matches_label(label))
    }

    pub fn can_provision(&self, label: Option<&str>) -> bool {
        self.template_for_label(label).is_some()
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let invalid = |reason: &str| ConfigError::InvalidCloud {
            cloud: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }
        self.fallback_address()?;
        if self.container_cap == 0 {
            return Err(invalid("container_cap must be at least 1"));
        }

        let mut images = HashSet::new();
        for template in &self.templates {
            template.validate(&self.name)?;
            if !images.insert(template.image.as_str()) {
                return Err(ConfigError::DuplicateTemplate {
                    cloud: self.name.clone(),
                    image: template.image.clone(),
                });
            }
        }
        Ok(())
    }
}

// ── Templates ──────────────────────────────────────────────────

/// Whether a template accepts unlabelled work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeMode {
    #[default]
    Normal,
    /// Only tasks explicitly asking for one of its labels.
    Exclusive,
}

/// What to run when provisioning an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub image: String,
    #[serde(default)]
    pub pull_strategy: PullStrategy,
    #[serde(default)]
    pub launcher: LauncherConfig,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub mode: NodeMode,
    /// Per-image cap; 0 disables the image dimension.
    #[serde(default)]
    pub instance_cap: u32,
    #[serde(default = "default_executors")]
    pub executors: u32,
    #[serde(default = "default_remote_fs")]
    pub remote_fs: String,
    #[serde(default)]
    pub base: ContainerBase,
}

fn default_executors() -> u32 {
    1
}

fn default_remote_fs() -> String {
    "/home/agent".to_string()
}

impl Template {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            pull_strategy: PullStrategy::default(),
            launcher: LauncherConfig::default(),
            labels: Vec::new(),
            mode: NodeMode::default(),
            instance_cap: 0,
            executors: default_executors(),
            remote_fs: default_remote_fs(),
            base: ContainerBase::default(),
        }
    }

    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_pull_strategy(mut self, strategy: PullStrategy) -> Self {
        self.pull_strategy = strategy;
        self
    }

    pub fn with_launcher(mut self, launcher: LauncherConfig) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_instance_cap(mut self, cap: u32) -> Self {
        self.instance_cap = cap;
        self
    }

    pub fn with_executors(mut self, executors: u32) -> Self {
        self.executors = executors;
        self
    }

    pub fn with_mode(mut self, mode: NodeMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_base(mut self, base: ContainerBase) -> Self {
        self.base = base;
        self
    }

    pub fn display_name(&self) -> String {
        format!("Image of {}", self.image)
    }

    pub fn matches_label(&self, label: Option<&str>) -> bool {
        match label {
            None => self.mode == NodeMode::Normal,
            Some(expr) => LabelExpr::parse(expr).matches(&self.labels),
        }
    }

    fn validate(&self, cloud: &str) -> ConfigResult<()> {
        let invalid = |reason: &str| ConfigError::InvalidTemplate {
            cloud: cloud.to_string(),
            image: self.image.clone(),
            reason: reason.to_string(),
        };

        if self.image.trim().is_empty() {
            return Err(invalid("image must not be empty"));
        }
        if self.executors == 0 {
            return Err(invalid("executors must be at least 1"));
        }
        Ok(())
    }
}

/// Container settings shared by every launcher.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerBase {
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Bind mounts, `host:container[:ro]`.
    #[serde(default)]
    pub volumes: Vec<String>,
    pub hostname: Option<String>,
    pub memory_limit_mb: Option<u64>,
    pub cpu_shares: Option<u32>,
    /// `[ip:]host_port:container_port[/proto]`, host part may be empty.
    #[serde(default)]
    pub port_bindings: Vec<String>,
    #[serde(default)]
    pub publish_all_ports: bool,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub tty: bool,
    #[serde(default)]
    pub dns: Vec<String>,
    #[serde(default)]
    pub extra_hosts: Vec<String>,
}

// ── Launchers ──────────────────────────────────────────────────

/// Which agent launch strategy a template uses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum LauncherConfig {
    /// The controller connects into the container over SSH.
    Ssh(SshLauncherConfig),
    /// The agent inside the container dials back and attaches.
    Attach(AttachLauncherConfig),
}

impl Default for LauncherConfig {
    fn default() -> Self {
        LauncherConfig::Ssh(SshLauncherConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SshLauncherConfig {
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub credentials_ref: Option<String>,
    #[serde(default = "default_ssh_retries")]
    pub retries: u32,
    #[serde(default = "default_ssh_retry_interval")]
    pub retry_interval_secs: u64,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_retries() -> u32 {
    10
}

fn default_ssh_retry_interval() -> u64 {
    10
}

impl Default for SshLauncherConfig {
    fn default() -> Self {
        Self {
            port: default_ssh_port(),
            credentials_ref: None,
            retries: default_ssh_retries(),
            retry_interval_secs: default_ssh_retry_interval(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachLauncherConfig {
    #[serde(default = "default_launch_timeout")]
    pub launch_timeout_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    pub user: Option<String>,
    /// Entry command that starts the agent and dials back.
    #[serde(default)]
    pub init_command: Vec<String>,
}

fn default_launch_timeout() -> u64 {
    120
}

fn default_poll_interval() -> u64 {
    1
}

impl Default for AttachLauncherConfig {
    fn default() -> Self {
        Self {
            launch_timeout_secs: default_launch_timeout(),
            poll_interval_secs: default_poll_interval(),
            user: None,
            init_command: Vec::new(),
        }
    }
}
