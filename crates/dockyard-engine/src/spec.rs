//! Container creation config, built in two phases.
//!
//! Phase one fills the spec from a template's base fields
//! ([`ContainerSpec::from_template`]). Phase two hands the spec to the
//! template's launcher, which may override command, tty/stdin and ports.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use dockyard_core::Template;

use crate::error::{EngineError, EngineResult};
use crate::types::PortBinding;

/// Label carrying the template image a container was created from.
pub const TEMPLATE_LABEL: &str = "dockyard.template";
/// Label carrying the owning cloud name.
pub const CLOUD_LABEL: &str = "dockyard.cloud";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContainerSpec {
    pub image: String,
    pub cmd: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub hostname: Option<String>,
    pub user: Option<String>,
    pub working_dir: Option<String>,
    pub tty: bool,
    pub open_stdin: bool,
    /// Container ports to expose, `22/tcp`.
    pub exposed_ports: BTreeSet<String>,
    pub port_bindings: BTreeMap<String, Vec<PortBinding>>,
    pub binds: Vec<String>,
    pub memory_bytes: Option<i64>,
    pub cpu_shares: Option<i64>,
    pub privileged: bool,
    pub publish_all_ports: bool,
    pub dns: Vec<String>,
    pub extra_hosts: Vec<String>,
}

impl ContainerSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    /// Phase one: everything the template's base declares.
    pub fn from_template(template: &Template) -> EngineResult<Self> {
        let base = &template.base;
        let mut spec = Self::new(&template.image);

        spec.cmd = base.command.clone();
        spec.env = base.env.clone();
        spec.hostname = base.hostname.clone();
        spec.tty = base.tty;
        spec.binds = base.volumes.clone();
        spec.memory_bytes = base
            .memory_limit_mb
            .map(|mb| (mb as i64).saturating_mul(1024 * 1024));
        spec.cpu_shares = base.cpu_shares.map(i64::from);
        spec.privileged = base.privileged;
        spec.publish_all_ports = base.publish_all_ports;
        spec.dns = base.dns.clone();
        spec.extra_hosts = base.extra_hosts.clone();
        spec.labels
            .insert(TEMPLATE_LABEL.to_string(), template.image.clone());

        for binding in &base.port_bindings {
            spec.bind(binding)?;
        }
        Ok(spec)
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn expose(&mut self, port: &str) -> &mut Self {
        self.exposed_ports.insert(port.to_string());
        self
    }

    pub fn publish(&mut self, port: &str, binding: PortBinding) -> &mut Self {
        self.expose(port);
        self.port_bindings
            .entry(port.to_string())
            .or_default()
            .push(binding);
        self
    }

    /// Parse and publish `[ip:][host_port]:container_port[/proto]` or a bare
    /// `container_port[/proto]` (host port chosen by the engine).
    pub fn bind(&mut self, binding: &str) -> EngineResult<&mut Self> {
        let (port, published) = parse_binding(binding)?;
        Ok(self.publish(&port, published))
    }

    pub fn set_command<I, S>(&mut self, cmd: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cmd = cmd.into_iter().map(Into::into).collect();
        self
    }
}

fn parse_binding(binding: &str) -> EngineResult<(String, PortBinding)> {
    let invalid = || EngineError::InvalidPortBinding(binding.to_string());

    let parts: Vec<&str> = binding.split(':').collect();
    let (ip, host_port, container) = match parts.as_slice() {
        [container] => (None, None, *container),
        [host_port, container] => (None, Some(*host_port), *container),
        [ip, host_port, container] => (Some(*ip), Some(*host_port), *container),
        _ => return Err(invalid()),
    };

    let (container_port, proto) = container.split_once('/').unwrap_or((container, "tcp"));
    let container_port: u16 = container_port.parse().map_err(|_| invalid())?;
    if !matches!(proto, "tcp" | "udp" | "sctp") {
        return Err(invalid());
    }

    let host_port = match host_port.filter(|p| !p.is_empty()) {
        Some(p) => Some(p.parse::<u16>().map_err(|_| invalid())?),
        None => None,
    };

    Ok((
        format!("{container_port}/{proto}"),
        PortBinding {
            host_ip: ip.filter(|ip| !ip.is_empty()).map(str::to_string),
            host_port,
        },
    ))
}
