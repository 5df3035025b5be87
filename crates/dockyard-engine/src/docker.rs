//! Docker engine client backed by bollard.
//!
//! One bollard connection is cached per host address. Plain `tcp://` and
//! `http://` hosts use an HTTP connector, `https://` hosts use client
//! certificates from the cloud's credentials directory, and `unix://`
//! hosts talk to a local socket.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::image::{CreateImageOptions, ListImagesOptions};
use bollard::models::{HostConfig, PortBinding as DockerPortBinding};
use bollard::{API_DEFAULT_VERSION, ClientVersion, Docker};
use futures::stream::{self, BoxStream, StreamExt};
use tracing::debug;

use dockyard_core::{CloudConfig, HostAddress, ImageRef, Scheme};

use crate::client::EngineClient;
use crate::error::{EngineError, EngineResult};
use crate::spec::ContainerSpec;
use crate::types::{
    ContainerInspection, ContainerSummary, EngineVersion, ImageSummary, PortBinding, PullProgress,
};

/// Grace period given to a container on stop before it is killed.
const STOP_GRACE_SECS: i64 = 10;

/// Connection settings shared by every host of one cloud.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub read_timeout: Duration,
    pub credentials_dir: Option<PathBuf>,
    /// `major.minor` API version; `None` uses bollard's default.
    pub api_version: Option<String>,
}

impl EngineSettings {
    pub fn for_cloud(cloud: &CloudConfig) -> Self {
        Self {
            read_timeout: cloud.read_timeout(),
            credentials_dir: cloud.credentials_ref.as_ref().map(PathBuf::from),
            api_version: cloud.engine_version.clone(),
        }
    }

    fn client_version(&self) -> ClientVersion {
        self.api_version
            .as_deref()
            .and_then(parse_api_version)
            .unwrap_or(*API_DEFAULT_VERSION)
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(120),
            credentials_dir: None,
            api_version: None,
        }
    }
}

fn parse_api_version(version: &str) -> Option<ClientVersion> {
    let (major, minor) = version.trim_start_matches('v').split_once('.')?;
    Some(ClientVersion {
        major_version: major.parse().ok()?,
        minor_version: minor.parse().ok()?,
    })
}

/// [`EngineClient`] talking to real Docker daemons.
pub struct DockerEngine {
    settings: EngineSettings,
    clients: Mutex<HashMap<HostAddress, Docker>>,
}

impl DockerEngine {
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            settings,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn for_cloud(cloud: &CloudConfig) -> Self {
        Self::new(EngineSettings::for_cloud(cloud))
    }

    /// Get or create the connection for `host`.
    fn connect(&self, host: &HostAddress) -> EngineResult<Docker> {
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(docker) = clients.get(host) {
            return Ok(docker.clone());
        }

        let timeout = self.settings.read_timeout.as_secs();
        let version = self.settings.client_version();
        let docker = match host.scheme {
            Scheme::Tcp | Scheme::Http => {
                Docker::connect_with_http(&format!("tcp://{}", host.authority()), timeout, &version)?
            }
            Scheme::Https => {
                let dir = self
                    .settings
                    .credentials_dir
                    .as_ref()
                    .ok_or_else(|| EngineError::MissingCredentials(host.to_string()))?;
                Docker::connect_with_ssl(
                    &host.authority(),
                    &dir.join("key.pem"),
                    &dir.join("cert.pem"),
                    &dir.join("ca.pem"),
                    timeout,
                    &version,
                )?
            }
            Scheme::Unix => Docker::connect_with_unix(&host.host, timeout, &version)?,
        };

        debug!(%host, "engine connection created");
        clients.insert(host.clone(), docker.clone());
        Ok(docker)
    }
}

/// Map a 404 from the daemon to a typed not-found error.
fn not_found(err: bollard::errors::Error, id: &str) -> EngineError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => EngineError::ContainerNotFound(id.to_string()),
        other => EngineError::Docker(other),
    }
}

fn to_docker_config(spec: &ContainerSpec) -> Config<String> {
    let port_bindings = spec
        .port_bindings
        .iter()
        .map(|(port, bindings)| {
            let bindings = bindings
                .iter()
                .map(|b| DockerPortBinding {
                    host_ip: b.host_ip.clone(),
                    host_port: b.host_port.map(|p| p.to_string()),
                })
                .collect();
            (port.clone(), Some(bindings))
        })
        .collect::<HashMap<_, _>>();

    let host_config = HostConfig {
        binds: (!spec.binds.is_empty()).then(|| spec.binds.clone()),
        port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
        memory: spec.memory_bytes,
        cpu_shares: spec.cpu_shares,
        privileged: Some(spec.privileged),
        publish_all_ports: Some(spec.publish_all_ports),
        dns: (!spec.dns.is_empty()).then(|| spec.dns.clone()),
        extra_hosts: (!spec.extra_hosts.is_empty()).then(|| spec.extra_hosts.clone()),
        ..Default::default()
    };

    let exposed_ports = spec
        .exposed_ports
        .iter()
        .map(|p| (p.clone(), HashMap::new()))
        .collect::<HashMap<_, _>>();

    Config {
        image: Some(spec.image.clone()),
        cmd: (!spec.cmd.is_empty()).then(|| spec.cmd.clone()),
        env: (!spec.env.is_empty())
            .then(|| spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect()),
        labels: Some(spec.labels.clone().into_iter().collect()),
        hostname: spec.hostname.clone(),
        user: spec.user.clone(),
        working_dir: spec.working_dir.clone(),
        tty: Some(spec.tty),
        open_stdin: Some(spec.open_stdin),
        exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
        host_config: Some(host_config),
        ..Default::default()
    }
}

#[async_trait]
impl EngineClient for DockerEngine {
    async fn list_containers(&self, host: &HostAddress) -> EngineResult<Vec<ContainerSummary>> {
        let docker = self.connect(host)?;
        let containers = docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await?;

        Ok(containers
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                names: c.names.unwrap_or_default(),
                image: c.image.unwrap_or_default(),
                state: c.state,
                status: c.status,
            })
            .collect())
    }

    async fn list_images(&self, host: &HostAddress) -> EngineResult<Vec<ImageSummary>> {
        let docker = self.connect(host)?;
        let images = docker
            .list_images(Some(ListImagesOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await?;

        Ok(images
            .into_iter()
            .map(|i| ImageSummary {
                id: i.id,
                repo_tags: i.repo_tags,
                repo_digests: i.repo_digests,
                size: i.size,
            })
            .collect())
    }

    fn pull_image<'a>(
        &'a self,
        host: &'a HostAddress,
        image: &'a str,
    ) -> BoxStream<'a, EngineResult<PullProgress>> {
        let docker = match self.connect(host) {
            Ok(docker) => docker,
            Err(e) => return stream::once(async move { Err(e) }).boxed(),
        };

        let reference = ImageRef::parse(image);
        let options = match reference.digest_name() {
            Some(pinned) => CreateImageOptions {
                from_image: pinned,
                ..Default::default()
            },
            None => CreateImageOptions {
                from_image: reference.repository.clone(),
                tag: reference.tag_or_default().to_string(),
                ..Default::default()
            },
        };

        docker
            .create_image(Some(options), None, None)
            .map(move |item| match item {
                Ok(info) => match info.error {
                    Some(reason) => Err(EngineError::Pull {
                        image: image.to_string(),
                        reason,
                    }),
                    None => Ok(PullProgress {
                        id: info.id,
                        status: info.status,
                        progress: info.progress,
                    }),
                },
                Err(e) => Err(EngineError::Docker(e)),
            })
            .boxed()
    }

    async fn create_container(&self, host: &HostAddress, spec: &ContainerSpec) -> EngineResult<String> {
        let docker = self.connect(host)?;
        let response = docker
            .create_container(None::<CreateContainerOptions<String>>, to_docker_config(spec))
            .await?;
        Ok(response.id)
    }

    async fn start_container(&self, host: &HostAddress, id: &str) -> EngineResult<()> {
        let docker = self.connect(host)?;
        docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| not_found(e, id))
    }

    async fn inspect_container(&self, host: &HostAddress, id: &str) -> EngineResult<ContainerInspection> {
        let docker = self.connect(host)?;
        let response = docker
            .inspect_container(id, None)
            .await
            .map_err(|e| not_found(e, id))?;

        let ports = response
            .network_settings
            .and_then(|n| n.ports)
            .unwrap_or_default()
            .into_iter()
            .map(|(port, bindings)| {
                let bindings = bindings
                    .unwrap_or_default()
                    .into_iter()
                    .map(|b| PortBinding {
                        host_ip: b.host_ip,
                        host_port: b.host_port.and_then(|p| p.parse().ok()),
                    })
                    .collect();
                (port, bindings)
            })
            .collect();

        Ok(ContainerInspection {
            id: response.id.unwrap_or_else(|| id.to_string()),
            name: response.name,
            image: response.config.and_then(|c| c.image),
            running: response.state.and_then(|s| s.running).unwrap_or(false),
            ports,
        })
    }

    async fn remove_container(&self, host: &HostAddress, id: &str, force: bool) -> EngineResult<()> {
        let docker = self.connect(host)?;
        docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| not_found(e, id))
    }

    async fn stop_container(&self, host: &HostAddress, id: &str) -> EngineResult<()> {
        let docker = self.connect(host)?;
        docker
            .stop_container(id, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await
            .map_err(|e| not_found(e, id))
    }

    async fn version(&self, host: &HostAddress) -> EngineResult<EngineVersion> {
        let docker = self.connect(host)?;
        let version = docker.version().await?;
        Ok(EngineVersion {
            version: version.version,
            api_version: version.api_version,
        })
    }
}
