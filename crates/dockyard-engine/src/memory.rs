//! In-memory container engine.
//!
//! Behaves like a small Docker daemon per registered host: images can be
//! seeded or pulled, containers are created, started, stopped and removed,
//! and published ports get ephemeral host ports on start. Every call is
//! recorded and any operation can be made to fail per host. Used by tests
//! and by `dockyardd --dry-run`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::future;
use futures::stream::{self, BoxStream, StreamExt};

use dockyard_core::{HostAddress, ImageRef};

use crate::client::EngineClient;
use crate::error::{EngineError, EngineResult};
use crate::spec::ContainerSpec;
use crate::types::{
    ContainerInspection, ContainerSummary, EngineVersion, ImageSummary, PortBinding, PullProgress,
};

const FIRST_EPHEMERAL_PORT: u16 = 32768;

/// Engine operations, for failure injection and call assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineOp {
    ListContainers,
    ListImages,
    Pull,
    Create,
    Start,
    Inspect,
    Remove,
    Stop,
    Version,
}

/// A recorded engine call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCall {
    pub host: HostAddress,
    pub op: EngineOp,
    /// Image or container id the call was about, empty for listings.
    pub target: String,
}

#[derive(Debug, Clone)]
struct MemContainer {
    spec: ContainerSpec,
    running: bool,
    ports: BTreeMap<String, Vec<PortBinding>>,
}

#[derive(Debug, Default)]
struct HostState {
    images: Vec<ImageSummary>,
    containers: BTreeMap<String, MemContainer>,
    next_port: u16,
}

#[derive(Default)]
struct Inner {
    hosts: HashMap<HostAddress, HostState>,
    failures: HashSet<(HostAddress, EngineOp)>,
    calls: Vec<EngineCall>,
}

#[derive(Default)]
pub struct InMemoryEngine {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
}

impl InMemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a reachable host with no images or containers.
    pub fn add_host(&self, host: &HostAddress) {
        self.lock().hosts.entry(host.clone()).or_insert_with(|| HostState {
            next_port: FIRST_EPHEMERAL_PORT,
            ..Default::default()
        });
    }

    /// Seed an image; `image` is normalized to `repo:tag`, or recorded
    /// by `repo@digest` alone when pinned without a tag.
    pub fn add_image(&self, host: &HostAddress, image: &str) {
        self.add_host(host);
        let reference = ImageRef::parse(image);
        let repo_tags = match (&reference.tag, &reference.digest) {
            (None, Some(_)) => vec![],
            _ => vec![reference.full_name()],
        };
        let id = self.next_id("sha256:");
        let mut inner = self.lock();
        if let Some(state) = inner.hosts.get_mut(host) {
            if !state.images.iter().any(|i| i.matches(&reference)) {
                state.images.push(ImageSummary {
                    id,
                    repo_tags,
                    repo_digests: reference.digest_name().into_iter().collect(),
                    size: 0,
                });
            }
        }
    }

    /// Seed a running container and return its id.
    pub fn add_running_container(&self, host: &HostAddress, image: &str) -> String {
        self.add_host(host);
        let id = self.next_id("");
        let mut inner = self.lock();
        if let Some(state) = inner.hosts.get_mut(host) {
            state.containers.insert(
                id.clone(),
                MemContainer {
                    spec: ContainerSpec::new(image),
                    running: true,
                    ports: BTreeMap::new(),
                },
            );
        }
        id
    }

    /// Make `op` fail on `host` until [`clear_failure`](Self::clear_failure).
    pub fn fail(&self, host: &HostAddress, op: EngineOp) {
        self.lock().failures.insert((host.clone(), op));
    }

    pub fn clear_failure(&self, host: &HostAddress, op: EngineOp) {
        self.lock().failures.remove(&(host.clone(), op));
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self, op: EngineOp) -> usize {
        self.lock().calls.iter().filter(|c| c.op == op).count()
    }

    /// Ids of all containers on `host`, running or not.
    pub fn container_ids(&self, host: &HostAddress) -> Vec<String> {
        self.lock()
            .hosts
            .get(host)
            .map(|s| s.containers.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_image(&self, host: &HostAddress, image: &str) -> bool {
        let reference = ImageRef::parse(image);
        self.lock()
            .hosts
            .get(host)
            .is_some_and(|s| s.images.iter().any(|i| i.matches(&reference)))
    }

    fn next_id(&self, prefix: &str) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{prefix}{n:064x}")
    }

    /// Record the call, then check reachability and injected failures.
    fn begin(&self, host: &HostAddress, op: EngineOp, target: &str) -> EngineResult<()> {
        let mut inner = self.lock();
        inner.calls.push(EngineCall {
            host: host.clone(),
            op,
            target: target.to_string(),
        });
        if !inner.hosts.contains_key(host) {
            return Err(EngineError::Connect {
                host: host.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        if inner.failures.contains(&(host.clone(), op)) {
            return Err(EngineError::Rejected(format!("injected {op:?} failure")));
        }
        Ok(())
    }

    fn with_container<T>(
        &self,
        host: &HostAddress,
        id: &str,
        f: impl FnOnce(&mut HostState, &str) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let mut inner = self.lock();
        let state = inner
            .hosts
            .get_mut(host)
            .ok_or_else(|| EngineError::ContainerNotFound(id.to_string()))?;
        if !state.containers.contains_key(id) {
            return Err(EngineError::ContainerNotFound(id.to_string()));
        }
        f(state, id)
    }
}

#[async_trait]
impl EngineClient for InMemoryEngine {
    async fn list_containers(&self, host: &HostAddress) -> EngineResult<Vec<ContainerSummary>> {
        self.begin(host, EngineOp::ListContainers, "")?;
        let inner = self.lock();
        let state = inner.hosts.get(host);
        Ok(state
            .map(|s| {
                s.containers
                    .iter()
                    .filter(|(_, c)| c.running)
                    .map(|(id, c)| ContainerSummary {
                        id: id.clone(),
                        names: vec![format!("/{}", crate::types::short_id(id))],
                        image: c.spec.image.clone(),
                        state: Some("running".to_string()),
                        status: Some("Up".to_string()),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_images(&self, host: &HostAddress) -> EngineResult<Vec<ImageSummary>> {
        self.begin(host, EngineOp::ListImages, "")?;
        Ok(self
            .lock()
            .hosts
            .get(host)
            .map(|s| s.images.clone())
            .unwrap_or_default())
    }

    fn pull_image<'a>(
        &'a self,
        host: &'a HostAddress,
        image: &'a str,
    ) -> BoxStream<'a, EngineResult<PullProgress>> {
        if let Err(e) = self.begin(host, EngineOp::Pull, image) {
            return stream::once(future::ready(Err(e))).boxed();
        }

        let reference = ImageRef::parse(image);
        let progress = ["Pulling from library", "Download complete"].map(|status| {
            Ok::<_, EngineError>(PullProgress {
                id: Some(reference.tag_or_default().to_string()),
                status: Some(status.to_string()),
                progress: None,
            })
        });

        // The image only lands once the stream has been read to the end.
        let finish = stream::once(async move {
            self.add_image(host, image);
            None::<EngineResult<PullProgress>>
        })
        .filter_map(future::ready);

        stream::iter(progress).chain(finish).boxed()
    }

    async fn create_container(&self, host: &HostAddress, spec: &ContainerSpec) -> EngineResult<String> {
        self.begin(host, EngineOp::Create, &spec.image)?;
        if !self.has_image(host, &spec.image) {
            return Err(EngineError::ImageNotFound(spec.image.clone()));
        }

        let id = self.next_id("");
        let mut inner = self.lock();
        if let Some(state) = inner.hosts.get_mut(host) {
            state.containers.insert(
                id.clone(),
                MemContainer {
                    spec: spec.clone(),
                    running: false,
                    ports: BTreeMap::new(),
                },
            );
        }
        Ok(id)
    }

    async fn start_container(&self, host: &HostAddress, id: &str) -> EngineResult<()> {
        self.begin(host, EngineOp::Start, id)?;
        self.with_container(host, id, |state, id| {
            let mut next_port = state.next_port;
            if let Some(container) = state.containers.get_mut(id) {
                container.running = true;
                container.ports = container
                    .spec
                    .port_bindings
                    .iter()
                    .map(|(port, bindings)| {
                        let published = bindings
                            .iter()
                            .map(|b| PortBinding {
                                host_ip: Some(b.host_ip.clone().unwrap_or_else(|| "0.0.0.0".into())),
                                host_port: Some(b.host_port.unwrap_or_else(|| {
                                    let p = next_port;
                                    next_port = next_port.saturating_add(1);
                                    p
                                })),
                            })
                            .collect();
                        (port.clone(), published)
                    })
                    .collect();
            }
            state.next_port = next_port;
            Ok(())
        })
    }

    async fn inspect_container(&self, host: &HostAddress, id: &str) -> EngineResult<ContainerInspection> {
        self.begin(host, EngineOp::Inspect, id)?;
        self.with_container(host, id, |state, id| {
            let container = &state.containers[id];
            Ok(ContainerInspection {
                id: id.to_string(),
                name: Some(format!("/{}", crate::types::short_id(id))),
                image: Some(container.spec.image.clone()),
                running: container.running,
                ports: container.ports.clone(),
            })
        })
    }

    async fn remove_container(&self, host: &HostAddress, id: &str, force: bool) -> EngineResult<()> {
        self.begin(host, EngineOp::Remove, id)?;
        self.with_container(host, id, |state, id| {
            if state.containers[id].running && !force {
                return Err(EngineError::Rejected(format!(
                    "container {id} is running; stop it or force removal"
                )));
            }
            state.containers.remove(id);
            Ok(())
        })
    }

    async fn stop_container(&self, host: &HostAddress, id: &str) -> EngineResult<()> {
        self.begin(host, EngineOp::Stop, id)?;
        self.with_container(host, id, |state, id| {
            if let Some(container) = state.containers.get_mut(id) {
                container.running = false;
            }
            Ok(())
        })
    }

    async fn version(&self, host: &HostAddress) -> EngineResult<EngineVersion> {
        self.begin(host, EngineOp::Version, "")?;
        Ok(EngineVersion {
            version: Some("in-memory".to_string()),
            api_version: Some("1.47".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn host() -> HostAddress {
        HostAddress::parse("tcp://docker.host:2375").unwrap()
    }

    #[tokio::test]
    async fn unknown_host_is_unreachable() {
        let engine = InMemoryEngine::new();
        let err = engine.list_containers(&host()).await.unwrap_err();
        assert!(matches!(err, EngineError::Connect { .. }));
    }

    #[tokio::test]
    async fn pull_lands_image_after_stream_drained() {
        let engine = InMemoryEngine::new();
        engine.add_host(&host());
        let h = host();

        let progress: Vec<_> = engine.pull_image(&h, "alpine").try_collect().await.unwrap();
        assert_eq!(progress.len(), 2);
        assert!(engine.has_image(&h, "alpine:latest"));
    }

    #[tokio::test]
    async fn pinned_pull_is_found_by_digest_only() {
        let engine = InMemoryEngine::new();
        engine.add_host(&host());
        let h = host();

        let _: Vec<_> = engine
            .pull_image(&h, "alpine@sha256:abc123")
            .try_collect()
            .await
            .unwrap();
        assert!(engine.has_image(&h, "alpine@sha256:abc123"));
        assert!(!engine.has_image(&h, "alpine:latest"));
        assert!(!engine.has_image(&h, "alpine@sha256:def456"));
    }

    #[tokio::test]
    async fn create_requires_image() {
        let engine = InMemoryEngine::new();
        engine.add_host(&host());
        let err = engine
            .create_container(&host(), &ContainerSpec::new("alpine"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ImageNotFound(_)));
    }

    #[tokio::test]
    async fn start_assigns_ephemeral_ports() {
        let engine = InMemoryEngine::new();
        engine.add_image(&host(), "alpine");
        let mut spec = ContainerSpec::new("alpine");
        spec.bind("0.0.0.0::22").unwrap();

        let id = engine.create_container(&host(), &spec).await.unwrap();
        assert!(engine.list_containers(&host()).await.unwrap().is_empty());

        engine.start_container(&host(), &id).await.unwrap();
        let inspection = engine.inspect_container(&host(), &id).await.unwrap();
        assert!(inspection.running);
        let binding = inspection.binding_for("22/tcp").unwrap();
        assert_eq!(binding.host_port, Some(FIRST_EPHEMERAL_PORT));
        assert_eq!(engine.list_containers(&host()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn remove_running_requires_force() {
        let engine = InMemoryEngine::new();
        let id = engine.add_running_container(&host(), "alpine");

        assert!(engine.remove_container(&host(), &id, false).await.is_err());
        engine.remove_container(&host(), &id, true).await.unwrap();
        assert!(engine.container_ids(&host()).is_empty());
    }

    #[tokio::test]
    async fn injected_failure_and_call_log() {
        let engine = InMemoryEngine::new();
        engine.add_host(&host());
        engine.fail(&host(), EngineOp::Version);

        assert!(engine.version(&host()).await.is_err());
        engine.clear_failure(&host(), EngineOp::Version);
        assert!(engine.version(&host()).await.is_ok());
        assert_eq!(engine.call_count(EngineOp::Version), 2);
    }
}
