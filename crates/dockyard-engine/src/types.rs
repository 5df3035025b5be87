//! Engine-neutral views of containers and images.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use dockyard_core::ImageRef;

/// One entry of a container listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub id: String,
    pub names: Vec<String>,
    pub image: String,
    pub state: Option<String>,
    pub status: Option<String>,
}

/// One entry of an image listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSummary {
    pub id: String,
    /// `repo:tag` names; empty for dangling images.
    pub repo_tags: Vec<String>,
    /// `repo@digest` names the image was pulled by.
    #[serde(default)]
    pub repo_digests: Vec<String>,
    pub size: i64,
}

impl ImageSummary {
    pub fn has_tag(&self, full_name: &str) -> bool {
        self.repo_tags.iter().any(|t| t == full_name)
    }

    /// Whether this image is `reference`: by digest when pinned, else by tag.
    pub fn matches(&self, reference: &ImageRef) -> bool {
        match reference.digest_name() {
            Some(pinned) => self.repo_digests.iter().any(|d| *d == pinned),
            None => self.has_tag(&reference.full_name()),
        }
    }
}

/// A host-side port published for a container port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub host_ip: Option<String>,
    pub host_port: Option<u16>,
}

/// Result of inspecting a container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerInspection {
    pub id: String,
    pub name: Option<String>,
    pub image: Option<String>,
    pub running: bool,
    /// Keyed by container port, e.g. `22/tcp`.
    pub ports: BTreeMap<String, Vec<PortBinding>>,
}

impl ContainerInspection {
    /// Last published binding for `port` (`22/tcp`).
    pub fn binding_for(&self, port: &str) -> Option<&PortBinding> {
        self.ports.get(port).and_then(|bindings| bindings.last())
    }

    /// The 12-character id prefix engines show in listings.
    pub fn short_id(&self) -> &str {
        short_id(&self.id)
    }
}

pub fn short_id(id: &str) -> &str {
    let end = id
        .char_indices()
        .nth(12)
        .map(|(i, _)| i)
        .unwrap_or(id.len());
    &id[..end]
}

/// A single progress record from an image pull.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PullProgress {
    pub id: Option<String>,
    pub status: Option<String>,
    pub progress: Option<String>,
}

/// Engine version report, used to test a connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineVersion {
    pub version: Option<String>,
    pub api_version: Option<String>,
}
