//! Image reference normalization.

use std::fmt;

/// Tag assumed when an image reference carries none.
pub const DEFAULT_TAG: &str = "latest";

/// A parsed `repository[:tag][@digest]` image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageRef {
    pub fn parse(image: &str) -> Self {
        let (name, digest) = match image.split_once('@') {
            Some((name, digest)) => (name, Some(digest.to_string())),
            None => (image, None),
        };

        // A colon before the last slash belongs to a registry port.
        let path_start = name.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (repository, tag) = match name[path_start..].rfind(':') {
            Some(i) => {
                let split = path_start + i;
                (&name[..split], Some(name[split + 1..].to_string()))
            }
            None => (name, None),
        };

        Self {
            repository: repository.to_string(),
            tag: tag.filter(|t| !t.is_empty()),
            digest,
        }
    }

    /// Tag, falling back to [`DEFAULT_TAG`].
    pub fn tag_or_default(&self) -> &str {
        self.tag.as_deref().unwrap_or(DEFAULT_TAG)
    }

    /// The `repo:tag` form the engine reports in its image listing.
    pub fn full_name(&self) -> String {
        format!("{}:{}", self.repository, self.tag_or_default())
    }

    /// `repo@digest` when pinned by digest.
    pub fn digest_name(&self) -> Option<String> {
        self.digest
            .as_ref()
            .map(|digest| format!("{}@{digest}", self.repository))
    }

    /// The name to pull by: the digest when pinned, else `repo:tag`.
    pub fn pull_name(&self) -> String {
        self.digest_name().unwrap_or_else(|| self.full_name())
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full_name())?;
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}
