//! Image pull strategies.

use serde::{Deserialize, Serialize};

/// Decides whether an image should be pulled given whether the host
/// already has it.
pub trait PullPolicy {
    /// Called when the image is already present on the host.
    fn pull_if_exists(&self, image: &str) -> bool;
    /// Called when the image is missing from the host.
    fn pull_if_not_exists(&self, image: &str) -> bool;

    fn should_pull(&self, image: &str, present: bool) -> bool {
        if present {
            self.pull_if_exists(image)
        } else {
            self.pull_if_not_exists(image)
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PullStrategy {
    /// Pull on every provision, refreshing a present image.
    Always,
    /// Pull only when the host lacks the image.
    #[default]
    IfNotPresent,
    /// Never pull; creation fails if the image is missing.
    Never,
}

impl PullPolicy for PullStrategy {
    fn pull_if_exists(&self, _image: &str) -> bool {
        matches!(self, PullStrategy::Always)
    }

    fn pull_if_not_exists(&self, _image: &str) -> bool {
        matches!(self, PullStrategy::Always | PullStrategy::IfNotPresent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn always_pulls_regardless() {
        assert!(PullStrategy::Always.should_pull("alpine", true));
        assert!(PullStrategy::Always.should_pull("alpine", false));
    }

    #[test]
    fn if_not_present_skips_existing() {
        assert!(!PullStrategy::IfNotPresent.should_pull("alpine", true));
        assert!(PullStrategy::IfNotPresent.should_pull("alpine", false));
    }

    #[test]
    fn never_pulls_nothing() {
        assert!(!PullStrategy::Never.should_pull("alpine", true));
        assert!(!PullStrategy::Never.should_pull("alpine", false));
    }
}
