//! Host resolution strategies.
//!
//! ```text
//!   find_all():  probe(dyn_1) ─ probe(dyn_2) ─ … ─ probe(fallback)
//!                keep the reachable ones, fallback always last
//!
//!   find_one():  ┌─► probe round over dyn_* ── ready? ──► host
//!                │        │ none
//!                └─ sleep(retry_interval) ◄── budget left?
//!                                               │ no
//!                                               ▼
//!                                            fallback
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info};

use dockyard_core::{CloudConfig, ConfigResult, HostAddress, ProvisioningSettings};

use crate::pool::NodePool;
use crate::probe::ConnectivityProbe;

/// Produces candidate engine hosts for a cloud.
#[async_trait]
pub trait HostResolver: Send + Sync {
    /// First host found ready within `budget`, else the fallback.
    async fn find_one(&self, budget: Duration) -> HostAddress;

    /// Every reachable host, fallback last.
    async fn find_all(&self) -> Vec<HostAddress>;

    /// The static fallback host.
    fn fallback(&self) -> &HostAddress;
}

// ── Label-based discovery ──────────────────────────────────────────

/// Finds hosts among online pool nodes carrying a discovery label.
///
/// Dynamic hosts inherit the scheme and port of the fallback address.
pub struct LabelHostResolver {
    label: String,
    fallback: HostAddress,
    pool: Arc<dyn NodePool>,
    probe: Arc<dyn ConnectivityProbe>,
    retry_interval: Duration,
}

impl LabelHostResolver {
    pub fn new(
        label: impl Into<String>,
        fallback: HostAddress,
        pool: Arc<dyn NodePool>,
        probe: Arc<dyn ConnectivityProbe>,
    ) -> Self {
        Self {
            label: label.into(),
            fallback,
            pool,
            probe,
            retry_interval: Duration::from_secs(10),
        }
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Candidate addresses in discovery order.
    fn dynamic_hosts(&self) -> Vec<HostAddress> {
        self.pool
            .nodes_with_label(&self.label)
            .into_iter()
            .filter(|node| node.is_online())
            .filter_map(|node| node.address)
            .map(|address| self.fallback.with_host(address))
            .collect()
    }

    async fn first_ready(&self) -> Option<HostAddress> {
        for host in self.dynamic_hosts() {
            if self.probe.probe(&host).await {
                return Some(host);
            }
        }
        None
    }
}

#[async_trait]
impl HostResolver for LabelHostResolver {
    async fn find_one(&self, budget: Duration) -> HostAddress {
        let deadline = Instant::now() + budget;

        loop {
            if let Some(host) = self.first_ready().await {
                info!(label = %self.label, %host, "found ready host");
                return host;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                info!(
                    label = %self.label,
                    fallback = %self.fallback,
                    "no dynamic host ready within budget, using fallback"
                );
                return self.fallback.clone();
            }

            debug!(label = %self.label, "no ready host yet, retrying");
            tokio::time::sleep(self.retry_interval.min(remaining)).await;
        }
    }

    async fn find_all(&self) -> Vec<HostAddress> {
        let mut seen = HashSet::new();
        let mut reachable = Vec::new();

        let mut candidates = self.dynamic_hosts();
        candidates.push(self.fallback.clone());

        for host in candidates {
            if !seen.insert(host.clone()) {
                continue;
            }
            if self.probe.probe(&host).await {
                reachable.push(host);
            }
        }

        // Fallback last even if a node advertised the same address.
        if let Some(pos) = reachable.iter().position(|h| h == &self.fallback) {
            let fallback = reachable.remove(pos);
            reachable.push(fallback);
        }

        debug!(label = %self.label, count = reachable.len(), "resolved hosts");
        reachable
    }

    fn fallback(&self) -> &HostAddress {
        &self.fallback
    }
}

// ── Static ─────────────────────────────────────────────────────────

/// Always answers with the fallback, no probing.
pub struct StaticHostResolver {
    fallback: HostAddress,
}

impl StaticHostResolver {
    pub fn new(fallback: HostAddress) -> Self {
        Self { fallback }
    }
}

#[async_trait]
impl HostResolver for StaticHostResolver {
    async fn find_one(&self, _budget: Duration) -> HostAddress {
        self.fallback.clone()
    }

    async fn find_all(&self) -> Vec<HostAddress> {
        vec![self.fallback.clone()]
    }

    fn fallback(&self) -> &HostAddress {
        &self.fallback
    }
}

/// Pick the resolver variant a cloud's config asks for.
pub fn build_resolver(
    cloud: &CloudConfig,
    pool: Arc<dyn NodePool>,
    probe: Arc<dyn ConnectivityProbe>,
    settings: &ProvisioningSettings,
) -> ConfigResult<Arc<dyn HostResolver>> {
    let fallback = cloud.fallback_address()?;
    let resolver: Arc<dyn HostResolver> = match cloud.discovery_label.as_deref() {
        Some(label) if !label.trim().is_empty() => Arc::new(
            LabelHostResolver::new(label, fallback, pool, probe)
                .with_retry_interval(settings.retry_interval()),
        ),
        _ => Arc::new(StaticHostResolver::new(fallback)),
    };
    Ok(resolver)
}
