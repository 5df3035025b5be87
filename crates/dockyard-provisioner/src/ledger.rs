//! Capacity ledger: in-flight provisioning counts.
//!
//! The engine only reports a container once it exists, so every admission
//! that has not produced a container yet is counted here. Admission for a
//! host is serialized by a per-host async gate held across the live count
//! query and the increment; different hosts admit concurrently.
//!
//! ```text
//!   try_reserve(host, image)
//!      │
//!      ├─ gate[host].lock().await
//!      ├─ live = engine.list_containers(host)
//!      ├─ live + in_flight(Host)  >= container_cap ?  ─► Ok(None)
//!      ├─ live_img + in_flight(Image) >= instance_cap ? ─► Ok(None)
//!      └─ in_flight(Host) += 1, in_flight(Image) += 1 ─► Ok(Some(Reservation))
//!
//!   drop(Reservation) ─► in_flight -= 1 (floor 0, key removed at 0)
//! ```
//!
//! A host's gate is dropped from the map once no admission holds or
//! awaits it.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, info};

use dockyard_core::{HostAddress, ImageRef};
use dockyard_engine::{EngineClient, EngineResult};

/// What an in-flight count is tracked against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LedgerKey {
    Host(HostAddress),
    /// Normalized `repo:tag`.
    Image(String),
}

impl fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerKey::Host(host) => write!(f, "host:{host}"),
            LedgerKey::Image(image) => write!(f, "image:{image}"),
        }
    }
}

/// Limits checked at admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityCaps {
    /// Containers allowed per host.
    pub container_cap: u32,
    /// Containers allowed per image; 0 means unlimited.
    pub instance_cap: u32,
}

/// One row of [`CapacityLedger::snapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    pub key: String,
    pub in_flight: u32,
}

/// Process-wide in-flight counter shared by every coordinator handed it.
#[derive(Default)]
pub struct CapacityLedger {
    counts: Mutex<HashMap<LedgerKey, u32>>,
    gates: Mutex<HashMap<HostAddress, Arc<tokio::sync::Mutex<()>>>>,
}

impl CapacityLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current in-flight count for a key.
    pub fn in_flight(&self, key: &LedgerKey) -> u32 {
        self.counts().get(key).copied().unwrap_or(0)
    }

    /// Sorted view of every non-zero count.
    pub fn snapshot(&self) -> Vec<LedgerEntry> {
        let mut entries: Vec<LedgerEntry> = self
            .counts()
            .iter()
            .map(|(key, count)| LedgerEntry {
                key: key.to_string(),
                in_flight: *count,
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    /// Try to admit one more container of `image` on `host`.
    ///
    /// `Ok(None)` is a capacity denial. An error means the live count
    /// could not be read and nothing was reserved.
    pub async fn try_reserve(
        self: &Arc<Self>,
        host: &HostAddress,
        image: &str,
        caps: CapacityCaps,
        engine: &dyn EngineClient,
    ) -> EngineResult<Option<Reservation>> {
        let gate = self.gate(host);
        let admitted = {
            let _admission = gate.lock().await;
            self.admit(host, image, caps, engine).await
        };
        drop(gate);
        self.prune_gate(host);
        admitted
    }

    async fn admit(
        self: &Arc<Self>,
        host: &HostAddress,
        image: &str,
        caps: CapacityCaps,
        engine: &dyn EngineClient,
    ) -> EngineResult<Option<Reservation>> {
        let image = ImageRef::parse(image).full_name();
        let host_key = LedgerKey::Host(host.clone());
        let image_key = LedgerKey::Image(image.clone());

        let containers = engine.list_containers(host).await?;
        let live = containers.len() as u32;
        let estimated = live + self.in_flight(&host_key);
        if estimated >= caps.container_cap {
            info!(
                %host,
                live,
                estimated,
                cap = caps.container_cap,
                "host at container cap, not provisioning"
            );
            return Ok(None);
        }

        if caps.instance_cap != 0 {
            let live_for_image = containers
                .iter()
                .filter(|c| ImageRef::parse(&c.image).full_name() == image)
                .count() as u32;
            let estimated_image = live_for_image + self.in_flight(&image_key);
            if estimated_image >= caps.instance_cap {
                info!(
                    %host,
                    %image,
                    estimated = estimated_image,
                    cap = caps.instance_cap,
                    "image at instance cap, not provisioning"
                );
                return Ok(None);
            }
        }

        let keys = vec![host_key, image_key];
        {
            let mut counts = self.counts();
            for key in &keys {
                *counts.entry(key.clone()).or_insert(0) += 1;
            }
        }
        debug!(%host, %image, "capacity reserved");

        Ok(Some(Reservation {
            ledger: Arc::clone(self),
            keys: Some(keys),
        }))
    }

    fn gate(&self, host: &HostAddress) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = self.gates.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(gates.entry(host.clone()).or_default())
    }

    /// Clones are only taken under the map lock, so a count of one means
    /// nobody else holds or waits on the gate.
    fn prune_gate(&self, host: &HostAddress) {
        let mut gates = self.gates.lock().unwrap_or_else(|e| e.into_inner());
        if gates.get(host).is_some_and(|g| Arc::strong_count(g) == 1) {
            gates.remove(host);
        }
    }

    #[cfg(test)]
    fn gate_count(&self) -> usize {
        self.gates.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn counts(&self) -> std::sync::MutexGuard<'_, HashMap<LedgerKey, u32>> {
        self.counts.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(&self, keys: &[LedgerKey]) {
        let mut counts = self.counts();
        for key in keys {
            if let Some(count) = counts.get_mut(key) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    counts.remove(key);
                }
            }
        }
    }
}

/// An admitted slot. Dropping it releases the in-flight counts once.
pub struct Reservation {
    ledger: Arc<CapacityLedger>,
    keys: Option<Vec<LedgerKey>>,
}

impl Reservation {
    pub fn keys(&self) -> &[LedgerKey] {
        self.keys.as_deref().unwrap_or_default()
    }

    /// Release now instead of on drop.
    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if let Some(keys) = self.keys.take() {
            self.ledger.release(&keys);
            debug!(keys = ?keys, "capacity released");
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.release_once();
    }
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation").field("keys", &self.keys).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dockyard_engine::{EngineOp, InMemoryEngine};

    fn host(n: u8) -> HostAddress {
        HostAddress::parse(&format!("tcp://10.0.0.{n}:2375")).unwrap()
    }

    fn caps(container_cap: u32, instance_cap: u32) -> CapacityCaps {
        CapacityCaps {
            container_cap,
            instance_cap,
        }
    }

    #[tokio::test]
    async fn reserve_and_release_by_drop() {
        let ledger = Arc::new(CapacityLedger::new());
        let engine = InMemoryEngine::new();
        engine.add_host(&host(1));

        let reservation = ledger
            .try_reserve(&host(1), "agent", caps(2, 0), &engine)
            .await
            .unwrap()
            .expect("admitted");
        assert_eq!(ledger.in_flight(&LedgerKey::Host(host(1))), 1);
        assert_eq!(ledger.in_flight(&LedgerKey::Image("agent:latest".into())), 1);

        drop(reservation);
        assert_eq!(ledger.in_flight(&LedgerKey::Host(host(1))), 0);
        assert!(ledger.snapshot().is_empty());
    }

    #[tokio::test]
    async fn live_containers_count_against_cap() {
        let ledger = Arc::new(CapacityLedger::new());
        let engine = InMemoryEngine::new();
        engine.add_running_container(&host(1), "agent");
        engine.add_running_container(&host(1), "other");

        let denied = ledger
            .try_reserve(&host(1), "agent", caps(2, 0), &engine)
            .await
            .unwrap();
        assert!(denied.is_none());
        assert!(ledger.snapshot().is_empty());
    }

    #[tokio::test]
    async fn in_flight_counts_against_cap() {
        let ledger = Arc::new(CapacityLedger::new());
        let engine = InMemoryEngine::new();
        engine.add_host(&host(1));

        let first = ledger.try_reserve(&host(1), "agent", caps(1, 0), &engine).await.unwrap();
        assert!(first.is_some());
        let second = ledger.try_reserve(&host(1), "agent", caps(1, 0), &engine).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn instance_cap_spans_hosts() {
        let ledger = Arc::new(CapacityLedger::new());
        let engine = InMemoryEngine::new();
        engine.add_host(&host(1));
        engine.add_host(&host(2));

        let _held = ledger
            .try_reserve(&host(1), "agent:latest", caps(10, 1), &engine)
            .await
            .unwrap()
            .expect("admitted");
        let denied = ledger
            .try_reserve(&host(2), "agent", caps(10, 1), &engine)
            .await
            .unwrap();
        assert!(denied.is_none());

        let other_image = ledger
            .try_reserve(&host(2), "builder", caps(10, 1), &engine)
            .await
            .unwrap();
        assert!(other_image.is_some());
    }

    #[tokio::test]
    async fn live_image_count_against_instance_cap() {
        let ledger = Arc::new(CapacityLedger::new());
        let engine = InMemoryEngine::new();
        engine.add_running_container(&host(1), "agent:latest");

        let denied = ledger
            .try_reserve(&host(1), "agent", caps(10, 1), &engine)
            .await
            .unwrap();
        assert!(denied.is_none());
    }

    #[tokio::test]
    async fn live_query_failure_reserves_nothing() {
        let ledger = Arc::new(CapacityLedger::new());
        let engine = InMemoryEngine::new();
        engine.add_host(&host(1));
        engine.fail(&host(1), EngineOp::ListContainers);

        assert!(ledger.try_reserve(&host(1), "agent", caps(2, 0), &engine).await.is_err());
        assert!(ledger.snapshot().is_empty());
    }

    #[tokio::test]
    async fn explicit_release_is_not_repeated_on_drop() {
        let ledger = Arc::new(CapacityLedger::new());
        let engine = InMemoryEngine::new();
        engine.add_host(&host(1));

        let a = ledger.try_reserve(&host(1), "agent", caps(5, 0), &engine).await.unwrap().unwrap();
        let _b = ledger.try_reserve(&host(1), "agent", caps(5, 0), &engine).await.unwrap().unwrap();
        a.release();
        assert_eq!(ledger.in_flight(&LedgerKey::Host(host(1))), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reservations_never_exceed_cap() {
        let ledger = Arc::new(CapacityLedger::new());
        let engine = Arc::new(InMemoryEngine::new());
        engine.add_host(&host(1));
        engine.add_running_container(&host(1), "agent");
        let cap = 5;

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let ledger = ledger.clone();
            let engine = engine.clone();
            tasks.push(tokio::spawn(async move {
                let reservation = ledger
                    .try_reserve(&host(1), "agent", caps(cap, 0), engine.as_ref())
                    .await
                    .unwrap();
                let admitted = reservation.is_some();
                if admitted {
                    // live (1) + in-flight never passes the cap.
                    assert!(1 + ledger.in_flight(&LedgerKey::Host(host(1))) <= cap);
                }
                tokio::task::yield_now().await;
                drop(reservation);
                admitted
            }));
        }

        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap() {
                admitted += 1;
            }
        }
        assert!(admitted >= 1);
        assert!(ledger.snapshot().is_empty());
        assert_eq!(ledger.gate_count(), 0);
    }

    #[tokio::test]
    async fn host_gates_do_not_outlive_admission() {
        let ledger = Arc::new(CapacityLedger::new());
        let engine = InMemoryEngine::new();
        engine.add_host(&host(1));
        engine.add_running_container(&host(2), "agent");
        engine.add_host(&host(3));
        engine.fail(&host(3), EngineOp::ListContainers);

        let held = ledger.try_reserve(&host(1), "agent", caps(2, 0), &engine).await.unwrap();
        assert!(held.is_some());
        let denied = ledger.try_reserve(&host(2), "agent", caps(1, 0), &engine).await.unwrap();
        assert!(denied.is_none());
        assert!(ledger.try_reserve(&host(3), "agent", caps(2, 0), &engine).await.is_err());

        // A live reservation keeps its counts but not its gate.
        assert_eq!(ledger.in_flight(&LedgerKey::Host(host(1))), 1);
        assert_eq!(ledger.gate_count(), 0);
    }
}
