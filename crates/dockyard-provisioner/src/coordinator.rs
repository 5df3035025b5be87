//! Provisioning coordinator.
//!
//! Turns scheduler demand into planned units. A call walks the cloud's
//! reachable hosts once, admitting at most one container per host, and
//! returns as soon as the admitted lifecycles are spawned; each
//! [`PlannedUnit`] resolves later to the ready agent or the failure.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use dockyard_core::HostAddress;

use crate::agent::Agent;
use crate::cloud::Cloud;
use crate::error::{ProvisionError, ProvisionResult};
use crate::launcher::LauncherProvider;
use crate::ledger::{CapacityCaps, CapacityLedger};
use crate::lifecycle::ContainerLifecycle;

/// The eventual outcome of a spawned provisioning unit.
///
/// Dropping it detaches the work; [`cancel`](Self::cancel) aborts it and
/// releases its capacity reservation.
pub struct AgentFuture {
    handle: JoinHandle<ProvisionResult<Agent>>,
}

impl AgentFuture {
    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl fmt::Debug for AgentFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentFuture")
            .field("finished", &self.handle.is_finished())
            .finish()
    }
}

impl Future for AgentFuture {
    type Output = ProvisionResult<Agent>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx).map(|joined| match joined {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(ProvisionError::Cancelled),
            Err(e) => Err(ProvisionError::Panicked(e.to_string())),
        })
    }
}

/// Promise of future scheduler capacity.
#[derive(Debug)]
pub struct PlannedUnit {
    pub display_name: String,
    pub executors: u32,
    /// Host the unit was admitted on.
    pub host: HostAddress,
    future: AgentFuture,
}

impl PlannedUnit {
    pub fn cancel(&self) {
        self.future.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.future.is_finished()
    }

    pub fn into_future(self) -> AgentFuture {
        self.future
    }

    /// Wait for the agent.
    pub async fn wait(self) -> ProvisionResult<Agent> {
        self.future.await
    }
}

/// Capacity-aware provisioning for one cloud.
pub struct ProvisioningCoordinator {
    cloud: Arc<Cloud>,
    ledger: Arc<CapacityLedger>,
    launchers: Arc<dyn LauncherProvider>,
    runtime: Option<Handle>,
}

impl ProvisioningCoordinator {
    pub fn new(cloud: Arc<Cloud>, ledger: Arc<CapacityLedger>, launchers: Arc<dyn LauncherProvider>) -> Self {
        Self {
            cloud,
            ledger,
            launchers,
            runtime: None,
        }
    }

    /// Spawn units on `handle` instead of the ambient runtime.
    pub fn with_runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    pub fn cloud(&self) -> &Arc<Cloud> {
        &self.cloud
    }

    pub fn ledger(&self) -> &Arc<CapacityLedger> {
        &self.ledger
    }

    /// Plan up to `excess_workload` executors of capacity for `label`.
    ///
    /// Only a missing template is an error. Hosts that deny admission or
    /// fail their live count are skipped.
    pub async fn provision(
        &self,
        label: Option<&str>,
        excess_workload: i32,
    ) -> ProvisionResult<Vec<PlannedUnit>> {
        let config = self.cloud.config();
        let template = config
            .template_for_label(label)
            .cloned()
            .ok_or_else(|| ProvisionError::NoTemplate {
                cloud: config.name.clone(),
                label: label.map(str::to_string),
            })?;

        let caps = CapacityCaps {
            container_cap: config.container_cap,
            instance_cap: template.instance_cap,
        };
        let hosts = self.cloud.resolver().find_all().await;
        debug!(
            cloud = %config.name,
            label = label.unwrap_or_default(),
            excess_workload,
            candidates = hosts.len(),
            "provisioning"
        );

        let mut excess = excess_workload;
        let mut planned = Vec::new();
        for host in hosts {
            if excess <= 0 {
                break;
            }

            let reservation = match self
                .ledger
                .try_reserve(&host, &template.image, caps, self.cloud.engine().as_ref())
                .await
            {
                Ok(Some(reservation)) => reservation,
                Ok(None) => continue,
                Err(e) => {
                    warn!(cloud = %config.name, %host, error = %e, "skipping host");
                    continue;
                }
            };

            let launcher = self.launchers.launcher_for(&template);
            let lifecycle = ContainerLifecycle::new(
                Arc::clone(self.cloud.engine()),
                config.name.clone(),
                config.rollback,
            );
            let unit_host = host.clone();
            let unit_template = template.clone();
            let work = async move {
                let _reservation = reservation;
                lifecycle
                    .run(&unit_host, &unit_template, launcher.as_ref())
                    .await
                    .map_err(ProvisionError::from)
            };
            let handle = match &self.runtime {
                Some(runtime) => runtime.spawn(work),
                None => tokio::spawn(work),
            };

            info!(cloud = %config.name, %host, image = %template.image, "planned new agent");
            planned.push(PlannedUnit {
                display_name: template.display_name(),
                executors: template.executors,
                host,
                future: AgentFuture { handle },
            });
            excess = excess.saturating_sub(i32::try_from(template.executors).unwrap_or(i32::MAX));
        }

        Ok(planned)
    }

    /// Tear down an agent whose readiness failed or that is no longer wanted.
    pub async fn discard(&self, agent: &Agent) -> ProvisionResult<()> {
        agent.terminate().await?;
        Ok(())
    }

    /// Force-remove a container left behind by a failed readiness wait.
    pub async fn discard_container(&self, host: &HostAddress, container_id: &str) -> ProvisionResult<()> {
        self.cloud
            .engine()
            .remove_container(host, container_id, true)
            .await?;
        info!(cloud = %self.cloud.name(), %host, container = %container_id, "discarded container");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dockyard_core::{CloudConfig, PullStrategy, Template};
    use dockyard_discovery::HostResolver;
    use dockyard_engine::{ContainerInspection, ContainerSpec, EngineOp, InMemoryEngine};
    use std::time::Duration;
    use tokio::sync::Notify;

    use crate::error::{LifecycleError, LifecycleResult};
    use crate::launcher::{AgentLauncher, LauncherHandle};
    use crate::ledger::LedgerKey;

    /// Resolver answering with a fixed host list.
    struct FixedHosts(Vec<HostAddress>);

    #[async_trait]
    impl HostResolver for FixedHosts {
        async fn find_one(&self, _budget: Duration) -> HostAddress {
            self.0[0].clone()
        }

        async fn find_all(&self) -> Vec<HostAddress> {
            self.0.clone()
        }

        fn fallback(&self) -> &HostAddress {
            &self.0[0]
        }
    }

    /// Launcher whose readiness waits for the test to open a gate.
    struct GatedLauncher {
        gate: Option<Arc<Notify>>,
        ready: bool,
    }

    #[async_trait]
    impl AgentLauncher for GatedLauncher {
        fn append_container_config(&self, _t: &Template, _s: &mut ContainerSpec) -> LifecycleResult<()> {
            Ok(())
        }

        async fn wait_up(&self, _h: &HostAddress, _t: &Template, _i: &ContainerInspection) -> bool {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.ready
        }

        fn prepared_launcher(
            &self,
            _h: &HostAddress,
            _t: &Template,
            i: &ContainerInspection,
        ) -> LifecycleResult<LauncherHandle> {
            Ok(LauncherHandle::Attach {
                container_id: i.id.clone(),
                user: None,
            })
        }
    }

    struct TestLaunchers {
        gate: Option<Arc<Notify>>,
        ready: bool,
    }

    impl LauncherProvider for TestLaunchers {
        fn launcher_for(&self, _template: &Template) -> Arc<dyn AgentLauncher> {
            Arc::new(GatedLauncher {
                gate: self.gate.clone(),
                ready: self.ready,
            })
        }
    }

    fn host(n: u8) -> HostAddress {
        HostAddress::parse(&format!("tcp://10.0.0.{n}:2375")).unwrap()
    }

    fn caps(cap: u32) -> CapacityCaps {
        CapacityCaps {
            container_cap: cap,
            instance_cap: 0,
        }
    }

    struct Fixture {
        engine: Arc<InMemoryEngine>,
        ledger: Arc<CapacityLedger>,
        coordinator: ProvisioningCoordinator,
    }

    fn fixture(cap: u32, hosts: Vec<HostAddress>, template: Template, launchers: TestLaunchers) -> Fixture {
        let engine = Arc::new(InMemoryEngine::new());
        for h in &hosts {
            engine.add_host(h);
        }
        let config = CloudConfig::new("docker-local", "tcp://10.0.0.1:2375")
            .with_container_cap(cap)
            .with_template(template);
        let cloud = Arc::new(Cloud::new(config, Arc::new(FixedHosts(hosts)), engine.clone()));
        let ledger = Arc::new(CapacityLedger::new());
        let coordinator = ProvisioningCoordinator::new(cloud, ledger.clone(), Arc::new(launchers));
        Fixture {
            engine,
            ledger,
            coordinator,
        }
    }

    fn ready() -> TestLaunchers {
        TestLaunchers { gate: None, ready: true }
    }

    fn agent_template() -> Template {
        Template::new("agent").with_labels(["linux"])
    }

    #[tokio::test]
    async fn single_host_plans_one_unit_and_releases_after_lifecycle() {
        let gate = Arc::new(Notify::new());
        let f = fixture(
            2,
            vec![host(1)],
            agent_template(),
            TestLaunchers {
                gate: Some(gate.clone()),
                ready: true,
            },
        );

        let units = f.coordinator.provision(Some("linux"), 1).await.unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].display_name, "Image of agent");
        assert_eq!(units[0].executors, 1);
        assert!(format!("{:?}", units[0]).contains("finished: false"));
        assert_eq!(f.ledger.in_flight(&LedgerKey::Host(host(1))), 1);

        gate.notify_one();
        let agent = units.into_iter().next().unwrap().wait().await.unwrap();
        assert_eq!(agent.host, host(1));
        assert_eq!(f.ledger.in_flight(&LedgerKey::Host(host(1))), 0);
    }

    #[tokio::test]
    async fn host_at_live_cap_plans_nothing() {
        let f = fixture(2, vec![host(1)], agent_template(), ready());
        f.engine.add_running_container(&host(1), "agent");
        f.engine.add_running_container(&host(1), "agent");

        let units = f.coordinator.provision(Some("linux"), 1).await.unwrap();
        assert!(units.is_empty());
        assert!(f.ledger.snapshot().is_empty());
    }

    #[tokio::test]
    async fn saturated_first_host_moves_to_second() {
        let f = fixture(1, vec![host(1), host(2)], agent_template(), ready());
        let _held = f
            .ledger
            .try_reserve(&host(1), "agent", caps(1), f.engine.as_ref())
            .await
            .unwrap()
            .unwrap();

        let units = f.coordinator.provision(Some("linux"), 1).await.unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].host, host(2));
    }

    #[tokio::test]
    async fn all_hosts_saturated_plans_nothing() {
        let f = fixture(1, vec![host(1), host(2)], agent_template(), ready());
        let _a = f.ledger.try_reserve(&host(1), "agent", caps(1), f.engine.as_ref()).await.unwrap().unwrap();
        let _b = f.ledger.try_reserve(&host(2), "agent", caps(1), f.engine.as_ref()).await.unwrap().unwrap();

        let units = f.coordinator.provision(Some("linux"), 1).await.unwrap();
        assert!(units.is_empty());
        assert_eq!(f.engine.call_count(EngineOp::Create), 0);
    }

    #[tokio::test]
    async fn missing_template_is_a_config_error() {
        let f = fixture(2, vec![host(1)], agent_template(), ready());

        let err = f.coordinator.provision(Some("windows"), 1).await.unwrap_err();
        assert!(err.is_config_error());
        assert!(format!("{err:?}").contains("windows"));
        assert!(f.ledger.snapshot().is_empty());
        assert!(f.engine.calls().is_empty());
    }

    #[tokio::test]
    async fn present_image_is_not_pulled_unless_always() {
        let f = fixture(5, vec![host(1)], agent_template(), ready());
        f.engine.add_image(&host(1), "agent");
        let units = f.coordinator.provision(Some("linux"), 1).await.unwrap();
        for unit in units {
            unit.wait().await.unwrap();
        }
        assert_eq!(f.engine.call_count(EngineOp::Pull), 0);

        let f = fixture(
            5,
            vec![host(1)],
            agent_template().with_pull_strategy(PullStrategy::Always),
            ready(),
        );
        f.engine.add_image(&host(1), "agent");
        let units = f.coordinator.provision(Some("linux"), 1).await.unwrap();
        for unit in units {
            unit.wait().await.unwrap();
        }
        assert_eq!(f.engine.call_count(EngineOp::Pull), 1);
    }

    #[tokio::test]
    async fn one_admission_per_host_per_call() {
        let f = fixture(10, vec![host(1), host(2), host(3)], agent_template(), ready());

        let units = f.coordinator.provision(Some("linux"), 5).await.unwrap();
        assert_eq!(units.len(), 3);

        let f = fixture(10, vec![host(1), host(2), host(3)], agent_template(), ready());
        let units = f.coordinator.provision(Some("linux"), 2).await.unwrap();
        let hosts: Vec<_> = units.iter().map(|u| u.host.clone()).collect();
        assert_eq!(hosts, vec![host(1), host(2)]);
    }

    #[tokio::test]
    async fn executors_reduce_remaining_workload() {
        let template = agent_template().with_executors(4);
        let f = fixture(10, vec![host(1), host(2)], template, ready());

        let units = f.coordinator.provision(Some("linux"), 3).await.unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].executors, 4);
    }

    #[tokio::test]
    async fn huge_executor_count_ends_the_walk() {
        let template = agent_template().with_executors(u32::MAX);
        let f = fixture(10, vec![host(1), host(2), host(3)], template, ready());

        let units = f.coordinator.provision(Some("linux"), 5).await.unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].executors, u32::MAX);
    }

    #[tokio::test]
    async fn unreachable_host_is_skipped() {
        let f = fixture(10, vec![host(1), host(2)], agent_template(), ready());
        f.engine.fail(&host(1), EngineOp::ListContainers);

        let units = f.coordinator.provision(Some("linux"), 1).await.unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].host, host(2));
    }

    #[tokio::test]
    async fn every_failing_step_releases_the_ledger() {
        for op in [EngineOp::Pull, EngineOp::Create, EngineOp::Start, EngineOp::Inspect] {
            let f = fixture(10, vec![host(1)], agent_template(), ready());
            f.engine.fail(&host(1), op);

            let mut units = f.coordinator.provision(Some("linux"), 1).await.unwrap();
            let err = units.remove(0).wait().await.unwrap_err();
            assert!(matches!(err, ProvisionError::Lifecycle(_)), "{op:?}: {err}");
            assert!(f.ledger.snapshot().is_empty(), "{op:?} leaked a reservation");
        }

        let f = fixture(10, vec![host(1)], agent_template(), TestLaunchers { gate: None, ready: false });
        let mut units = f.coordinator.provision(Some("linux"), 1).await.unwrap();
        let err = units.remove(0).wait().await.unwrap_err();
        assert!(matches!(err, ProvisionError::Lifecycle(LifecycleError::NotReady { .. })));
        assert!(f.ledger.snapshot().is_empty());
    }

    #[tokio::test]
    async fn cancelling_a_unit_releases_the_ledger() {
        let gate = Arc::new(Notify::new());
        let f = fixture(
            10,
            vec![host(1)],
            agent_template(),
            TestLaunchers {
                gate: Some(gate),
                ready: true,
            },
        );

        let mut units = f.coordinator.provision(Some("linux"), 1).await.unwrap();
        let unit = units.remove(0);
        tokio::task::yield_now().await;
        assert_eq!(f.ledger.in_flight(&LedgerKey::Host(host(1))), 1);

        unit.cancel();
        let err = unit.wait().await.unwrap_err();
        assert!(matches!(err, ProvisionError::Cancelled));
        assert!(f.ledger.snapshot().is_empty());
    }

    #[tokio::test]
    async fn discard_removes_the_container() {
        let f = fixture(10, vec![host(1)], agent_template(), ready());
        let mut units = f.coordinator.provision(Some("linux"), 1).await.unwrap();
        let agent = units.remove(0).wait().await.unwrap();
        assert_eq!(f.engine.container_ids(&host(1)).len(), 1);

        f.coordinator.discard(&agent).await.unwrap();
        assert!(f.engine.container_ids(&host(1)).is_empty());
    }

    #[tokio::test]
    async fn discard_container_cleans_up_after_not_ready() {
        let f = fixture(10, vec![host(1)], agent_template(), TestLaunchers { gate: None, ready: false });
        let mut units = f.coordinator.provision(Some("linux"), 1).await.unwrap();
        let unit = units.remove(0);
        let unit_host = unit.host.clone();

        let Err(ProvisionError::Lifecycle(LifecycleError::NotReady { id })) = unit.wait().await else {
            panic!("expected a readiness failure");
        };
        assert_eq!(f.engine.container_ids(&host(1)), vec![id.clone()]);

        f.coordinator.discard_container(&unit_host, &id).await.unwrap();
        assert!(f.engine.container_ids(&host(1)).is_empty());
    }

    #[test]
    fn units_spawn_on_injected_runtime() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let f = fixture(10, vec![host(1)], agent_template(), ready());
        let coordinator = f.coordinator.with_runtime(runtime.handle().clone());

        let driver = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let agent = driver.block_on(async {
            let mut units = coordinator.provision(Some("linux"), 1).await.unwrap();
            units.remove(0).wait().await
        });
        assert!(agent.is_ok());
    }
}
