//! Book of agents provisioned through the API.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use dockyard_provisioner::{
    Agent, AgentSummary, LifecycleError, PlannedUnit, ProvisionError, ProvisioningCoordinator,
};

/// Ready agents by name.
#[derive(Clone, Default)]
pub struct AgentBook {
    agents: Arc<RwLock<BTreeMap<String, Arc<Agent>>>>,
}

impl AgentBook {
    pub async fn list(&self) -> Vec<AgentSummary> {
        self.agents.read().await.values().map(|a| a.summary()).collect()
    }

    pub async fn insert(&self, agent: Agent) {
        self.agents
            .write()
            .await
            .insert(agent.name.clone(), Arc::new(agent));
    }

    pub async fn restore(&self, agent: Arc<Agent>) {
        self.agents.write().await.insert(agent.name.clone(), agent);
    }

    /// Remove and return an agent.
    pub async fn take(&self, name: &str) -> Option<Arc<Agent>> {
        self.agents.write().await.remove(name)
    }

    /// Follow a planned unit to its end.
    ///
    /// Ready agents are recorded. A container whose agent never came up
    /// is discarded through the coordinator.
    pub fn track(&self, coordinator: Arc<ProvisioningCoordinator>, unit: PlannedUnit) {
        let book = self.clone();
        tokio::spawn(async move {
            let host = unit.host.clone();
            match unit.wait().await {
                Ok(agent) => {
                    info!(agent = %agent.name, "agent online");
                    book.insert(agent).await;
                }
                Err(ProvisionError::Lifecycle(LifecycleError::NotReady { id })) => {
                    if let Err(e) = coordinator.discard_container(&host, &id).await {
                        warn!(%host, container = %id, error = %e, "failed to discard container");
                    }
                }
                Err(e) => warn!(%host, error = %e, "planned agent failed"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use dockyard_core::{AttachLauncherConfig, CloudConfig, HostAddress, LauncherConfig, Template};
    use dockyard_discovery::{StaticHostResolver, TcpProbe};
    use dockyard_engine::{EngineOp, InMemoryEngine};
    use dockyard_provisioner::{CapacityLedger, Cloud, ConfiguredLaunchers, PresenceRegistry};

    const HOST: &str = "tcp://docker.host:2375";

    /// Coordinator whose attach agents get `timeout_secs` to report in.
    fn coordinator(
        engine: &Arc<InMemoryEngine>,
        presence: &Arc<PresenceRegistry>,
        timeout_secs: u64,
    ) -> Arc<ProvisioningCoordinator> {
        let host = HostAddress::parse(HOST).unwrap();
        engine.add_image(&host, "jenkins/agent");

        let launcher = AttachLauncherConfig {
            launch_timeout_secs: timeout_secs,
            ..Default::default()
        };
        let template = Template::new("jenkins/agent")
            .with_labels(["docker"])
            .with_launcher(LauncherConfig::Attach(launcher));
        let config = CloudConfig::new("docker-local", HOST).with_template(template);
        let cloud = Arc::new(Cloud::new(
            config,
            Arc::new(StaticHostResolver::new(host)),
            engine.clone(),
        ));
        let launchers = Arc::new(ConfiguredLaunchers::new(
            Arc::new(TcpProbe::new(Duration::from_millis(50))),
            presence.clone(),
        ));
        Arc::new(ProvisioningCoordinator::new(
            cloud,
            Arc::new(CapacityLedger::new()),
            launchers,
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn agent_that_never_attaches_is_discarded() {
        let engine = Arc::new(InMemoryEngine::new());
        let presence = Arc::new(PresenceRegistry::new());
        let coordinator = coordinator(&engine, &presence, 5);
        let host = HostAddress::parse(HOST).unwrap();
        let book = AgentBook::default();

        let units = coordinator.provision(Some("docker"), 1).await.unwrap();
        assert_eq!(units.len(), 1);
        for unit in units {
            book.track(coordinator.clone(), unit);
        }

        for _ in 0..30 {
            if engine.call_count(EngineOp::Remove) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        assert_eq!(engine.call_count(EngineOp::Remove), 1);
        assert!(engine.container_ids(&host).is_empty());
        assert!(book.list().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn attached_agent_is_recorded() {
        let engine = Arc::new(InMemoryEngine::new());
        let presence = Arc::new(PresenceRegistry::new());
        let coordinator = coordinator(&engine, &presence, 30);
        let host = HostAddress::parse(HOST).unwrap();
        let book = AgentBook::default();

        let units = coordinator.provision(Some("docker"), 1).await.unwrap();
        for unit in units {
            book.track(coordinator.clone(), unit);
        }

        for _ in 0..30 {
            if let Some(id) = engine.container_ids(&host).first() {
                presence.mark_connected(id);
            }
            if !book.list().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        assert_eq!(book.list().await.len(), 1);
        assert_eq!(engine.call_count(EngineOp::Remove), 0);
    }
}
