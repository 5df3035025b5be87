//! Daemon assembly for `dockyardd`.
//!
//! Wires configuration into live subsystems:
//!
//! ```text
//!   dockyard.toml ──► NodeRegistry (static seed)
//!                 ──► per cloud: engine + resolver ──► Cloud ──► CloudRegistry
//!                 ──► CapacityLedger (shared by all clouds)
//!                 ──► InMemoryQueue + substitution controller
//!                                  │
//!                                  └─► dispatcher runs HostProvisioningTasks
//! ```

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use dockyard_api::ApiState;
use dockyard_core::DockyardConfig;
use dockyard_discovery::{NodeRegistry, TcpProbe, build_resolver};
use dockyard_engine::{DockerEngine, EngineClient, InMemoryEngine};
use dockyard_provisioner::{CapacityLedger, Cloud, CloudRegistry, ConfiguredLaunchers, PresenceRegistry};
use dockyard_queue::{HostProvisioningTask, InMemoryQueue, LoggingNudge, QueueSubstitutionController};

/// Which container engine the clouds talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineMode {
    /// Real Docker daemons via bollard.
    Docker,
    /// An in-process engine that knows each cloud's fallback host.
    DryRun,
}

/// Everything `serve` needs, before any task is spawned.
pub struct Assembly {
    pub state: ApiState,
    pub provisioning: mpsc::UnboundedReceiver<Arc<HostProvisioningTask>>,
}

fn engine_for(cloud: &dockyard_core::CloudConfig, mode: EngineMode) -> anyhow::Result<Arc<dyn EngineClient>> {
    let engine: Arc<dyn EngineClient> = match mode {
        EngineMode::Docker => Arc::new(DockerEngine::for_cloud(cloud)),
        EngineMode::DryRun => {
            let engine = InMemoryEngine::new();
            engine.add_host(&cloud.fallback_address()?);
            Arc::new(engine)
        }
    };
    Ok(engine)
}

/// Build the shared state from a validated configuration.
pub fn assemble(config: &DockyardConfig, mode: EngineMode) -> anyhow::Result<Assembly> {
    let settings = &config.provisioning;
    let nodes = Arc::new(
        NodeRegistry::from_config(&config.nodes).with_dead_after(settings.node_dead_after()),
    );
    let probe = Arc::new(TcpProbe::new(settings.probe_timeout()));

    let mut clouds = CloudRegistry::new();
    for cloud_config in &config.clouds {
        let resolver = build_resolver(cloud_config, nodes.clone(), probe.clone(), settings)?;
        let engine = engine_for(cloud_config, mode)?;
        info!(
            cloud = %cloud_config.name,
            templates = cloud_config.templates.len(),
            discovery_label = cloud_config.discovery_label.as_deref().unwrap_or_default(),
            ?mode,
            "cloud configured"
        );
        clouds.push(Arc::new(Cloud::new(cloud_config.clone(), resolver, engine)));
    }

    let presence = Arc::new(PresenceRegistry::new());
    let launchers = Arc::new(ConfiguredLaunchers::new(probe, presence.clone()));
    let ledger = Arc::new(CapacityLedger::new());

    let (queue, provisioning) = InMemoryQueue::with_dispatcher();
    let queue = Arc::new(queue);
    let controller = Arc::new(
        QueueSubstitutionController::new(clouds.clone(), queue.clone(), Arc::new(LoggingNudge))
            .with_budget(settings.find_one_budget()),
    );

    let state = ApiState::new(clouds, ledger, launchers)
        .with_nodes(nodes)
        .with_presence(presence)
        .with_queue(queue, controller);

    Ok(Assembly { state, provisioning })
}

/// Run host-provisioning tasks as they are scheduled.
///
/// Each task runs on its own; when it ends it has left the queue, which
/// the controller is told about. Stops taking new work on shutdown.
pub fn spawn_dispatcher(
    mut provisioning: mpsc::UnboundedReceiver<Arc<HostProvisioningTask>>,
    controller: Arc<QueueSubstitutionController>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                next = provisioning.recv() => {
                    let Some(task) = next else { break };
                    let controller = controller.clone();
                    debug!(task = %task.id(), "dispatching host provisioning");
                    tokio::spawn(async move {
                        let host = task.run().await;
                        controller.on_left(task.id());
                        if let Some(host) = host {
                            debug!(task = %task.id(), %host, "host provisioning finished");
                        }
                    });
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("dispatcher stopped");
    })
}
