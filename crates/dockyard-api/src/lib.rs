//! dockyard-api — REST API for Dockyard.
//!
//! Management pass-through to the container engines, on-demand
//! provisioning, the node pool and the queue substitution protocol.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/clouds` | Configured clouds and their templates |
//! | GET | `/api/v1/hosts` | Reachable hosts per cloud with active container counts |
//! | GET | `/api/v1/hosts/{id}/containers` | Containers on a host |
//! | GET | `/api/v1/hosts/{id}/images` | Images on a host |
//! | POST | `/api/v1/hosts/{id}/containers/{container}/stop` | Stop a container |
//! | POST | `/api/v1/provision` | Plan agents for a label |
//! | GET | `/api/v1/ledger` | In-flight provisioning counts |
//! | GET | `/api/v1/agents` | Ready agents |
//! | DELETE | `/api/v1/agents/{name}` | Terminate an agent |
//! | POST | `/api/v1/presence/{container}` | An attached agent reports in |
//! | DELETE | `/api/v1/presence/{container}` | An attached agent went away |
//! | GET | `/api/v1/nodes` | Node pool |
//! | POST | `/api/v1/nodes` | Register a node |
//! | DELETE | `/api/v1/nodes/{name}` | Remove a node |
//! | POST | `/api/v1/nodes/{name}/heartbeat` | Node heartbeat |
//! | GET | `/api/v1/queue` | Queued items and active substitutions |
//! | POST | `/api/v1/queue/tasks` | Queue a task (enters the wait state) |
//! | DELETE | `/api/v1/queue/tasks/{id}` | A task left the queue |
//!
//! Host ids are URL-safe base64 of `{"cloudName":…,"hostUrl":…}`.

pub mod agents;
pub mod handlers;
pub mod queue_handlers;

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get, post};

use dockyard_discovery::NodeRegistry;
use dockyard_provisioner::{
    CapacityLedger, CloudRegistry, LauncherProvider, PresenceRegistry, ProvisioningCoordinator,
};
use dockyard_queue::{InMemoryQueue, LoggingNudge, QueueSubstitutionController};

pub use agents::AgentBook;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub clouds: CloudRegistry,
    /// One coordinator per cloud, by cloud name.
    pub coordinators: Arc<BTreeMap<String, Arc<ProvisioningCoordinator>>>,
    pub ledger: Arc<CapacityLedger>,
    pub nodes: Arc<NodeRegistry>,
    pub presence: Arc<PresenceRegistry>,
    pub queue: Arc<InMemoryQueue>,
    pub substitution: Arc<QueueSubstitutionController>,
    pub agents: AgentBook,
}

impl ApiState {
    /// State with a coordinator per cloud, all sharing `ledger`.
    pub fn new(
        clouds: CloudRegistry,
        ledger: Arc<CapacityLedger>,
        launchers: Arc<dyn LauncherProvider>,
    ) -> Self {
        let coordinators: BTreeMap<String, Arc<ProvisioningCoordinator>> = clouds
            .all()
            .iter()
            .map(|cloud| {
                let coordinator = ProvisioningCoordinator::new(
                    Arc::clone(cloud),
                    Arc::clone(&ledger),
                    Arc::clone(&launchers),
                );
                (cloud.name(), Arc::new(coordinator))
            })
            .collect();

        let queue = Arc::new(InMemoryQueue::new());
        let substitution = Arc::new(QueueSubstitutionController::new(
            clouds.clone(),
            queue.clone(),
            Arc::new(LoggingNudge),
        ));

        Self {
            clouds,
            coordinators: Arc::new(coordinators),
            ledger,
            nodes: Arc::new(NodeRegistry::new()),
            presence: Arc::new(PresenceRegistry::new()),
            queue,
            substitution,
            agents: AgentBook::default(),
        }
    }

    pub fn with_nodes(mut self, nodes: Arc<NodeRegistry>) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn with_presence(mut self, presence: Arc<PresenceRegistry>) -> Self {
        self.presence = presence;
        self
    }

    /// Use an externally wired queue and its substitution controller.
    pub fn with_queue(
        mut self,
        queue: Arc<InMemoryQueue>,
        substitution: Arc<QueueSubstitutionController>,
    ) -> Self {
        self.queue = queue;
        self.substitution = substitution;
        self
    }

    pub fn coordinator(&self, cloud: &str) -> Option<Arc<ProvisioningCoordinator>> {
        self.coordinators.get(cloud).cloned()
    }
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/clouds", get(handlers::list_clouds))
        .route("/hosts", get(handlers::list_hosts))
        .route("/hosts/{id}/containers", get(handlers::list_containers))
        .route("/hosts/{id}/images", get(handlers::list_images))
        .route("/hosts/{id}/containers/{container}/stop", post(handlers::stop_container))
        .route("/provision", post(handlers::provision))
        .route("/ledger", get(handlers::ledger_snapshot))
        .route("/agents", get(handlers::list_agents))
        .route("/agents/{name}", delete(handlers::terminate_agent))
        .route(
            "/presence/{container}",
            post(handlers::agent_connected).delete(handlers::agent_disconnected),
        )
        .route("/nodes", get(queue_handlers::list_nodes).post(queue_handlers::register_node))
        .route("/nodes/{name}", delete(queue_handlers::remove_node))
        .route("/nodes/{name}/heartbeat", post(queue_handlers::node_heartbeat))
        .route("/queue", get(queue_handlers::queue_status))
        .route("/queue/tasks", post(queue_handlers::enqueue_task))
        .route("/queue/tasks/{id}", delete(queue_handlers::task_left))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
