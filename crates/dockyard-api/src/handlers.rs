//! REST API handlers for clouds, engine hosts, provisioning and agents.
//!
//! Host-scoped routes carry an opaque host id so that a unix socket path
//! or a `tcp://` URL survives a single path segment.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use dockyard_core::{CloudConfig, HostAddress};
use dockyard_discovery::NodePool;
use dockyard_engine::EngineError;
use dockyard_provisioner::{Cloud, ProvisioningCoordinator};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
pub(crate) struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub(crate) fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

pub(crate) fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn engine_error_response(e: &EngineError) -> axum::response::Response {
    let status = match e {
        EngineError::ContainerNotFound(_) | EngineError::ImageNotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::BAD_GATEWAY,
    };
    error_response(&e.to_string(), status).into_response()
}

// ── Host ids ───────────────────────────────────────────────────

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HostId {
    cloud_name: String,
    host_url: String,
}

/// Encode a cloud/host pair as a path-safe id.
pub fn encode_host_id(cloud: &str, host: &HostAddress) -> String {
    let id = HostId {
        cloud_name: cloud.to_string(),
        host_url: host.to_string(),
    };
    // A struct of two strings always serializes.
    let json = serde_json::to_vec(&id).unwrap_or_default();
    URL_SAFE_NO_PAD.encode(json)
}

/// Decode a host id back to `(cloud name, host)`.
pub fn decode_host_id(id: &str) -> Option<(String, HostAddress)> {
    let bytes = URL_SAFE_NO_PAD.decode(id).ok()?;
    let id: HostId = serde_json::from_slice(&bytes).ok()?;
    let host = HostAddress::parse(&id.host_url).ok()?;
    Some((id.cloud_name, host))
}

/// Whether `host` belongs to `cloud`: its fallback, or an online pool
/// node carrying the cloud's discovery label.
fn is_cloud_host(state: &ApiState, cloud: &Cloud, host: &HostAddress) -> bool {
    let config = cloud.config();
    let Ok(fallback) = config.fallback_address() else {
        return false;
    };
    if *host == fallback {
        return true;
    }
    let Some(label) = config.discovery_label.as_deref() else {
        return false;
    };
    state
        .nodes
        .nodes_with_label(label)
        .into_iter()
        .filter(|node| node.is_online())
        .filter_map(|node| node.address)
        .any(|address| fallback.with_host(address) == *host)
}

/// Resolve a host id to its cloud, or an error response.
fn host_target(
    state: &ApiState,
    id: &str,
) -> Result<(Arc<Cloud>, HostAddress), axum::response::Response> {
    let Some((cloud_name, host)) = decode_host_id(id) else {
        return Err(error_response("invalid host id", StatusCode::BAD_REQUEST).into_response());
    };
    let Some(cloud) = state.clouds.get(&cloud_name) else {
        return Err(error_response(
            &format!("unknown cloud: {cloud_name}"),
            StatusCode::NOT_FOUND,
        )
        .into_response());
    };
    if !is_cloud_host(state, &cloud, &host) {
        warn!(cloud = %cloud_name, %host, "host id names a host outside the cloud");
        return Err(error_response(
            &format!("unknown host: {host}"),
            StatusCode::NOT_FOUND,
        )
        .into_response());
    }
    Ok((cloud, host))
}

// ── Clouds ─────────────────────────────────────────────────────

/// GET /api/v1/clouds
pub async fn list_clouds(State(state): State<ApiState>) -> impl IntoResponse {
    let clouds: Vec<CloudConfig> = state.clouds.all().iter().map(|c| c.config()).collect();
    ApiResponse::ok(clouds)
}

// ── Hosts ──────────────────────────────────────────────────────

/// One reachable engine host.
#[derive(Debug, Serialize)]
pub struct HostView {
    pub id: String,
    pub cloud: String,
    pub url: String,
    /// `"(n)"` running containers, or `"Error"` when the count failed.
    pub active: String,
}

/// GET /api/v1/hosts
pub async fn list_hosts(State(state): State<ApiState>) -> impl IntoResponse {
    let mut views = Vec::new();
    for cloud in state.clouds.all() {
        let name = cloud.name();
        for host in cloud.resolver().find_all().await {
            let active = match cloud.engine().list_containers(&host).await {
                Ok(containers) => format!("({})", containers.len()),
                Err(e) => {
                    warn!(cloud = %name, %host, error = %e, "active count failed");
                    "Error".to_string()
                }
            };
            views.push(HostView {
                id: encode_host_id(&name, &host),
                cloud: name.clone(),
                url: host.to_string(),
                active,
            });
        }
    }
    ApiResponse::ok(views)
}

/// GET /api/v1/hosts/:id/containers
pub async fn list_containers(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let (cloud, host) = match host_target(&state, &id) {
        Ok(target) => target,
        Err(resp) => return resp,
    };
    match cloud.engine().list_containers(&host).await {
        Ok(containers) => ApiResponse::ok(containers).into_response(),
        Err(e) => engine_error_response(&e),
    }
}

/// GET /api/v1/hosts/:id/images
pub async fn list_images(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let (cloud, host) = match host_target(&state, &id) {
        Ok(target) => target,
        Err(resp) => return resp,
    };
    match cloud.engine().list_images(&host).await {
        Ok(images) => ApiResponse::ok(images).into_response(),
        Err(e) => engine_error_response(&e),
    }
}

/// POST /api/v1/hosts/:id/containers/:container/stop
pub async fn stop_container(
    State(state): State<ApiState>,
    Path((id, container)): Path<(String, String)>,
) -> impl IntoResponse {
    let (cloud, host) = match host_target(&state, &id) {
        Ok(target) => target,
        Err(resp) => return resp,
    };
    match cloud.engine().stop_container(&host, &container).await {
        Ok(()) => {
            info!(cloud = %cloud.name(), %host, %container, "container stopped via api");
            ApiResponse::ok(serde_json::json!({ "stopped": container })).into_response()
        }
        Err(e) => engine_error_response(&e),
    }
}

// ── Provisioning ───────────────────────────────────────────────

fn default_workload() -> i32 {
    1
}

/// Request body for POST /api/v1/provision.
#[derive(Debug, Deserialize)]
pub struct ProvisionRequest {
    /// Cloud to use; the first cloud serving `label` when absent.
    #[serde(default)]
    pub cloud: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default = "default_workload")]
    pub workload: i32,
}

/// A unit of capacity the coordinator committed to.
#[derive(Debug, Serialize)]
pub struct PlannedView {
    pub display_name: String,
    pub executors: u32,
    pub host: String,
}

fn pick_coordinator(
    state: &ApiState,
    req: &ProvisionRequest,
) -> Result<Arc<ProvisioningCoordinator>, axum::response::Response> {
    let name = match &req.cloud {
        Some(name) => name.clone(),
        None => match state.clouds.for_label(req.label.as_deref()) {
            Some(cloud) => cloud.name(),
            None => {
                let msg = format!(
                    "no cloud can provision label {}",
                    req.label.as_deref().unwrap_or("<none>")
                );
                return Err(error_response(&msg, StatusCode::BAD_REQUEST).into_response());
            }
        },
    };
    state.coordinator(&name).ok_or_else(|| {
        error_response(&format!("unknown cloud: {name}"), StatusCode::NOT_FOUND).into_response()
    })
}

/// POST /api/v1/provision
pub async fn provision(
    State(state): State<ApiState>,
    Json(req): Json<ProvisionRequest>,
) -> impl IntoResponse {
    let coordinator = match pick_coordinator(&state, &req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    match coordinator.provision(req.label.as_deref(), req.workload).await {
        Ok(units) => {
            let views: Vec<PlannedView> = units
                .iter()
                .map(|u| PlannedView {
                    display_name: u.display_name.clone(),
                    executors: u.executors,
                    host: u.host.to_string(),
                })
                .collect();
            for unit in units {
                state.agents.track(Arc::clone(&coordinator), unit);
            }
            (StatusCode::ACCEPTED, ApiResponse::ok(views)).into_response()
        }
        Err(e) if e.is_config_error() => {
            error_response(&e.to_string(), StatusCode::BAD_REQUEST).into_response()
        }
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// GET /api/v1/ledger
pub async fn ledger_snapshot(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.ledger.snapshot())
}

// ── Agents ─────────────────────────────────────────────────────

/// GET /api/v1/agents
pub async fn list_agents(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.agents.list().await)
}

/// DELETE /api/v1/agents/:name
pub async fn terminate_agent(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    let Some(agent) = state.agents.take(&name).await else {
        return error_response("agent not found", StatusCode::NOT_FOUND).into_response();
    };
    match agent.terminate().await {
        Ok(()) => ApiResponse::ok(agent.summary()).into_response(),
        Err(e) => {
            warn!(agent = %agent.name, error = %e, "terminate failed");
            // Keep it listed so the operator can retry.
            state.agents.restore(agent).await;
            engine_error_response(&e)
        }
    }
}

/// POST /api/v1/presence/:container
pub async fn agent_connected(
    State(state): State<ApiState>,
    Path(container): Path<String>,
) -> impl IntoResponse {
    state.presence.mark_connected(&container);
    ApiResponse::ok(container)
}

/// DELETE /api/v1/presence/:container
pub async fn agent_disconnected(
    State(state): State<ApiState>,
    Path(container): Path<String>,
) -> impl IntoResponse {
    if state.presence.mark_disconnected(&container) {
        ApiResponse::ok(container).into_response()
    } else {
        error_response("agent not connected", StatusCode::NOT_FOUND).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use dockyard_core::{AttachLauncherConfig, LauncherConfig, Template};
    use dockyard_discovery::{NodeRegistry, StaticHostResolver, TcpProbe};
    use dockyard_engine::{EngineOp, InMemoryEngine};
    use dockyard_provisioner::{CapacityLedger, CloudRegistry, ConfiguredLaunchers, PresenceRegistry};
    use std::time::Duration;

    const HOST: &str = "tcp://docker.host:2375";

    struct Fixture {
        state: ApiState,
        engine: Arc<InMemoryEngine>,
        host: HostAddress,
    }

    fn cloud_config() -> CloudConfig {
        let template = Template::new("jenkins/agent")
            .with_labels(["docker"])
            .with_launcher(LauncherConfig::Attach(AttachLauncherConfig::default()));
        CloudConfig::new("docker-local", HOST)
            .with_container_cap(2)
            .with_template(template)
    }

    fn fixture_with(config: CloudConfig) -> Fixture {
        let host = HostAddress::parse(HOST).unwrap();
        let engine = Arc::new(InMemoryEngine::new());
        engine.add_host(&host);

        let cloud = Arc::new(Cloud::new(
            config,
            Arc::new(StaticHostResolver::new(host.clone())),
            engine.clone(),
        ));
        let clouds = CloudRegistry::new().with_cloud(cloud);

        let presence = Arc::new(PresenceRegistry::new());
        let launchers = Arc::new(ConfiguredLaunchers::new(
            Arc::new(TcpProbe::new(Duration::from_millis(50))),
            presence.clone(),
        ));
        let state = ApiState::new(clouds, Arc::new(CapacityLedger::new()), launchers)
            .with_presence(presence);
        Fixture { state, engine, host }
    }

    fn fixture() -> Fixture {
        fixture_with(cloud_config())
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn host_id_round_trips_unix_socket() {
        let host = HostAddress::parse("unix:///var/run/docker.sock").unwrap();
        let id = encode_host_id("local", &host);
        assert!(!id.contains('/'));
        assert!(!id.contains('='));
        assert_eq!(decode_host_id(&id), Some(("local".to_string(), host)));
    }

    #[test]
    fn host_id_uses_camel_case_json() {
        let host = HostAddress::parse(HOST).unwrap();
        let bytes = URL_SAFE_NO_PAD.decode(encode_host_id("c", &host)).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["cloudName"], "c");
        assert_eq!(json["hostUrl"], HOST);
    }

    #[test]
    fn garbage_host_id_is_rejected() {
        assert!(decode_host_id("not base64!").is_none());
        assert!(decode_host_id(&URL_SAFE_NO_PAD.encode(b"{}")).is_none());
    }

    #[tokio::test]
    async fn list_clouds_returns_templates() {
        let f = fixture();
        let resp = list_clouds(State(f.state)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["data"][0]["name"], "docker-local");
        assert_eq!(json["data"][0]["templates"][0]["image"], "jenkins/agent");
    }

    #[tokio::test]
    async fn list_hosts_reports_active_count() {
        let f = fixture();
        f.engine.add_running_container(&f.host, "jenkins/agent");

        let resp = list_hosts(State(f.state)).await.into_response();
        let json = body_json(resp).await;
        assert_eq!(json["data"][0]["url"], HOST);
        assert_eq!(json["data"][0]["active"], "(1)");
    }

    #[tokio::test]
    async fn list_hosts_reports_error_when_count_fails() {
        let f = fixture();
        f.engine.fail(&f.host, EngineOp::ListContainers);

        let resp = list_hosts(State(f.state)).await.into_response();
        let json = body_json(resp).await;
        assert_eq!(json["data"][0]["active"], "Error");
    }

    #[tokio::test]
    async fn host_containers_and_images() {
        let f = fixture();
        f.engine.add_image(&f.host, "jenkins/agent");
        f.engine.add_running_container(&f.host, "jenkins/agent");
        let id = encode_host_id("docker-local", &f.host);

        let resp = list_containers(State(f.state.clone()), Path(id.clone()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["data"].as_array().unwrap().len(), 1);

        let resp = list_images(State(f.state), Path(id)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn host_routes_validate_id_and_cloud() {
        let f = fixture();
        let resp = list_containers(State(f.state.clone()), Path("%%%".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let id = encode_host_id("nope", &f.host);
        let resp = list_images(State(f.state), Path(id)).await.into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn host_outside_the_cloud_is_not_found() {
        let f = fixture();
        let elsewhere = HostAddress::parse("tcp://evil.example:2375").unwrap();
        f.engine.add_running_container(&elsewhere, "jenkins/agent");
        let id = encode_host_id("docker-local", &elsewhere);

        let resp = list_containers(State(f.state.clone()), Path(id.clone()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let container = f.engine.container_ids(&elsewhere).remove(0);
        let resp = stop_container(State(f.state), Path((id, container)))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(f.engine.calls().iter().all(|c| c.host != elsewhere));
    }

    #[tokio::test]
    async fn discovered_pool_node_is_a_cloud_host() {
        let mut f = fixture_with(cloud_config().with_discovery_label("docker-hosts"));
        let nodes = Arc::new(NodeRegistry::new());
        nodes.register("n1", Some("10.0.0.9".into()), vec!["docker-hosts".into()]);
        nodes.register("n2", Some("10.0.0.10".into()), vec!["other".into()]);
        f.state = f.state.with_nodes(nodes);

        let discovered = HostAddress::parse("tcp://10.0.0.9:2375").unwrap();
        f.engine.add_host(&discovered);
        let resp = list_containers(
            State(f.state.clone()),
            Path(encode_host_id("docker-local", &discovered)),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        let unlabelled = HostAddress::parse("tcp://10.0.0.10:2375").unwrap();
        f.engine.add_host(&unlabelled);
        let resp = list_containers(State(f.state), Path(encode_host_id("docker-local", &unlabelled)))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn engine_failure_maps_to_bad_gateway() {
        let f = fixture();
        f.engine.fail(&f.host, EngineOp::ListImages);
        let id = encode_host_id("docker-local", &f.host);
        let resp = list_images(State(f.state), Path(id)).await.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn stop_unknown_container_is_not_found() {
        let f = fixture();
        let id = encode_host_id("docker-local", &f.host);
        let resp = stop_container(State(f.state), Path((id, "deadbeef".to_string())))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn stop_running_container() {
        let f = fixture();
        let container = f.engine.add_running_container(&f.host, "jenkins/agent");
        let id = encode_host_id("docker-local", &f.host);
        let resp = stop_container(State(f.state), Path((id, container)))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(f.engine.call_count(EngineOp::Stop), 1);
    }

    #[tokio::test]
    async fn provision_plans_units_and_holds_ledger() {
        let f = fixture();
        let req = ProvisionRequest {
            cloud: None,
            label: Some("docker".to_string()),
            workload: 1,
        };
        let resp = provision(State(f.state.clone()), Json(req)).await.into_response();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let json = body_json(resp).await;
        assert_eq!(json["data"][0]["display_name"], "Image of jenkins/agent");
        assert_eq!(json["data"][0]["executors"], 1);
        assert_eq!(json["data"][0]["host"], HOST);
    }

    #[tokio::test]
    async fn provision_unknown_label_is_bad_request() {
        let f = fixture();
        let req = ProvisionRequest {
            cloud: None,
            label: Some("windows".to_string()),
            workload: 1,
        };
        let resp = provision(State(f.state.clone()), Json(req)).await.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let req = ProvisionRequest {
            cloud: Some("docker-local".to_string()),
            label: Some("windows".to_string()),
            workload: 1,
        };
        let resp = provision(State(f.state), Json(req)).await.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn provision_unknown_cloud_is_not_found() {
        let f = fixture();
        let req = ProvisionRequest {
            cloud: Some("elsewhere".to_string()),
            label: None,
            workload: 1,
        };
        let resp = provision(State(f.state), Json(req)).await.into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn terminate_unknown_agent() {
        let f = fixture();
        let resp = terminate_agent(State(f.state), Path("abc@docker-local".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn presence_connect_and_disconnect() {
        let f = fixture();
        let resp = agent_connected(State(f.state.clone()), Path("c1".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = agent_disconnected(State(f.state.clone()), Path("c1".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = agent_disconnected(State(f.state), Path("c1".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
