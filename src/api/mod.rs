//! HTTP API: public check intake and progress, agent-facing result and
//! heartbeat ingestion, the WebSocket event stream, and the Basic-auth
//! admin surface for agent lifecycle.

use crate::{
    config::{ApiConfig, Config},
    coordinator::{ResultSubmission, TaskCoordinator, TaskProgress},
    hub::EventHub,
    models::{AgentRecord, Event},
    registry::AgentRegistry,
    ProbeMeshError, Result,
};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct ApiServer {
    config: ApiConfig,
    coordinator: TaskCoordinator,
    registry: AgentRegistry,
    hub: EventHub,
}

#[derive(Debug, Deserialize)]
pub struct CheckRequest {
    pub target: String,
    #[serde(default)]
    pub methods: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckResponse {
    pub task_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct HeartbeatRequest {
    token: String,
}

#[derive(Debug, Deserialize, Serialize)]
struct AgentLogRequest {
    #[serde(default)]
    task_id: String,
    #[serde(default)]
    agent_id: String,
    #[serde(default)]
    region: String,
    #[serde(default)]
    stage: String,
    #[serde(default)]
    message: String,
}

/// Public view of an agent; never exposes the token.
#[derive(Debug, Serialize, Deserialize)]
pub struct PublicAgentView {
    pub name: String,
    pub region: String,
    pub ip: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub online: bool,
    pub tasks_completed: i64,
}

/// Admin view; still only the token tail.
#[derive(Debug, Serialize, Deserialize)]
struct AdminAgentView {
    id: Uuid,
    name: String,
    region: String,
    ip: Option<String>,
    token_tail: String,
    revoked: bool,
    tasks_completed: i64,
    last_heartbeat: Option<DateTime<Utc>>,
    online: bool,
}

#[derive(Debug, Deserialize)]
struct AdminCreateRequest {
    name: String,
    region: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct AdminCreateResponse {
    id: Uuid,
    token: String,
    token_tail: String,
    run_cmd: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ResetTokenResponse {
    id: Uuid,
    token: String,
    token_tail: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl IntoResponse for ProbeMeshError {
    fn into_response(self) -> Response {
        let status = match &self {
            ProbeMeshError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProbeMeshError::Unauthorized => StatusCode::UNAUTHORIZED,
            ProbeMeshError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        // Internal failure details stay server-side.
        let error = if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!("request failed: {}", self);
            "internal server error".to_string()
        } else {
            self.to_string()
        };
        (status, Json(ErrorResponse { error })).into_response()
    }
}

impl ApiServer {
    pub fn new(
        config: Config,
        coordinator: TaskCoordinator,
        registry: AgentRegistry,
        hub: EventHub,
    ) -> Self {
        Self {
            config: config.api,
            coordinator,
            registry,
            hub,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let app = self.build_router();
        let listener =
            tokio::net::TcpListener::bind(format!("{}:{}", self.config.host, self.config.port))
                .await
                .map_err(|e| ProbeMeshError::Internal(e.into()))?;
        info!(
            "API server listening on {}:{}",
            self.config.host, self.config.port
        );
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .map_err(|e| ProbeMeshError::Internal(e.into()))?;
        Ok(())
    }

    pub fn build_router(&self) -> Router {
        // The dashboard is served from arbitrary origins; keep CORS open
        // like the public deployment.
        let cors = CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods([
                axum::http::Method::GET,
                axum::http::Method::POST,
                axum::http::Method::DELETE,
            ])
            .allow_headers([
                header::CONTENT_TYPE,
                header::AUTHORIZATION,
                axum::http::HeaderName::from_static("x-token"),
            ]);

        let admin = Router::new()
            .route("/agents", get(admin_list_agents).post(admin_create_agent))
            .route("/agents/{id}", delete(admin_delete_agent))
            .route("/agents/{id}/reset-token", post(admin_reset_token))
            .route("/agents/{id}/run-cmd", get(admin_run_cmd))
            .layer(middleware::from_fn_with_state(self.clone(), admin_auth));

        Router::new()
            .route("/healthz", get(health_check))
            .route("/api/check", post(post_check))
            .route("/api/check/{id}", get(get_check))
            .route("/api/results", post(post_results))
            .route("/api/agent/heartbeat", post(post_heartbeat))
            .route("/api/agent/log", post(post_agent_log))
            .route("/api/agents", get(list_agents))
            .route("/api/ws", get(ws_handler))
            .nest("/api/admin", admin)
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .with_state(self.clone())
    }
}

async fn health_check() -> &'static str {
    "ok"
}

/// Task intake: `202 {task_id}` once the task row exists and the job is
/// on every active agent's queue.
async fn post_check(
    State(server): State<ApiServer>,
    Json(request): Json<CheckRequest>,
) -> Result<(StatusCode, Json<CheckResponse>)> {
    let task = server
        .coordinator
        .submit(&request.target, &request.methods)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(CheckResponse { task_id: task.id })))
}

async fn get_check(
    State(server): State<ApiServer>,
    Path(id): Path<Uuid>,
) -> Result<Json<TaskProgress>> {
    Ok(Json(server.coordinator.progress(id).await?))
}

/// Result ingress, authenticated by the shared results token.
async fn post_results(
    State(server): State<ApiServer>,
    headers: HeaderMap,
    Json(submission): Json<ResultSubmission>,
) -> Result<StatusCode> {
    let provided = headers
        .get("x-token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !constant_time_eq(provided, &server.config.results_token) {
        return Err(ProbeMeshError::Unauthorized);
    }
    server.coordinator.ingest_result(submission).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn post_heartbeat(
    State(server): State<ApiServer>,
    headers: HeaderMap,
    Json(request): Json<HeartbeatRequest>,
) -> Result<StatusCode> {
    let ip = client_ip(&headers);
    server.registry.heartbeat(&request.token, ip).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Stage logs are broadcast to observers and otherwise unvalidated;
/// agents fire them without waiting.
async fn post_agent_log(
    State(server): State<ApiServer>,
    Json(request): Json<AgentLogRequest>,
) -> StatusCode {
    server
        .hub
        .broadcast(Event::Log {
            task_id: request.task_id,
            agent_id: request.agent_id,
            region: request.region,
            stage: request.stage,
            message: request.message,
        })
        .await;
    StatusCode::NO_CONTENT
}

async fn list_agents(State(server): State<ApiServer>) -> Json<Vec<PublicAgentView>> {
    let now = Utc::now();
    let agents = server
        .registry
        .list_active()
        .await
        .into_iter()
        .map(|a| PublicAgentView {
            online: a.is_online(now),
            name: a.name,
            region: a.region,
            ip: a.ip,
            last_heartbeat: a.last_heartbeat,
            tasks_completed: a.tasks_completed,
        })
        .collect();
    Json(agents)
}

// --- event stream ---

async fn ws_handler(State(server): State<ApiServer>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| stream_events(socket, server.hub))
}

/// Forwards hub events to the socket, one JSON message per frame. The
/// subscription ends when the client goes away or stops draining.
async fn stream_events(mut socket: WebSocket, hub: EventHub) {
    let (id, mut events) = hub.subscribe().await;
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let Ok(text) = serde_json::to_string(&event) else { continue };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                // Server-to-client only; any close or error ends the stream.
                match incoming {
                    Some(Ok(_)) => continue,
                    _ => break,
                }
            }
        }
    }
    hub.unsubscribe(id).await;
    debug!("event stream {} closed", id);
}

// --- admin ---

/// HTTP Basic guard for the admin surface.
async fn admin_auth(
    State(server): State<ApiServer>,
    request: axum::extract::Request,
    next: middleware::Next,
) -> Response {
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        .and_then(|encoded| base64::engine::general_purpose::STANDARD.decode(encoded).ok())
        .and_then(|decoded| String::from_utf8(decoded).ok())
        .and_then(|credentials| {
            credentials
                .split_once(':')
                .map(|(user, pass)| {
                    constant_time_eq(user, &server.config.admin_user)
                        && constant_time_eq(pass, &server.config.admin_pass)
                })
        })
        .unwrap_or(false);

    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=restricted")],
        )
            .into_response();
    }
    next.run(request).await
}

async fn admin_list_agents(State(server): State<ApiServer>) -> Json<Vec<AdminAgentView>> {
    let now = Utc::now();
    let agents = server
        .registry
        .list_active()
        .await
        .into_iter()
        .map(|a| AdminAgentView {
            id: a.id,
            token_tail: a.token_tail(),
            online: a.is_online(now),
            name: a.name,
            region: a.region,
            ip: a.ip,
            revoked: a.revoked,
            tasks_completed: a.tasks_completed,
            last_heartbeat: a.last_heartbeat,
        })
        .collect();
    Json(agents)
}

async fn admin_create_agent(
    State(server): State<ApiServer>,
    Json(request): Json<AdminCreateRequest>,
) -> Result<Json<AdminCreateResponse>> {
    let agent = server
        .registry
        .create(&request.name, &request.region)
        .await?;
    Ok(Json(AdminCreateResponse {
        id: agent.id,
        token: agent.token.clone(),
        token_tail: agent.token_tail(),
        run_cmd: render_run_cmd(&server.config, &agent),
    }))
}

async fn admin_delete_agent(
    State(server): State<ApiServer>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode> {
    server.registry.revoke(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn admin_reset_token(
    State(server): State<ApiServer>,
    Path(id): Path<Uuid>,
) -> Result<Json<ResetTokenResponse>> {
    let agent = server.registry.rotate_token(id).await?;
    Ok(Json(ResetTokenResponse {
        id: agent.id,
        token: agent.token.clone(),
        token_tail: agent.token_tail(),
    }))
}

async fn admin_run_cmd(
    State(server): State<ApiServer>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>> {
    let agent = server.registry.get(id).await?;
    Ok(Json(serde_json::json!({
        "run_cmd": render_run_cmd(&server.config, &agent)
    })))
}

/// The launch command handed to operators. Executing it is an external
/// side effect; the control plane only renders the string.
fn render_run_cmd(config: &ApiConfig, agent: &AgentRecord) -> String {
    format!(
        "docker run -d --restart unless-stopped --name {name} --cap-add=NET_RAW \
         -e API_BASE={base} -e RESULTS_TOKEN={results_token} -e AGENT_NAME={name} \
         -e AGENT_TOKEN={token} -e REGION={region} {image}",
        name = agent.name,
        base = config.public_api_base,
        results_token = config.results_token,
        token = agent.token,
        region = agent.region,
        image = config.agent_image,
    )
}

fn constant_time_eq(provided: &str, expected: &str) -> bool {
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .or_else(|| headers.get("x-real-ip"))
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').next().unwrap_or(v).trim().to_string())
}
