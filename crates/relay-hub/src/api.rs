use crate::events;
use axum::{
    body::Bytes,
    extract::{
        rejection::{JsonRejection, QueryRejection},
        ConnectInfo, FromRequest, FromRequestParts, Path, Query, Request, State,
    },
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use relay_core::{
    CancelOutcome, Client, ClientStatus, Command, CommandFilter, CommandReport, CommandStatus,
    CommandSummary, Coordinator, RelayError, RelayResult, Registration, ReportOutcome,
    SubmitCommand,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, warn};

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    api_key: Arc<str>,
}

impl AppState {
    pub fn new(coordinator: Arc<Coordinator>, api_key: &str) -> Self {
        Self {
            coordinator,
            api_key: Arc::from(api_key),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/clients", get(list_clients))
        .route("/clients/register", post(register_client))
        .route("/clients/heartbeat", post(heartbeat))
        .route("/clients/:client_id", get(get_client))
        .route("/clients/:client_id/poll", post(poll))
        .route("/commands", get(list_commands).post(submit_command))
        .route("/commands/:command_id", get(get_command))
        .route("/commands/:command_id/claim", post(claim))
        .route("/commands/:command_id/report", post(report))
        .route("/commands/:command_id/cancel", post(cancel))
        .route("/events", get(events::events_handler))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .nest("/api", api)
        .route("/health", get(|| async { "ok" }))
        .with_state(state)
}

/// Accepts the key from the `x-api-key` header, or from an `api_key` query
/// parameter for WebSocket clients that cannot set headers.
async fn require_api_key(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let authorized = provided_api_key(&request)
        .is_some_and(|key| constant_time_compare(&key, &state.api_key));
    if authorized {
        return next.run(request).await;
    }
    warn!(event = "auth_rejected", path = %request.uri().path());
    ApiError(RelayError::Unauthorized).into_response()
}

fn provided_api_key(request: &Request) -> Option<String> {
    let from_header = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string);
    from_header.or_else(|| {
        Query::<KeyQuery>::try_from_uri(request.uri())
            .ok()
            .and_then(|Query(query)| query.api_key)
            .filter(|value| !value.is_empty())
    })
}

fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[derive(Debug)]
pub struct ApiError(RelayError);

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(RelayError::validation(rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self(RelayError::validation(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RelayError::Validation(_) => StatusCode::BAD_REQUEST,
            RelayError::NotFound { .. } | RelayError::UnknownClient(_) => StatusCode::NOT_FOUND,
            RelayError::Conflict { .. } => StatusCode::CONFLICT,
            RelayError::Unauthorized => StatusCode::UNAUTHORIZED,
            RelayError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(event = "request_failed", error = %self.0);
        } else {
            debug!(event = "request_rejected", code = self.0.code(), error = %self.0);
        }
        let body = json!({
            "error": {
                "code": self.0.code(),
                "message": self.0.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

/// `Json` whose rejections come back in the relay error shape.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);

#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(ApiError))]
pub struct ApiQuery<T>(pub T);

/// Runs a coordinator call off the async workers; the store may block.
async fn blocking<T, F>(state: &AppState, op: F) -> Result<T, ApiError>
where
    F: FnOnce(&Coordinator) -> RelayResult<T> + Send + 'static,
    T: Send + 'static,
{
    let coordinator = state.coordinator.clone();
    tokio::task::spawn_blocking(move || op(&coordinator))
        .await
        .map_err(|err| RelayError::Store(format!("worker failed: {err}")))?
        .map_err(ApiError::from)
}

fn secs(ms: i64) -> i64 {
    ms.div_euclid(1000)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClientView {
    pub client_id: String,
    pub hostname: String,
    pub client_type: String,
    pub ip_address: Option<String>,
    pub last_seen: i64,
    pub last_seen_ms: i64,
    pub last_command_id: Option<String>,
    pub status: ClientStatus,
}

impl From<Client> for ClientView {
    fn from(client: Client) -> Self {
        Self {
            last_seen: secs(client.last_seen_ms),
            last_seen_ms: client.last_seen_ms,
            client_id: client.client_id,
            hostname: client.hostname,
            client_type: client.client_type,
            ip_address: client.ip_address,
            last_command_id: client.last_command_id,
            status: client.status,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CommandView {
    pub command_id: String,
    pub client_id: String,
    pub command: String,
    pub params: Value,
    pub status: CommandStatus,
    pub created_at: i64,
    pub created_at_ms: i64,
    pub updated_at: i64,
    pub updated_at_ms: i64,
    pub timeout: Option<u64>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<i64>,
    pub exit_code: Option<i32>,
    pub result: Option<Value>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

impl From<Command> for CommandView {
    fn from(command: Command) -> Self {
        Self {
            created_at: secs(command.created_at_ms),
            created_at_ms: command.created_at_ms,
            updated_at: secs(command.updated_at_ms),
            updated_at_ms: command.updated_at_ms,
            claimed_at: command.claimed_at_ms.map(secs),
            timeout: command.timeout_secs,
            command_id: command.command_id,
            client_id: command.client_id,
            command: command.command,
            params: command.params,
            status: command.status,
            claimed_by: command.claimed_by,
            exit_code: command.exit_code,
            result: command.result,
            stdout: command.stdout,
            stderr: command.stderr,
        }
    }
}

/// List form: no result, stdout or stderr.
#[derive(Debug, Serialize, Deserialize)]
pub struct CommandSummaryView {
    pub command_id: String,
    pub client_id: String,
    pub command: String,
    pub params: Value,
    pub status: CommandStatus,
    pub created_at: i64,
    pub created_at_ms: i64,
    pub updated_at: i64,
    pub updated_at_ms: i64,
    pub exit_code: Option<i32>,
}

impl From<CommandSummary> for CommandSummaryView {
    fn from(summary: CommandSummary) -> Self {
        Self {
            created_at: secs(summary.created_at_ms),
            created_at_ms: summary.created_at_ms,
            updated_at: secs(summary.updated_at_ms),
            updated_at_ms: summary.updated_at_ms,
            command_id: summary.command_id,
            client_id: summary.client_id,
            command: summary.command,
            params: summary.params,
            status: summary.status,
            exit_code: summary.exit_code,
        }
    }
}

#[derive(Debug, Deserialize)]
struct KeyQuery {
    #[serde(default)]
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HeartbeatRequest {
    client_id: String,
    #[serde(default)]
    last_command_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListCommandsQuery {
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub command_id: String,
    pub status: CommandStatus,
}

#[derive(Debug, Deserialize)]
struct ClaimRequest {
    client_id: String,
}

#[derive(Debug, Deserialize)]
struct ReportRequest {
    #[serde(alias = "status")]
    outcome: ReportOutcome,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    exit_code: Option<i32>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    stdout: Option<String>,
    #[serde(default)]
    stderr: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CancelRequest {
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelView {
    /// `cancelled` or `advisory`.
    pub outcome: String,
    pub command: CommandView,
}

async fn register_client(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    ApiJson(mut registration): ApiJson<Registration>,
) -> Result<Json<ClientView>, ApiError> {
    let has_ip = registration
        .ip_address
        .as_deref()
        .is_some_and(|ip| !ip.trim().is_empty());
    if !has_ip {
        registration.ip_address = Some(remote.ip().to_string());
    }
    let client = blocking(&state, move |relay| relay.register_client(registration)).await?;
    Ok(Json(client.into()))
}

async fn heartbeat(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<HeartbeatRequest>,
) -> Result<Json<ClientView>, ApiError> {
    let client = blocking(&state, move |relay| {
        relay.heartbeat(&request.client_id, request.last_command_id.as_deref())
    })
    .await?;
    Ok(Json(client.into()))
}

async fn list_clients(State(state): State<AppState>) -> Result<Json<Vec<ClientView>>, ApiError> {
    let clients = blocking(&state, |relay| relay.list_clients()).await?;
    Ok(Json(clients.into_iter().map(ClientView::from).collect()))
}

async fn get_client(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> Result<Json<ClientView>, ApiError> {
    let client = blocking(&state, move |relay| relay.get_client(&client_id)).await?;
    Ok(Json(client.into()))
}

async fn poll(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> Result<Json<Vec<CommandView>>, ApiError> {
    let claimed = blocking(&state, move |relay| relay.poll(&client_id)).await?;
    Ok(Json(claimed.into_iter().map(CommandView::from).collect()))
}

async fn list_commands(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<ListCommandsQuery>,
) -> Result<Json<Vec<CommandSummaryView>>, ApiError> {
    let mut filter = CommandFilter::default();
    if let Some(client_id) = query.client_id.filter(|id| !id.trim().is_empty()) {
        filter = CommandFilter::for_client(&client_id);
    }
    if let Some(status) = query.status.filter(|status| !status.trim().is_empty()) {
        let status = status
            .trim()
            .parse::<CommandStatus>()
            .map_err(RelayError::Validation)?;
        filter = filter.with_status(status);
    }
    if let Some(limit) = query.limit {
        filter = filter.with_limit(limit);
    }
    let commands = blocking(&state, move |relay| relay.list_commands(filter)).await?;
    Ok(Json(
        commands.into_iter().map(CommandSummaryView::from).collect(),
    ))
}

async fn submit_command(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<SubmitCommand>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let created = blocking(&state, move |relay| relay.submit_command(request)).await?;
    Ok((
        StatusCode::CREATED,
        Json(SubmitResponse {
            command_id: created.command_id,
            status: created.status,
        }),
    ))
}

async fn get_command(
    State(state): State<AppState>,
    Path(command_id): Path<String>,
) -> Result<Json<CommandView>, ApiError> {
    let command = blocking(&state, move |relay| relay.get_command(&command_id)).await?;
    Ok(Json(command.into()))
}

async fn claim(
    State(state): State<AppState>,
    Path(command_id): Path<String>,
    ApiJson(request): ApiJson<ClaimRequest>,
) -> Result<Json<CommandView>, ApiError> {
    let command =
        blocking(&state, move |relay| relay.claim(&command_id, &request.client_id)).await?;
    Ok(Json(command.into()))
}

async fn report(
    State(state): State<AppState>,
    Path(command_id): Path<String>,
    ApiJson(request): ApiJson<ReportRequest>,
) -> Result<Json<CommandView>, ApiError> {
    let reporter = request.client_id;
    let report = CommandReport {
        outcome: request.outcome,
        exit_code: request.exit_code,
        result: request.result,
        stdout: request.stdout,
        stderr: request.stderr,
    };
    let command = blocking(&state, move |relay| {
        relay.report(&command_id, reporter.as_deref(), report)
    })
    .await?;
    Ok(Json(command.into()))
}

/// The body is optional; an empty one cancels with the default reason.
async fn cancel(
    State(state): State<AppState>,
    Path(command_id): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<CancelView>), ApiError> {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        CancelRequest::default()
    } else {
        serde_json::from_slice::<CancelRequest>(&body)
            .map_err(|err| RelayError::validation(format!("invalid cancel body: {err}")))?
    };
    let outcome = blocking(&state, move |relay| {
        relay.cancel(&command_id, request.reason.as_deref())
    })
    .await?;
    let (status, outcome, command) = match outcome {
        CancelOutcome::Cancelled(command) => (StatusCode::OK, "cancelled", command),
        CancelOutcome::Advisory(command) => (StatusCode::ACCEPTED, "advisory", command),
    };
    Ok((
        status,
        Json(CancelView {
            outcome: outcome.to_string(),
            command: command.into(),
        }),
    ))
}
