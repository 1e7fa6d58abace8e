use std::net::SocketAddr;
use std::time::Instant;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::{Request, StatusCode};
use axum::middleware::{from_fn, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use common::point::Point;
use meridian_core::{parse_query, Error as CoreError, Privilege, QueryResults, User};
use serde::{Deserialize, Serialize};
use tower::limit::ConcurrencyLimitLayer;

use crate::config::DaemonConfig;
use crate::error::{DaemonError, Result};
use crate::node::NodeHandle;
use crate::signals::ShutdownSignal;

pub async fn run(config: &DaemonConfig, node: NodeHandle, shutdown: ShutdownSignal) -> Result<()> {
    let addr = config.socket_addr()?;
    let state = AppState { node };

    let mut app = Router::new()
        .route("/query", post(handle_query))
        .route("/write", post(handle_write))
        .route("/data_nodes", post(handle_create_data_node))
        .route("/metastore", get(handle_metastore))
        .route("/ping", get(handle_ping))
        .with_state(state);

    if let Some(limit) = config.server.body_limit {
        app = app.layer(DefaultBodyLimit::max(limit));
    }
    if let Some(limit) = config.server.concurrency_limit {
        app = app.layer(ConcurrencyLimitLayer::new(limit));
    }
    app = app.layer(from_fn(log_requests));

    tracing::info!(event = "server.listen", %addr, "listening for connections");

    serve(addr, app, shutdown).await
}

async fn serve(addr: SocketAddr, app: Router, shutdown: ShutdownSignal) -> Result<()> {
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    node: NodeHandle,
}

#[derive(Deserialize)]
struct Credentials {
    #[serde(default, rename = "u")]
    username: Option<String>,
    #[serde(default, rename = "p")]
    password: Option<String>,
}

#[derive(Deserialize)]
struct QueryRequest {
    query: String,
    #[serde(default)]
    database: Option<String>,
    #[serde(flatten)]
    credentials: Credentials,
}

#[derive(Deserialize)]
struct WriteRequest {
    database: String,
    #[serde(default)]
    retention_policy: Option<String>,
    points: Vec<Point>,
    #[serde(flatten)]
    credentials: Credentials,
}

#[derive(Serialize)]
struct WriteResponse {
    index: u64,
}

#[derive(Serialize)]
struct DataNodeResponse {
    id: u64,
    url: String,
}

#[derive(Deserialize)]
struct DataNodeRequest {
    url: String,
}

fn authenticate(node: &NodeHandle, credentials: &Credentials) -> Result<Option<User>> {
    match (&credentials.username, &credentials.password) {
        (Some(username), password) => Ok(node
            .authenticate(username, password.as_deref().unwrap_or(""))
            .map_err(DaemonError::Core)?),
        (None, _) => Ok(None),
    }
}

async fn handle_query(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> std::result::Result<Json<QueryResults>, ApiError> {
    let node = state.node.clone();
    let started = Instant::now();

    let results = tokio::task::spawn_blocking(move || -> Result<QueryResults> {
        let user = authenticate(&node, &request.credentials)?;
        let statements = parse_query(&request.query).map_err(CoreError::Parse)?;
        Ok(node.execute_query(
            statements,
            request.database.as_deref().unwrap_or(""),
            user.as_ref(),
        ))
    })
    .await
    .map_err(|err| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))??;

    tracing::info!(
        event = "query.completed",
        elapsed_ms = started.elapsed().as_millis() as u64,
        statements = results.results.len(),
        failed = results.error().is_some(),
        "query executed"
    );
    Ok(Json(results))
}

async fn handle_write(
    State(state): State<AppState>,
    Json(request): Json<WriteRequest>,
) -> std::result::Result<Json<WriteResponse>, ApiError> {
    let node = state.node.clone();

    let index = tokio::task::spawn_blocking(move || -> Result<u64> {
        let user = authenticate(&node, &request.credentials)?;
        if node.authentication_enabled() {
            let authorized = user
                .as_ref()
                .map(|u| u.authorize(Privilege::Write, &request.database))
                .unwrap_or(false);
            if !authorized {
                return Err(DaemonError::Core(CoreError::Authorize {
                    user: user.map(|u| u.name).unwrap_or_default(),
                    statement: "write".to_string(),
                    reason: format!("requires Write privilege on {}", request.database),
                }));
            }
        }

        let index = node.write_series(
            &request.database,
            request.retention_policy.as_deref().unwrap_or(""),
            &request.points,
        )?;
        // Make the write visible to immediate local reads.
        if index > 0 {
            node.sync(index)?;
        }
        Ok(index)
    })
    .await
    .map_err(|err| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))??;

    Ok(Json(WriteResponse { index }))
}

async fn handle_create_data_node(
    State(state): State<AppState>,
    Json(request): Json<DataNodeRequest>,
) -> std::result::Result<(StatusCode, Json<DataNodeResponse>), ApiError> {
    let node = state.node.clone();

    let data_node = tokio::task::spawn_blocking(move || -> Result<meridian_core::DataNode> {
        node.create_data_node(&request.url)?;
        node.data_node_by_url(&request.url)?
            .ok_or(DaemonError::Core(CoreError::DataNodeNotFound))
    })
    .await
    .map_err(|err| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))??;

    Ok((
        StatusCode::CREATED,
        Json(DataNodeResponse {
            id: data_node.id,
            url: data_node.url,
        }),
    ))
}

async fn handle_metastore(
    State(state): State<AppState>,
) -> std::result::Result<Vec<u8>, ApiError> {
    let node = state.node.clone();
    let bytes = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        node.copy_metastore(&mut buf)?;
        Ok(buf)
    })
    .await
    .map_err(|err| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))??;
    Ok(bytes)
}

async fn handle_ping() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn log_requests<B>(req: Request<B>, next: Next<B>) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let start = Instant::now();
    let response = next.run(req).await;
    tracing::info!(
        event = "http.request",
        method = %method,
        path = %uri.path(),
        status = response.status().as_u16(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "request completed"
    );
    response
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    status: &'static str,
    error: String,
}

impl From<DaemonError> for ApiError {
    fn from(err: DaemonError) -> Self {
        let status = match &err {
            DaemonError::Core(CoreError::InvalidCredentials)
            | DaemonError::Core(CoreError::Authorize { .. }) => StatusCode::UNAUTHORIZED,
            DaemonError::Core(CoreError::Parse(_))
            | DaemonError::Core(CoreError::FieldTypeConflict { .. })
            | DaemonError::Config(_)
            | DaemonError::Json(_) => StatusCode::BAD_REQUEST,
            DaemonError::Core(CoreError::DatabaseNotFound)
            | DaemonError::Core(CoreError::RetentionPolicyNotFound)
            | DaemonError::Core(CoreError::MeasurementNotFound)
            | DaemonError::Core(CoreError::SeriesNotFound)
            | DaemonError::Core(CoreError::UserNotFound)
            | DaemonError::Core(CoreError::DataNodeNotFound) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let payload = ErrorResponse {
            status: "error",
            error: self.message,
        };
        (self.status, Json(payload)).into_response()
    }
}
