use anyhow::Context;
use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, HeaderName, Method, StatusCode, Uri},
    middleware::{self as axum_middleware},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::auth::refresh::join_url;
use crate::auth::SessionManager;
use crate::config::Config;
use crate::error::ApiError;
use crate::http_client::AuthedHttpClient;
use crate::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::middleware;

/// Application version from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionManager>,
    pub http_client: Arc<AuthedHttpClient>,
    pub config: Arc<Config>,
    pub metrics: Arc<PipelineMetrics>,
}

/// Build the application with all routes and middleware
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .merge(health_routes())
        .merge(admin_routes(state.clone()))
        .merge(relay_routes(state))
        // Middleware stack: CORS → Trace → request log → (relay key is per-router)
        .layer(axum_middleware::from_fn(middleware::request_logging_middleware))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(middleware::cors_layer())
}

/// Health check routes (no relay key required)
pub fn health_routes() -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
}

/// Local session administration and metrics
pub fn admin_routes(state: AppState) -> Router {
    Router::new()
        .route(
            "/_relay/session",
            get(session_status_handler).delete(logout_handler),
        )
        .route("/_relay/session/login", post(login_handler))
        .route("/_relay/metrics", get(metrics_handler))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::relay_key_middleware,
        ))
        .with_state(state)
}

/// Everything else is forwarded upstream through the pipeline
pub fn relay_routes(state: AppState) -> Router {
    Router::new()
        .fallback(relay_handler)
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::relay_key_middleware,
        ))
        .with_state(state)
}

/// GET / - Simple health check
async fn root_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "message": "Session Relay is running",
        "version": VERSION
    }))
}

/// GET /health - Detailed health check
async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "version": VERSION
    }))
}

/// GET /_relay/session - Session presence, never the tokens themselves
async fn session_status_handler(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let session = state.sessions.current_session()?;
    let updated_at = state.sessions.updated_at()?;

    Ok(Json(json!({
        "authenticated": session.is_some(),
        "user": session.map(|s| s.user).unwrap_or(Value::Null),
        "updatedAt": updated_at.map(|t| t.to_rfc3339()),
        "refreshing": state.sessions.is_refreshing(),
    })))
}

#[derive(Debug, Deserialize)]
struct LoginBody {
    email: String,
    password: String,
}

/// POST /_relay/session/login - Log in and store the session
async fn login_handler(
    State(state): State<AppState>,
    Json(body): Json<LoginBody>,
) -> Result<Json<Value>, ApiError> {
    if body.email.trim().is_empty() || body.password.is_empty() {
        return Err(ApiError::ValidationError(
            "email and password are required".to_string(),
        ));
    }

    let session = state.sessions.login(body.email.trim(), &body.password).await?;

    Ok(Json(json!({
        "authenticated": true,
        "user": session.user,
    })))
}

/// DELETE /_relay/session - Explicit logout
async fn logout_handler(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    state.sessions.logout()?;
    Ok(Json(json!({ "authenticated": false })))
}

/// GET /_relay/metrics - Pipeline counters
async fn metrics_handler(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

/// Headers that must not be forwarded in either direction
fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "host"
            | "content-length"
            | "authorization"
            | "x-api-key"
    )
}

/// Fallback - forward the request to the protected API
async fn relay_handler(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let url = join_url(&state.config.api_base_url, path_and_query);

    let mut builder = state.http_client.client().request(method, &url);
    for (name, value) in headers.iter() {
        if !is_hop_by_hop(name) {
            builder = builder.header(name, value);
        }
    }
    if !body.is_empty() {
        builder = builder.body(body);
    }

    let request = builder.build().context("Failed to build upstream request")?;
    let upstream = state.http_client.execute(request).await?;

    Ok(relay_response(upstream))
}

/// Stream an upstream response back to the client
fn relay_response(upstream: reqwest::Response) -> Response {
    let status = upstream.status();
    let headers = upstream.headers().clone();

    relayed_response(status, &headers, Body::from_stream(upstream.bytes_stream()))
}

/// Build the client-facing response for an upstream answer
///
/// Used for successful responses and for passed-through error responses
/// alike; only hop-by-hop and credential headers are dropped.
pub(crate) fn relayed_response(status: StatusCode, headers: &HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;

    let relayed = response.headers_mut();
    for (name, value) in headers {
        if !is_hop_by_hop(name) {
            relayed.append(name.clone(), value.clone());
        }
    }

    response
}
