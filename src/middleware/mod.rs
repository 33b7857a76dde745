// Relay key, CORS, and request logging middleware

use axum::{body::Body, extract::State, http::Request, middleware::Next, response::Response};
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};

use crate::error::ApiError;
use crate::routes::AppState;

/// Relay key middleware
///
/// When a relay key is configured, requires "Bearer {RELAY_API_KEY}" in the
/// Authorization header or the bare key in x-api-key. Both headers are
/// stripped before the request reaches a handler, so the key never travels
/// upstream.
pub async fn relay_key_middleware(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.config.relay_api_key.as_deref() else {
        request.headers_mut().remove("authorization");
        return Ok(next.run(request).await);
    };

    let bearer_ok = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|key| key == expected);

    let header_ok = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|key| key == expected);

    if bearer_ok || header_ok {
        request.headers_mut().remove("authorization");
        request.headers_mut().remove("x-api-key");
        return Ok(next.run(request).await);
    }

    tracing::warn!(
        method = %request.method(),
        path = %request.uri().path(),
        "Access attempt with invalid or missing relay key"
    );
    Err(ApiError::AuthError(
        "Invalid or missing relay API key".to_string(),
    ))
}

/// Log each request with a short id, status and latency
pub async fn request_logging_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    tracing::debug!(request_id = %request_id, method = %method, path = %path, "Request received");

    let response = next.run(request).await;

    tracing::info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started.elapsed().as_millis() as u64,
        "Request completed"
    );

    response
}

/// Create CORS middleware layer
///
/// Allows all origins, methods, and headers.
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthEndpoints, MemorySessionStore, SessionManager};
    use crate::config::Config;
    use crate::http_client::AuthedHttpClient;
    use crate::metrics::PipelineMetrics;
    use axum::{
        http::{HeaderMap, StatusCode},
        routing::get,
        Router,
    };
    use std::sync::Arc;
    use tower::util::ServiceExt;

    fn create_test_state(relay_api_key: Option<&str>) -> AppState {
        let metrics = Arc::new(PipelineMetrics::new());
        let sessions = Arc::new(
            SessionManager::new(
                Arc::new(MemorySessionStore::default()),
                AuthEndpoints::new("http://localhost:1", "/account/refresh", "/account/login"),
                "device-1".to_string(),
                10,
                metrics.clone(),
            )
            .unwrap(),
        );
        let http_client =
            Arc::new(AuthedHttpClient::new(sessions.clone(), metrics.clone(), 10, 10).unwrap());
        let config = Arc::new(Config {
            server_host: "127.0.0.1".to_string(),
            server_port: 8080,
            relay_api_key: relay_api_key.map(str::to_string),
            api_base_url: "http://localhost:1".to_string(),
            refresh_path: "/account/refresh".to_string(),
            login_path: "/account/login".to_string(),
            session_db_file: std::path::PathBuf::from("/tmp/test.sqlite3"),
            device_id: None,
            http_connect_timeout: 10,
            http_request_timeout: 10,
            log_level: "info".to_string(),
        });

        AppState {
            sessions,
            http_client,
            config,
            metrics,
        }
    }

    /// Echoes whether credential headers reached the handler
    async fn echo_handler(headers: HeaderMap) -> String {
        format!(
            "authorization={} x-api-key={}",
            headers.contains_key("authorization"),
            headers.contains_key("x-api-key")
        )
    }

    fn create_test_app(state: AppState) -> Router {
        Router::new()
            .route("/test", get(echo_handler))
            .layer(axum::middleware::from_fn_with_state(
                state.clone(),
                relay_key_middleware,
            ))
            .with_state(state)
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_valid_bearer_key_is_accepted_and_stripped() {
        let app = create_test_app(create_test_state(Some("relay-key")));

        let request = Request::builder()
            .uri("/test")
            .header("authorization", "Bearer relay-key")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "authorization=false x-api-key=false");
    }

    #[tokio::test]
    async fn test_valid_x_api_key_is_accepted() {
        let app = create_test_app(create_test_state(Some("relay-key")));

        let request = Request::builder()
            .uri("/test")
            .header("x-api-key", "relay-key")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_wrong_or_missing_key_is_rejected() {
        let app = create_test_app(create_test_state(Some("relay-key")));

        let wrong = Request::builder()
            .uri("/test")
            .header("authorization", "Bearer wrong")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(wrong).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let missing = Request::builder().uri("/test").body(Body::empty()).unwrap();
        let response = app.clone().oneshot(missing).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let no_prefix = Request::builder()
            .uri("/test")
            .header("authorization", "relay-key")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(no_prefix).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_open_relay_strips_client_authorization() {
        let app = create_test_app(create_test_state(None));

        let request = Request::builder()
            .uri("/test")
            .header("authorization", "Bearer client-token")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "authorization=false x-api-key=false");
    }

    #[tokio::test]
    async fn test_request_logging_passes_response_through() {
        let app = Router::new()
            .route("/test", get(|| async { "OK" }))
            .layer(axum::middleware::from_fn(request_logging_middleware));

        let response = app
            .oneshot(Request::builder().uri("/test").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_cors_layer_handles_preflight_options() {
        let app = Router::new()
            .route("/test", get(|| async { "OK" }))
            .layer(cors_layer());

        let request = Request::builder()
            .method("OPTIONS")
            .uri("/test")
            .header("origin", "https://example.com")
            .header("access-control-request-method", "POST")
            .header("access-control-request-headers", "content-type")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("access-control-allow-origin").unwrap(),
            "*"
        );
        assert!(response
            .headers()
            .contains_key("access-control-allow-methods"));
    }
}
