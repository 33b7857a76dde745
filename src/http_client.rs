use anyhow::{Context, Result};
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::{Client, Request, Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;

use crate::auth::SessionManager;
use crate::error::ApiError;
use crate::metrics::PipelineMetrics;

/// A request travelling through the pipeline
///
/// `retried` is set the first time the request is sent back out after a
/// 401, and it is never cleared. A second 401 is then terminal.
pub struct PipelineRequest {
    request: Request,
    retried: bool,
}

impl PipelineRequest {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            retried: false,
        }
    }

    pub fn is_retried(&self) -> bool {
        self.retried
    }

    fn mark_retried(&mut self) {
        self.retried = true;
    }

    /// Bearer token the request currently carries
    pub fn bearer_token(&self) -> Option<&str> {
        self.request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
    }

    /// Replace the bearer token before a replay
    fn replace_token(&mut self, token: &str) -> Result<()> {
        set_bearer(&mut self.request, token)
    }

    /// Copy for one attempt
    fn attempt(&self) -> Result<Request, ApiError> {
        self.request
            .try_clone()
            .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("Request body is not cloneable")))
    }
}

fn set_bearer(request: &mut Request, token: &str) -> Result<()> {
    let value = HeaderValue::from_str(&format!("Bearer {}", token))
        .context("Access token is not a valid header value")?;
    request.headers_mut().insert(AUTHORIZATION, value);
    Ok(())
}

/// HTTP client that authenticates requests and recovers from token expiry
pub struct AuthedHttpClient {
    /// Shared HTTP client with connection pooling
    client: Client,

    /// Session owner and refresh coordinator
    sessions: Arc<SessionManager>,

    metrics: Arc<PipelineMetrics>,
}

impl AuthedHttpClient {
    /// Create a new HTTP client
    pub fn new(
        sessions: Arc<SessionManager>,
        metrics: Arc<PipelineMetrics>,
        connect_timeout: u64,
        request_timeout: u64,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout))
            .timeout(Duration::from_secs(request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            sessions,
            metrics,
        })
    }

    /// Get the underlying HTTP client
    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Add the current session's bearer token to a request
    ///
    /// Without a session the request is returned untouched; the server is
    /// left to reject it.
    pub fn attach_token(&self, mut request: Request) -> Result<Request, ApiError> {
        if let Some(token) = self.sessions.access_token()? {
            set_bearer(&mut request, &token)?;
        }
        Ok(request)
    }

    /// Execute a request with the session's token
    ///
    /// A 401 triggers one refresh (shared with any concurrent 401s) and one
    /// replay with the new token. Every other failure is returned as is.
    pub async fn execute(&self, request: Request) -> Result<Response, ApiError> {
        self.metrics.record_request();

        let mut request = PipelineRequest::new(self.attach_token(request)?);

        let result = loop {
            let response = match self.dispatch(&request).await {
                Ok(response) => response,
                Err(e) => break Err(e),
            };

            if response.status().is_success() {
                break Ok(response);
            }

            let fresh = match self.on_response_error(&mut request, response).await {
                Ok(fresh) => fresh,
                Err(e) => break Err(e),
            };
            if let Err(e) = request.replace_token(&fresh) {
                break Err(ApiError::from(e));
            }
            self.metrics.record_replay();
        };

        if let Err(ref e) = result {
            self.metrics.record_error(e.kind());
        }

        result
    }

    /// Decide what to do with a non-2xx response
    ///
    /// Returns the token to replay with, or the terminal error. Responses
    /// other than 401 come back as `Upstream` with status, headers and body
    /// untouched.
    pub async fn on_response_error(
        &self,
        request: &mut PipelineRequest,
        response: Response,
    ) -> Result<String, ApiError> {
        let status = response.status();
        let url = response.url().clone();

        if status != StatusCode::UNAUTHORIZED {
            let headers = response.headers().clone();
            let body = response
                .bytes()
                .await
                .map_err(|e| ApiError::from_transport(&e))?;
            tracing::debug!(
                status = status.as_u16(),
                url = %url,
                "Passing through error response"
            );
            return Err(ApiError::Upstream {
                status,
                headers,
                body,
            });
        }

        if request.is_retried() {
            let message = response.text().await.unwrap_or_default();
            self.metrics.record_auth_expired();
            tracing::warn!(url = %url, "Request rejected again after token refresh");
            return Err(ApiError::AuthExpired(if message.is_empty() {
                "Access token rejected after refresh".to_string()
            } else {
                message
            }));
        }

        request.mark_retried();
        tracing::info!(url = %url, "Received 401, refreshing token");

        let sent_token = request.bearer_token().map(str::to_string);
        self.sessions
            .refresh_after_unauthorized(sent_token.as_deref())
            .await
    }

    /// Send one attempt
    async fn dispatch(&self, request: &PipelineRequest) -> Result<Response, ApiError> {
        let req = request.attempt()?;
        let method = req.method().clone();
        let url = req.url().clone();

        tracing::debug!(
            method = %method,
            url = %url,
            authenticated = request.bearer_token().is_some(),
            retried = request.is_retried(),
            "Sending HTTP request"
        );

        match self.client.execute(req).await {
            Ok(response) => {
                tracing::debug!(status = %response.status(), "Received HTTP response");
                Ok(response)
            }
            Err(e) => {
                let err = ApiError::from_transport(&e);
                tracing::warn!(
                    error = %e,
                    url = %url,
                    "HTTP request error"
                );
                Err(err)
            }
        }
    }
}
