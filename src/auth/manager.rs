use anyhow::{Context, Result};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

use super::gate::RefreshGate;
use super::refresh::{self, AuthEndpoints};
use super::store::SessionStore;
use super::types::Session;
use crate::error::ApiError;
use crate::metrics::PipelineMetrics;

/// Session manager
/// Owns the stored session and serializes refreshes through a single gate
pub struct SessionManager {
    /// Persistent session storage
    store: Arc<dyn SessionStore>,

    /// HTTP client for identity endpoint calls
    client: Client,

    /// Refresh and login URLs
    endpoints: AuthEndpoints,

    /// Device identifier sent as `uniqueId`
    device_id: String,

    /// In-flight flag and pending queue
    gate: RefreshGate,

    metrics: Arc<PipelineMetrics>,
}

impl SessionManager {
    /// Create a new SessionManager
    pub fn new(
        store: Arc<dyn SessionStore>,
        endpoints: AuthEndpoints,
        device_id: String,
        request_timeout: u64,
        metrics: Arc<PipelineMetrics>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            store,
            client,
            endpoints,
            device_id,
            gate: RefreshGate::with_metrics(metrics.clone()),
            metrics,
        })
    }

    /// Currently stored session, if any
    pub fn current_session(&self) -> Result<Option<Session>, ApiError> {
        Ok(self.store.load()?)
    }

    /// Access token of the stored session, if any
    pub fn access_token(&self) -> Result<Option<String>, ApiError> {
        Ok(self
            .current_session()?
            .map(|s| s.access_token)
            .filter(|t| !t.is_empty()))
    }

    /// When the stored session was last written
    pub fn updated_at(&self) -> Result<Option<chrono::DateTime<chrono::Utc>>, ApiError> {
        Ok(self.store.updated_at()?)
    }

    /// Whether a refresh is outstanding right now
    pub fn is_refreshing(&self) -> bool {
        self.gate.is_refreshing()
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Log in and persist the resulting session, replacing any existing one
    pub async fn login(&self, email: &str, password: &str) -> Result<Session, ApiError> {
        let session = refresh::login(
            &self.client,
            &self.endpoints.login_url,
            email,
            password,
            &self.device_id,
        )
        .await
        .map_err(login_error)?;

        self.store.save(&session)?;
        self.gate.reset();
        tracing::info!("Session stored after login");

        Ok(session)
    }

    /// Drop the stored session
    pub fn logout(&self) -> Result<(), ApiError> {
        self.store.delete()?;
        self.gate.reset();
        tracing::info!("Session deleted on logout");
        Ok(())
    }

    /// Get a usable access token after a request was rejected with 401
    ///
    /// `stale_token` is the token the rejected request carried. If the stored
    /// session already holds a different token, that token is returned
    /// without another refresh call. Otherwise at most one refresh runs and
    /// concurrent callers wait for it. The store is read before entering the
    /// gate; the gate itself only checks its in-memory record of the last
    /// rotation.
    pub async fn refresh_after_unauthorized(
        &self,
        stale_token: Option<&str>,
    ) -> Result<String, ApiError> {
        if let Some(stale) = stale_token {
            match self.access_token() {
                Ok(Some(current)) if current != stale => {
                    tracing::debug!("Session already refreshed by another request");
                    return Ok(current);
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Failed to read session before refresh: {}", e),
            }
        }

        self.gate
            .run(stale_token, || self.perform_refresh())
            .await
    }

    /// Leader side of a refresh: exchange, persist, or invalidate
    async fn perform_refresh(&self) -> Result<String, ApiError> {
        self.metrics.record_refresh_started();

        match self.exchange_refresh_token().await {
            Ok(token) => Ok(token),
            Err(e) => {
                tracing::warn!("Token refresh failed, deleting session: {:#}", e);
                self.metrics.record_refresh_failure();

                if let Err(delete_err) = self.store.delete() {
                    tracing::error!("Failed to delete session after refresh failure: {:#}", delete_err);
                }

                Err(ApiError::SessionExpired(format!("{:#}", e)))
            }
        }
    }

    async fn exchange_refresh_token(&self) -> Result<String> {
        let session = self
            .store
            .load()?
            .context("No session is stored")?;

        let refresh_token = session
            .usable_refresh_token()
            .context("Session has no refresh token")?
            .to_string();

        self.metrics.record_refresh_call();
        let tokens = refresh::refresh_session(
            &self.client,
            &self.endpoints.refresh_url,
            &refresh_token,
            &self.device_id,
        )
        .await?;

        let updated = session.with_refreshed_tokens(tokens);
        self.store
            .save(&updated)
            .context("Failed to persist refreshed session")?;

        Ok(updated.access_token)
    }
}

/// Classify a failed login: transport problems stay network errors
fn login_error(e: anyhow::Error) -> ApiError {
    match e.downcast_ref::<reqwest::Error>() {
        Some(transport) if !transport.is_decode() => ApiError::from_transport(transport),
        _ => ApiError::LoginFailed(format!("{:#}", e)),
    }
}
