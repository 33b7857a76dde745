// Identity endpoint calls

use anyhow::{Context, Result};
use reqwest::Client;

use super::types::{LoginRequest, LoginResponse, RefreshRequest, RefreshResponse, Session, TokenData};

/// Identity endpoint URLs
#[derive(Debug, Clone)]
pub struct AuthEndpoints {
    pub refresh_url: String,
    pub login_url: String,
}

impl AuthEndpoints {
    pub fn new(api_base_url: &str, refresh_path: &str, login_path: &str) -> Self {
        Self {
            refresh_url: join_url(api_base_url, refresh_path),
            login_url: join_url(api_base_url, login_path),
        }
    }
}

/// Join a base URL and a path without doubling or dropping the slash
pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Stable per-machine identifier sent as `uniqueId`
pub fn machine_fingerprint() -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    let mut hasher = DefaultHasher::new();
    hostname.hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

/// Exchange a refresh token for a new token pair
///
/// Any non-2xx status, or a body without an access token, is a failure.
pub async fn refresh_session(
    client: &Client,
    url: &str,
    refresh_token: &str,
    unique_id: &str,
) -> Result<TokenData> {
    tracing::info!(url = %url, "Refreshing access token...");

    let response = client
        .post(url)
        .json(&RefreshRequest {
            refresh_token,
            unique_id,
        })
        .send()
        .await
        .context("Failed to send refresh request")?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await.unwrap_or_default();
        tracing::warn!(
            status = status.as_u16(),
            body = %error_text,
            "Refresh endpoint rejected the refresh token"
        );
        anyhow::bail!("Token refresh failed: {} - {}", status, error_text);
    }

    let data: RefreshResponse = response
        .json()
        .await
        .context("Failed to parse refresh response")?;

    let tokens = data
        .into_token_data()
        .context("Refresh response does not contain accessToken")?;

    tracing::info!(
        rotated = tokens.refresh_token.is_some(),
        "Access token refreshed"
    );

    Ok(tokens)
}

/// Authenticate with email and password, returning a fresh session
pub async fn login(
    client: &Client,
    url: &str,
    email: &str,
    password: &str,
    unique_id: &str,
) -> Result<Session> {
    tracing::info!(url = %url, "Logging in...");

    let response = client
        .post(url)
        .json(&LoginRequest {
            email,
            password,
            unique_id,
        })
        .send()
        .await
        .context("Failed to send login request")?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await.unwrap_or_default();
        anyhow::bail!("Login failed: {} - {}", status, error_text);
    }

    let data: LoginResponse = response
        .json()
        .await
        .context("Failed to parse login response")?;

    let tokens = data
        .tokens
        .into_token_data()
        .context("Login response does not contain accessToken")?;

    Ok(Session::new(tokens.access_token, tokens.refresh_token, data.user))
}
