use anyhow::{Context, Result};
use std::sync::Arc;

use session_relay::auth::{self, AuthEndpoints, SessionManager, SqliteSessionStore};
use session_relay::config::{self, Command, Config};
use session_relay::error::ApiError;
use session_relay::http_client::AuthedHttpClient;
use session_relay::metrics::PipelineMetrics;
use session_relay::routes::{self, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    // Check if interactive setup is needed (no .env and no API base URL)
    if config::needs_interactive_setup() {
        let interactive_config = config::run_interactive_setup()?;

        // Set environment variables from interactive config so Config::load() can use them
        std::env::set_var("API_BASE_URL", &interactive_config.api_base_url);
        std::env::set_var("SERVER_PORT", &interactive_config.server_port);
    }

    // Load configuration first (for log level)
    let (config, command) = Config::load()?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::debug!(
        session_db = %config.session_db_file.display(),
        "Opening session store"
    );
    let store = Arc::new(SqliteSessionStore::open(&config.session_db_file)?);

    let device_id = config
        .device_id
        .clone()
        .unwrap_or_else(auth::machine_fingerprint);

    let metrics = Arc::new(PipelineMetrics::new());
    let sessions = Arc::new(SessionManager::new(
        store,
        AuthEndpoints::new(&config.api_base_url, &config.refresh_path, &config.login_path),
        device_id,
        config.http_request_timeout,
        metrics.clone(),
    )?);

    let http_client = Arc::new(AuthedHttpClient::new(
        sessions.clone(),
        metrics.clone(),
        config.http_connect_timeout,
        config.http_request_timeout,
    )?);

    match command {
        Command::Serve => {
            let state = AppState {
                sessions,
                http_client,
                config: Arc::new(config.clone()),
                metrics,
            };
            serve(state, &config).await
        }
        Command::Login { email, password } => {
            let password = match password {
                Some(password) => password,
                None => config::prompt_password(&email)?,
            };
            let session = sessions.login(&email, &password).await?;
            println!("Logged in as {}", describe_user(&session.user));
            Ok(())
        }
        Command::Logout => {
            sessions.logout()?;
            println!("Session deleted");
            Ok(())
        }
        Command::Status => {
            match sessions.current_session()? {
                Some(session) => {
                    println!("Logged in as {}", describe_user(&session.user));
                    println!(
                        "  Refresh token: {}",
                        if session.usable_refresh_token().is_some() {
                            "present"
                        } else {
                            "missing"
                        }
                    );
                    if let Some(updated_at) = sessions.updated_at()? {
                        println!("  Updated at:    {}", updated_at.to_rfc3339());
                    }
                }
                None => println!("Not logged in"),
            }
            Ok(())
        }
        Command::Request { method, path, data } => {
            send_one(&http_client, &config, &method, &path, data).await
        }
    }
}

/// Run the relay server until a shutdown signal arrives
async fn serve(state: AppState, config: &Config) -> Result<()> {
    match state.sessions.current_session() {
        Ok(Some(_)) => tracing::info!("✅ Stored session found"),
        Ok(None) => tracing::warn!(
            "No stored session; requests will be relayed unauthenticated until login"
        ),
        Err(e) => tracing::error!("❌ Failed to read stored session: {}", e),
    }

    let app = routes::build_app(state);

    let addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    print_startup_banner(config);

    tracing::info!("🚀 Relay listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("👋 Relay shutdown complete");

    Ok(())
}

/// Send a single request through the pipeline and print the body
async fn send_one(
    http_client: &AuthedHttpClient,
    config: &Config,
    method: &str,
    path: &str,
    data: Option<String>,
) -> Result<()> {
    let method = reqwest::Method::from_bytes(method.to_uppercase().as_bytes())
        .with_context(|| format!("Invalid HTTP method: {}", method))?;
    let url = auth::refresh::join_url(&config.api_base_url, path);

    let mut builder = http_client.client().request(method, &url);
    if let Some(data) = data {
        let body: serde_json::Value =
            serde_json::from_str(&data).context("--data must be valid JSON")?;
        builder = builder.json(&body);
    }

    let request = builder.build().context("Failed to build request")?;
    let (status, body) = match http_client.execute(request).await {
        Ok(response) => {
            let status = response.status();
            let body = response.bytes().await.context("Failed to read response body")?;
            (status, body)
        }
        Err(ApiError::Upstream { status, body, .. }) => (status, body),
        Err(e) => return Err(e.into()),
    };

    eprintln!("HTTP {}", status);
    println!("{}", String::from_utf8_lossy(&body));

    Ok(())
}

fn describe_user(user: &serde_json::Value) -> String {
    ["email", "name", "id"]
        .iter()
        .find_map(|key| {
            user.get(key)
                .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
        })
        .unwrap_or_else(|| "unknown user".to_string())
}

/// Print startup banner
fn print_startup_banner(config: &Config) {
    let banner = r#"
╔═══════════════════════════════════════════════════════════╗
║                                                           ║
║                     Session Relay                         ║
║                                                           ║
║   Bearer token attachment with single-flight refresh      ║
║                                                           ║
╚═══════════════════════════════════════════════════════════╝
"#;

    println!("{}", banner);
    println!("  Version:     {}", env!("CARGO_PKG_VERSION"));
    println!(
        "  Relay:       http://{}:{}",
        config.server_host, config.server_port
    );
    println!("  Upstream:    {}", config.api_base_url);
    println!("  Session DB:  {}", config.session_db_file.display());
    println!(
        "  Relay key:   {}",
        if config.relay_api_key.is_some() {
            "required"
        } else {
            "not required"
        }
    );
    println!("  Log Level:   {}", config.log_level);
    println!();
}

/// Handle graceful shutdown signal
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown...");
        },
    }
}
