use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::{Confirm, Input, Password};
use std::io::Write;
use std::path::PathBuf;

/// Session Relay - authenticated request relay
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Base URL of the protected API
    #[arg(short = 'u', long, env = "API_BASE_URL")]
    pub api_base_url: Option<String>,

    /// Relay host address
    #[arg(short = 'H', long, env = "SERVER_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Relay port
    #[arg(short, long, env = "SERVER_PORT", default_value = "8080")]
    pub port: u16,

    /// Path to the session SQLite database
    #[arg(short = 'd', long, env = "SESSION_DB_FILE")]
    pub session_db: Option<String>,

    /// Device identifier sent with refresh and login calls
    #[arg(long, env = "DEVICE_ID")]
    pub device_id: Option<String>,

    /// API key clients must present to use the relay
    #[arg(short = 'k', long, env = "RELAY_API_KEY")]
    pub api_key: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "10")]
    pub http_timeout: u64,

    /// HTTP connect timeout in seconds
    #[arg(long, env = "HTTP_CONNECT_TIMEOUT", default_value = "10")]
    pub connect_timeout: u64,

    /// Refresh endpoint path
    #[arg(long, env = "REFRESH_PATH", default_value = "/account/refresh")]
    pub refresh_path: String,

    /// Login endpoint path
    #[arg(long, env = "LOGIN_PATH", default_value = "/account/login")]
    pub login_path: String,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run the relay server (default)
    Serve,

    /// Log in and store a session
    Login {
        #[arg(long)]
        email: String,

        /// Prompted for when omitted
        #[arg(long, env = "LOGIN_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },

    /// Delete the stored session
    Logout,

    /// Show whether a session is stored
    Status,

    /// Send one authenticated request and print the response body
    Request {
        /// HTTP method
        method: String,

        /// Path under the API base URL
        path: String,

        /// JSON request body
        #[arg(long)]
        data: Option<String>,
    },
}

#[derive(Clone, Debug)]
pub struct Config {
    // Relay settings
    pub server_host: String,
    pub server_port: u16,
    pub relay_api_key: Option<String>,

    // Upstream API
    pub api_base_url: String,
    pub refresh_path: String,
    pub login_path: String,

    // Session
    pub session_db_file: PathBuf,
    pub device_id: Option<String>,

    // HTTP client
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,

    pub log_level: String,
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<(Self, Command)> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let args = CliArgs::parse();
        let command = args.command.clone().unwrap_or(Command::Serve);

        Ok((Self::from_args(args)?, command))
    }

    /// Build configuration from parsed arguments
    pub fn from_args(args: CliArgs) -> Result<Self> {
        let session_db_file = match args.session_db {
            Some(path) => expand_tilde(&path),
            None => default_session_db_path()
                .context("SESSION_DB_FILE is required (no data directory could be detected)")?,
        };

        Ok(Config {
            server_host: args.host,
            server_port: args.port,
            relay_api_key: args.api_key.filter(|k| !k.is_empty()),

            api_base_url: args
                .api_base_url
                .context("API_BASE_URL is required (use -u or set API_BASE_URL env var)")?,
            refresh_path: args.refresh_path,
            login_path: args.login_path,

            session_db_file,
            device_id: args.device_id.filter(|d| !d.is_empty()),

            http_connect_timeout: args.connect_timeout,
            http_request_timeout: args.http_timeout,

            log_level: args.log_level,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let url = reqwest::Url::parse(&self.api_base_url)
            .with_context(|| format!("API_BASE_URL is not a valid URL: {}", self.api_base_url))?;

        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("API_BASE_URL must use http or https: {}", self.api_base_url);
        }

        if self.http_request_timeout == 0 || self.http_connect_timeout == 0 {
            anyhow::bail!("HTTP timeouts must be greater than zero");
        }

        Ok(())
    }
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Default session database location under the platform data directory
fn default_session_db_path() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("session-relay").join("session.sqlite3"))
}

/// Read a password from the terminal without echo
pub fn prompt_password(email: &str) -> Result<String> {
    let password: String = Password::new()
        .with_prompt(format!("Password for {}", email))
        .interact()
        .context("Failed to read password")?;

    if password.is_empty() {
        anyhow::bail!("Password cannot be empty");
    }

    Ok(password)
}

// === Interactive Setup ===

/// Check if interactive setup is needed (no .env file and no API base URL)
pub fn needs_interactive_setup() -> bool {
    let env_file_exists = std::path::Path::new(".env").exists();
    let has_base_url = std::env::var("API_BASE_URL").is_ok();

    !env_file_exists && !has_base_url && std::env::args().len() <= 1
}

/// Configuration collected from interactive setup
#[derive(Debug, Clone)]
pub struct InteractiveConfig {
    pub api_base_url: String,
    pub server_port: String,
}

/// Run interactive setup to collect required configuration
pub fn run_interactive_setup() -> Result<InteractiveConfig> {
    println!();
    println!("Session Relay - first time setup");
    println!();

    let api_base_url: String = Input::new()
        .with_prompt("Base URL of the protected API (API_BASE_URL)")
        .interact_text()
        .context("Failed to read API_BASE_URL")?;

    reqwest::Url::parse(&api_base_url)
        .with_context(|| format!("Not a valid URL: {}", api_base_url))?;

    let server_port: String = Input::new()
        .with_prompt("Relay port")
        .default("8080".to_string())
        .interact_text()
        .context("Failed to read relay port")?;

    let config = InteractiveConfig {
        api_base_url,
        server_port,
    };

    let save_to_env = Confirm::new()
        .with_prompt("Save configuration to .env file?")
        .default(true)
        .interact()
        .context("Failed to read save confirmation")?;

    if save_to_env {
        save_env_file(&config)?;
        println!("Configuration saved to .env file");
    }

    Ok(config)
}

fn render_env_file(config: &InteractiveConfig) -> String {
    format!(
        r#"# Session Relay Configuration
# Generated by interactive setup

# Base URL of the protected API (required)
API_BASE_URL={}

# Relay settings
SERVER_HOST=127.0.0.1
SERVER_PORT={}

# Logging (trace, debug, info, warn, error)
LOG_LEVEL=info
"#,
        config.api_base_url, config.server_port,
    )
}

/// Save configuration to .env file
fn save_env_file(config: &InteractiveConfig) -> Result<()> {
    let mut file = std::fs::File::create(".env").context("Failed to create .env file")?;
    file.write_all(render_env_file(config).as_bytes())
        .context("Failed to write .env file")?;

    Ok(())
}
