//! Client configuration

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use fleety_shared::ProjectId;

pub const DEFAULT_API_URL: &str = "http://localhost:8080/v1";

/// Client configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // Backend
    pub api_url: String,
    pub ws_url: String,
    pub project_id: ProjectId,
    pub request_timeout: Duration,

    // Session
    /// Delay after a successful acquisition before the token renews itself
    pub session_renew_after: Duration,
    /// Token lifetime issued by the backend; renewal must happen sooner
    pub session_ttl: Duration,

    // Push channels
    pub reconnect_base_delay: Duration,
    pub max_reconnect_attempts: u32,

    // Local state
    pub ticket_store_path: PathBuf,
}

impl ClientConfig {
    /// Build a configuration with the default timings
    pub fn new(api_url: impl Into<String>, project_id: impl Into<ProjectId>) -> Self {
        let api_url = trim_base(api_url.into());
        Self {
            ws_url: derive_ws_url(&api_url),
            api_url,
            project_id: project_id.into(),
            request_timeout: Duration::from_secs(30),
            session_renew_after: Duration::from_secs(4 * 60),
            session_ttl: Duration::from_secs(5 * 60),
            reconnect_base_delay: Duration::from_millis(1000),
            max_reconnect_attempts: 5,
            ticket_store_path: PathBuf::from("supportTickets.json"),
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_url = trim_base(env::var("FLEETY_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string()));

        let config = Self {
            ws_url: env::var("FLEETY_WS_URL")
                .map(trim_base)
                .unwrap_or_else(|_| derive_ws_url(&api_url)),
            api_url,
            project_id: env::var("FLEETY_PROJECT_ID")
                .map(ProjectId::from)
                .map_err(|_| ConfigError::Missing("FLEETY_PROJECT_ID"))?,
            request_timeout: Duration::from_millis(
                env::var("FLEETY_REQUEST_TIMEOUT_MS")
                    .unwrap_or_else(|_| "30000".to_string())
                    .parse()
                    .unwrap_or(30000),
            ),

            // Session
            session_renew_after: Duration::from_secs(
                env::var("FLEETY_SESSION_RENEW_SECS")
                    .unwrap_or_else(|_| "240".to_string())
                    .parse()
                    .unwrap_or(240),
            ),
            session_ttl: Duration::from_secs(
                env::var("FLEETY_SESSION_TTL_SECS")
                    .unwrap_or_else(|_| "300".to_string())
                    .parse()
                    .unwrap_or(300),
            ),

            // Push channels
            reconnect_base_delay: Duration::from_millis(
                env::var("FLEETY_RECONNECT_BASE_MS")
                    .unwrap_or_else(|_| "1000".to_string())
                    .parse()
                    .unwrap_or(1000),
            ),
            max_reconnect_attempts: env::var("FLEETY_RECONNECT_MAX_ATTEMPTS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .unwrap_or(5),

            ticket_store_path: env::var("FLEETY_TICKET_STORE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("supportTickets.json")),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check the relationships between values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.project_id.as_str().trim().is_empty() {
            return Err(ConfigError::Missing("FLEETY_PROJECT_ID"));
        }
        if self.session_renew_after.is_zero() || self.session_renew_after >= self.session_ttl {
            return Err(ConfigError::Invalid(
                "FLEETY_SESSION_RENEW_SECS must be non-zero and shorter than FLEETY_SESSION_TTL_SECS",
            ));
        }
        if self.reconnect_base_delay.is_zero() {
            return Err(ConfigError::Invalid(
                "FLEETY_RECONNECT_BASE_MS must be greater than zero",
            ));
        }
        Ok(())
    }
}

fn trim_base(url: String) -> String {
    url.trim_end_matches('/').to_string()
}

/// Socket base for an HTTP API base (`http` → `ws`, `https` → `wss`)
pub fn derive_ws_url(api_url: &str) -> String {
    if let Some(rest) = api_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = api_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        api_url.to_string()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}
