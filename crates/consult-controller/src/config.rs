//! Consultation Controller configuration.
//!
//! Configuration is loaded from environment variables. Sensitive fields
//! are redacted in Debug output.

use common::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use thiserror::Error;

/// Default WebSocket signaling bind address.
pub const DEFAULT_WS_BIND_ADDRESS: &str = "0.0.0.0:8440";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8441";

/// Default authorization hand-off timeout in milliseconds.
pub const DEFAULT_AUTHORIZATION_TIMEOUT_MS: u64 = 3_000;

/// Default idle grace period for zero-occupant rooms, in seconds.
pub const DEFAULT_IDLE_GRACE_SECONDS: u64 = 60;

/// Default idle-room sweep interval, in seconds.
pub const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 20;

/// Default maximum concurrent rooms.
pub const DEFAULT_MAX_ROOMS: u32 = 1_000;

/// Default controller instance ID prefix.
pub const DEFAULT_CONTROLLER_ID_PREFIX: &str = "cc";

/// Consultation Controller configuration.
///
/// Loaded from environment variables with sensible defaults. The
/// directory service URL and token are required; everything else has a
/// default.
#[derive(Clone)]
pub struct Config {
    /// WebSocket signaling bind address (default: "0.0.0.0:8440").
    pub ws_bind_address: String,

    /// Health endpoint bind address (default: "0.0.0.0:8441").
    pub health_bind_address: String,

    /// Base URL of the consultation directory (the external authorization
    /// collaborator).
    pub directory_url: String,

    /// Bearer token for the directory service.
    /// Protected by `SecretString` to prevent accidental logging.
    pub directory_token: SecretString,

    /// Authorization hand-off timeout in milliseconds.
    pub authorization_timeout_ms: u64,

    /// Grace period before a zero-occupant room is reaped, in seconds.
    pub idle_grace_seconds: u64,

    /// Interval of the background idle-room sweep, in seconds.
    pub sweep_interval_seconds: u64,

    /// Maximum concurrent rooms before admissions are shed.
    pub max_rooms: u32,

    /// Fallback connection-assistance (STUN) server URLs, used when the
    /// directory supplies none. Comma-separated in the environment.
    pub fallback_stun_servers: Vec<String>,

    /// Unique identifier for this controller instance.
    pub controller_id: String,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("ws_bind_address", &self.ws_bind_address)
            .field("health_bind_address", &self.health_bind_address)
            .field("directory_url", &self.directory_url)
            .field("directory_token", &"[REDACTED]")
            .field("authorization_timeout_ms", &self.authorization_timeout_ms)
            .field("idle_grace_seconds", &self.idle_grace_seconds)
            .field("sweep_interval_seconds", &self.sweep_interval_seconds)
            .field("max_rooms", &self.max_rooms)
            .field("fallback_stun_servers", &self.fallback_stun_servers)
            .field("controller_id", &self.controller_id)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let directory_url = vars
            .get("CC_DIRECTORY_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("CC_DIRECTORY_URL".to_string()))?
            .clone();

        let directory_token = SecretString::from(
            vars.get("CC_DIRECTORY_TOKEN")
                .ok_or_else(|| ConfigError::MissingEnvVar("CC_DIRECTORY_TOKEN".to_string()))?
                .clone(),
        );

        let ws_bind_address = vars
            .get("CC_WS_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_WS_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("CC_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let authorization_timeout_ms = vars
            .get("CC_AUTHORIZATION_TIMEOUT_MS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_AUTHORIZATION_TIMEOUT_MS);

        let idle_grace_seconds = vars
            .get("CC_IDLE_GRACE_SECONDS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_IDLE_GRACE_SECONDS);

        let sweep_interval_seconds = vars
            .get("CC_SWEEP_INTERVAL_SECONDS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECONDS);

        let max_rooms = vars
            .get("CC_MAX_ROOMS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_ROOMS);

        let fallback_stun_servers = vars
            .get("CC_FALLBACK_STUN_SERVERS")
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();

        // Generate controller instance ID
        let controller_id = vars.get("CC_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_CONTROLLER_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            ws_bind_address,
            health_bind_address,
            directory_url,
            directory_token,
            authorization_timeout_ms,
            idle_grace_seconds,
            sweep_interval_seconds,
            max_rooms,
            fallback_stun_servers,
            controller_id,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::secret::ExposeSecret;

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([
            (
                "CC_DIRECTORY_URL".to_string(),
                "http://directory.internal:8080".to_string(),
            ),
            (
                "CC_DIRECTORY_TOKEN".to_string(),
                "svc-token-abc123".to_string(),
            ),
        ])
    }

    #[test]
    fn test_from_vars_success_with_defaults() {
        let vars = base_vars();

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.directory_url, "http://directory.internal:8080");
        assert_eq!(
            config.directory_token.expose_secret(),
            "svc-token-abc123"
        );
        assert_eq!(config.ws_bind_address, DEFAULT_WS_BIND_ADDRESS);
        assert_eq!(config.health_bind_address, DEFAULT_HEALTH_BIND_ADDRESS);
        assert_eq!(
            config.authorization_timeout_ms,
            DEFAULT_AUTHORIZATION_TIMEOUT_MS
        );
        assert_eq!(config.idle_grace_seconds, DEFAULT_IDLE_GRACE_SECONDS);
        assert_eq!(config.sweep_interval_seconds, DEFAULT_SWEEP_INTERVAL_SECONDS);
        assert_eq!(config.max_rooms, DEFAULT_MAX_ROOMS);
        assert!(config.fallback_stun_servers.is_empty());
        // Controller ID should be auto-generated
        assert!(config.controller_id.starts_with("cc-"));
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let mut vars = base_vars();
        vars.insert("CC_WS_BIND_ADDRESS".to_string(), "127.0.0.1:9440".to_string());
        vars.insert(
            "CC_HEALTH_BIND_ADDRESS".to_string(),
            "127.0.0.1:9441".to_string(),
        );
        vars.insert("CC_AUTHORIZATION_TIMEOUT_MS".to_string(), "500".to_string());
        vars.insert("CC_IDLE_GRACE_SECONDS".to_string(), "120".to_string());
        vars.insert("CC_SWEEP_INTERVAL_SECONDS".to_string(), "5".to_string());
        vars.insert("CC_MAX_ROOMS".to_string(), "50".to_string());
        vars.insert(
            "CC_FALLBACK_STUN_SERVERS".to_string(),
            "stun:stun-a.example.org:3478, stun:stun-b.example.org:3478".to_string(),
        );

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.ws_bind_address, "127.0.0.1:9440");
        assert_eq!(config.health_bind_address, "127.0.0.1:9441");
        assert_eq!(config.authorization_timeout_ms, 500);
        assert_eq!(config.idle_grace_seconds, 120);
        assert_eq!(config.sweep_interval_seconds, 5);
        assert_eq!(config.max_rooms, 50);
        assert_eq!(
            config.fallback_stun_servers,
            vec![
                "stun:stun-a.example.org:3478".to_string(),
                "stun:stun-b.example.org:3478".to_string()
            ]
        );
    }

    #[test]
    fn test_controller_id_custom_value() {
        let mut vars = base_vars();
        vars.insert("CC_ID".to_string(), "cc-custom-001".to_string());

        let config = Config::from_vars(&vars).expect("Config should load successfully");
        assert_eq!(config.controller_id, "cc-custom-001");
    }

    #[test]
    fn test_from_vars_missing_directory_url() {
        let mut vars = base_vars();
        vars.remove("CC_DIRECTORY_URL");

        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(v)) if v == "CC_DIRECTORY_URL"));
    }

    #[test]
    fn test_from_vars_missing_directory_token() {
        let mut vars = base_vars();
        vars.remove("CC_DIRECTORY_TOKEN");

        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(v)) if v == "CC_DIRECTORY_TOKEN"));
    }

    #[test]
    fn test_debug_redacts_sensitive_fields() {
        let vars = base_vars();
        let config = Config::from_vars(&vars).expect("Config should load successfully");

        let debug_output = format!("{config:?}");

        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("svc-token-abc123"));
    }
}
