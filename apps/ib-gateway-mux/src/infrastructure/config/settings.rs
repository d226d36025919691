//! Proxy Configuration Settings
//!
//! Configuration types for the multiplexer, loaded from environment
//! variables. Numeric values that fail to parse fall back to their defaults;
//! values that would change what clients are allowed to do (operation lists,
//! dispatch mode) are rejected instead.

use std::time::Duration;

use crate::application::ports::Credentials;
use crate::application::services::{
    BackoffPolicy, DispatchMode, MuxConfig, RegistryConfig, RouterConfig, SessionConfig,
};
use crate::domain::operation::PermissionSet;
use crate::domain::rate_limit::RateLimitPolicy;

/// Where the Client Portal gateway listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewaySettings {
    /// Gateway host.
    pub host: String,
    /// Gateway port.
    pub port: u16,
    /// Verify the gateway's TLS certificate. The local gateway ships a
    /// self-signed one.
    pub verify_ssl: bool,
    /// Default account for account-scoped operations.
    pub account_id: Option<String>,
    /// Full API base URL, overriding host and port.
    pub base_url_override: Option<String>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5000,
            verify_ssl: false,
            account_id: None,
            base_url_override: None,
        }
    }
}

impl GatewaySettings {
    /// Base URL of the Client Portal REST API.
    #[must_use]
    pub fn base_url(&self) -> String {
        self.base_url_override.as_ref().map_or_else(
            || format!("https://{}:{}/v1/api", self.host, self.port),
            |url| url.trim_end_matches('/').to_string(),
        )
    }
}

/// Server port settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8080 }
    }
}

/// Complete proxy configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Gateway location.
    pub gateway: GatewaySettings,
    /// Credentials the session logs in with.
    pub credentials: Credentials,
    /// Session, registry and router tuning.
    pub mux: MuxConfig,
    /// Server port settings.
    pub server: ServerSettings,
}

impl ProxyConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a value is present but unusable.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if a value is present but unusable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let gateway_defaults = GatewaySettings::default();
        let host = env.string("IB_GATEWAY_HOST").unwrap_or(gateway_defaults.host);
        if host.trim().is_empty() {
            return Err(ConfigError::EmptyValue("IB_GATEWAY_HOST".to_string()));
        }
        let gateway = GatewaySettings {
            host,
            port: env.parse("IB_GATEWAY_PORT", gateway_defaults.port),
            verify_ssl: env.flag("IB_VERIFY_SSL", gateway_defaults.verify_ssl),
            account_id: env.non_empty("IB_ACCOUNT_ID"),
            base_url_override: env.non_empty("IB_API_BASE_URL"),
        };

        let credentials = Credentials::new(
            env.non_empty("IB_CREDENTIALS_REF")
                .unwrap_or_else(|| "default".to_string()),
            env.non_empty("IB_SESSION_TOKEN"),
        );

        let session_defaults = SessionConfig::default();
        let heartbeat_interval =
            env.secs("MUX_HEARTBEAT_INTERVAL_SECS", session_defaults.heartbeat_interval);
        let session = SessionConfig {
            heartbeat_interval,
            heartbeat_timeout: env.secs("MUX_HEARTBEAT_TIMEOUT_SECS", heartbeat_interval),
            max_missed_heartbeats: env.parse(
                "MUX_MAX_MISSED_HEARTBEATS",
                session_defaults.max_missed_heartbeats,
            ),
            connect_attempts: env.parse("MUX_CONNECT_ATTEMPTS", session_defaults.connect_attempts),
            login_timeout: env.secs("MUX_LOGIN_TIMEOUT_SECS", session_defaults.login_timeout),
            max_reconnect_attempts: env.parse(
                "MUX_MAX_RECONNECT_ATTEMPTS",
                session_defaults.max_reconnect_attempts,
            ),
            backoff: BackoffPolicy {
                initial_delay: env.millis(
                    "MUX_RECONNECT_DELAY_INITIAL_MS",
                    session_defaults.backoff.initial_delay,
                ),
                max_delay: env.secs(
                    "MUX_RECONNECT_DELAY_MAX_SECS",
                    session_defaults.backoff.max_delay,
                ),
                multiplier: env.parse(
                    "MUX_RECONNECT_DELAY_MULTIPLIER",
                    session_defaults.backoff.multiplier,
                ),
                jitter_factor: session_defaults.backoff.jitter_factor,
            },
        };

        let registry_defaults = RegistryConfig::default();
        let allowed_operations = match env.non_empty("MUX_ALLOWED_OPERATIONS") {
            None => registry_defaults.allowed_operations,
            Some(list) if list.trim().eq_ignore_ascii_case("all") => PermissionSet::all(),
            Some(list) => PermissionSet::parse_list(&list).map_err(|err| {
                ConfigError::InvalidValue {
                    key: "MUX_ALLOWED_OPERATIONS".to_string(),
                    message: err.to_string(),
                }
            })?,
        };
        let registry = RegistryConfig {
            max_clients: env.parse("MUX_MAX_CLIENTS", registry_defaults.max_clients),
            idle_timeout: env.secs("MUX_CLIENT_IDLE_TIMEOUT_SECS", registry_defaults.idle_timeout),
            sweep_interval: env.secs(
                "MUX_IDLE_SWEEP_INTERVAL_SECS",
                registry_defaults.sweep_interval,
            ),
            allowed_operations,
            rate_limit: RateLimitPolicy {
                window: env.secs("MUX_RATE_WINDOW_SECS", registry_defaults.rate_limit.window),
                max_requests: env.parse(
                    "MUX_RATE_MAX_REQUESTS",
                    registry_defaults.rate_limit.max_requests,
                ),
            },
        };

        let router_defaults = RouterConfig::default();
        let dispatch_mode = match env.non_empty("MUX_DISPATCH_MODE") {
            None => router_defaults.dispatch_mode,
            Some(mode) => mode
                .parse::<DispatchMode>()
                .map_err(|err| ConfigError::InvalidValue {
                    key: "MUX_DISPATCH_MODE".to_string(),
                    message: err.to_string(),
                })?,
        };
        let router = RouterConfig {
            acquire_timeout: env.millis("MUX_ACQUIRE_TIMEOUT_MS", router_defaults.acquire_timeout),
            call_timeout: env.secs("MUX_CALL_TIMEOUT_SECS", router_defaults.call_timeout),
            dispatch_mode,
        };

        let server = ServerSettings {
            health_port: env.parse("MUX_HEALTH_PORT", ServerSettings::default().health_port),
        };

        let config = Self {
            gateway,
            credentials,
            mux: MuxConfig {
                session,
                registry,
                router,
            },
            server,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("MUX_HEARTBEAT_INTERVAL_SECS", self.mux.session.heartbeat_interval),
            ("MUX_HEARTBEAT_TIMEOUT_SECS", self.mux.session.heartbeat_timeout),
            ("MUX_IDLE_SWEEP_INTERVAL_SECS", self.mux.registry.sweep_interval),
            ("MUX_RATE_WINDOW_SECS", self.mux.registry.rate_limit.window),
            ("MUX_CALL_TIMEOUT_SECS", self.mux.router.call_timeout),
        ];
        for (key, value) in non_zero {
            if value.is_zero() {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
        }
        if self.mux.session.backoff.multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                key: "MUX_RECONNECT_DELAY_MULTIPLIER".to_string(),
                message: "must be at least 1.0".to_string(),
            });
        }
        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable has an unusable value.
    #[error("invalid value for {key}: {message}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// What is wrong with it.
        message: String,
    },
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
    }

    fn non_empty(&self, key: &str) -> Option<String> {
        self.string(key).filter(|v| !v.trim().is_empty())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.string(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn flag(&self, key: &str, default: bool) -> bool {
        self.string(key)
            .map_or(default, |v| match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => default,
            })
    }

    fn secs(&self, key: &str, default: Duration) -> Duration {
        self.string(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_secs)
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        self.string(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }
}
