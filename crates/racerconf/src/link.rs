//! Link configuration - how the bridge reaches the matrix.

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// First-party simulator host. The only host whose TLS certificate is
/// validated strictly; real frames ship self-signed certificates.
pub const SIMULATOR_HOST: &str = "sim.ereca.fr";

/// Prefix of every API token issued by the matrix.
const TOKEN_PREFIX: &str = "SRK_";
const TOKEN_MIN_CODE_LEN: usize = 10;

/// Connection and logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct LinkConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Where the matrix REST API lives and how to authenticate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionConfig {
    /// Host name or address, optionally with `:port`.
    #[serde(default)]
    pub host: String,

    /// Use HTTPS. If disabled, plain HTTP is used.
    /// Default: true
    #[serde(default = "ConnectionConfig::default_use_https")]
    pub use_https: bool,

    /// Bearer token, `SRK_` followed by a code.
    #[serde(default)]
    pub api_token: String,
}

impl ConnectionConfig {
    fn default_use_https() -> bool {
        true
    }

    /// `http(s)://host`, without trailing slash.
    pub fn base_url(&self) -> String {
        let scheme = if self.use_https { "https" } else { "http" };
        format!("{}://{}", scheme, self.host.trim().trim_end_matches('/'))
    }

    /// Token as sent on the wire.
    pub fn bearer_token(&self) -> &str {
        self.api_token.trim()
    }

    /// Whether the TLS layer should accept self-signed certificates.
    pub fn accept_invalid_certs(&self) -> bool {
        self.use_https && self.host.trim() != SIMULATOR_HOST
    }

    /// Host and token are both present.
    pub fn has_credentials(&self) -> bool {
        !self.host.trim().is_empty() && !self.bearer_token().is_empty()
    }

    /// Check the fields needed to open a session.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("connection.host is empty".to_string()));
        }

        let token = self.bearer_token();
        if token.is_empty() {
            return Err(ConfigError::Invalid(
                "connection.api_token is empty".to_string(),
            ));
        }

        let well_formed = token
            .strip_prefix(TOKEN_PREFIX)
            .map(|code| {
                code.len() >= TOKEN_MIN_CODE_LEN && code.chars().all(|c| c.is_ascii_alphanumeric())
            })
            .unwrap_or(false);

        if !well_formed {
            return Err(ConfigError::Invalid(format!(
                "connection.api_token must be {}<code> with at least {} alphanumerics",
                TOKEN_PREFIX, TOKEN_MIN_CODE_LEN
            )));
        }

        Ok(())
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            use_https: Self::default_use_https(),
            api_token: String::new(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryConfig {
    /// Log level or `EnvFilter` directive (trace, debug, info, warn, error).
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}
