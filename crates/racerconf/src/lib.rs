//! Minimal configuration loading for racerlink.
//!
//! Configuration is split into two categories:
//!
//! - **Link** (`LinkConfig`): how to reach the matrix and how loudly to log.
//!   Changing any of it means tearing the session down and starting over.
//!
//! - **Routing** (`RoutingConfig`, `PollingConfig`): operator-facing behaviour
//!   such as take mode, ignored port types and the polling cadence.
//!
//! # Usage
//!
//! ```rust,no_run
//! use racerconf::RacerConfig;
//!
//! let config = RacerConfig::load().expect("Failed to load config");
//!
//! println!("Matrix: {}", config.link.connection.base_url());
//! println!("Poll every {:?}", config.polling.interval());
//! ```
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/racerlink/config.toml` (system)
//! 2. `~/.config/racerlink/config.toml` (user)
//! 3. `./racerlink.toml` (local override, or the `--config` path)
//! 4. Environment variables (`RACERLINK_*`)
//!
//! # Example Config
//!
//! ```toml
//! [connection]
//! host = "10.0.0.20"
//! use_https = true
//! api_token = "SRK_0123456789abcdef"
//!
//! [polling]
//! interval_ms = 1000
//!
//! [routing]
//! take = true
//! proto_filter = "MADI,GPI,GPO"
//!
//! [telemetry]
//! log_level = "info"
//! ```

pub mod link;
pub mod loader;
pub mod routing;

pub use link::{ConnectionConfig, LinkConfig, TelemetryConfig, SIMULATOR_HOST};
pub use loader::{discover_config_files_with_override, ConfigSources};
pub use routing::{PollingConfig, RoutingConfig, MAX_POLL_INTERVAL_MS, MIN_POLL_INTERVAL_MS};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Complete racerlink configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RacerConfig {
    /// Connection and logging.
    #[serde(flatten)]
    pub link: LinkConfig,

    #[serde(default)]
    pub polling: PollingConfig,

    #[serde(default)]
    pub routing: RoutingConfig,
}

impl RacerConfig {
    /// Load configuration from all sources.
    ///
    /// Load order (later wins):
    /// 1. Compiled defaults
    /// 2. `/etc/racerlink/config.toml`
    /// 3. `~/.config/racerlink/config.toml`
    /// 4. `./racerlink.toml`
    /// 5. Environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration with an explicit file taking the place of
    /// `./racerlink.toml`. System and user configs still load first.
    pub fn load_from(config_path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration from optional path and return information about sources.
    pub fn load_with_sources_from(
        config_path: Option<&std::path::Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut config = RacerConfig::default();

        for path in loader::discover_config_files_with_override(config_path) {
            let file_config = loader::load_from_file(&path)?;
            config = loader::merge_configs(config, file_config);
            sources.files.push(path);
        }

        loader::apply_env_overrides(&mut config, &mut sources);

        Ok((config, sources))
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> String {
        let mut output = String::new();

        output.push_str("# racerlink configuration\n\n");

        output.push_str("[connection]\n");
        output.push_str(&format!("host = \"{}\"\n", self.link.connection.host));
        output.push_str(&format!("use_https = {}\n", self.link.connection.use_https));
        // Never echo the secret itself
        if self.link.connection.api_token.is_empty() {
            output.push_str("api_token = \"\"\n");
        } else {
            output.push_str("api_token = \"SRK_********\"\n");
        }

        output.push_str("\n[polling]\n");
        output.push_str(&format!("interval_ms = {}\n", self.polling.interval_ms));

        output.push_str("\n[routing]\n");
        output.push_str(&format!("take = {}\n", self.routing.take));
        output.push_str(&format!("proto_filter = \"{}\"\n", self.routing.proto_filter));

        output.push_str("\n[telemetry]\n");
        output.push_str(&format!(
            "log_level = \"{}\"\n",
            self.link.telemetry.log_level
        ));

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RacerConfig::default();
        assert!(config.link.connection.use_https);
        assert_eq!(config.polling.interval_ms, 1000);
        assert!(!config.routing.take);
    }

    #[test]
    fn test_to_toml() {
        let mut config = RacerConfig::default();
        config.link.connection.host = "racer.local".to_string();
        config.link.connection.api_token = "SRK_abcdefghijkl".to_string();

        let toml = config.to_toml();
        assert!(toml.contains("[connection]"));
        assert!(toml.contains("host = \"racer.local\""));
        assert!(toml.contains("[routing]"));
        assert!(!toml.contains("abcdefghijkl"));
    }

    #[test]
    fn test_to_toml_parses_back() {
        let config = RacerConfig::default();
        let parsed: RacerConfig = toml::from_str(&config.to_toml()).unwrap();
        assert_eq!(parsed.polling, config.polling);
        assert_eq!(parsed.routing, config.routing);
    }
}
