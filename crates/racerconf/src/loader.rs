//! Config file discovery, loading, and environment variable overlay.

use crate::{ConfigError, RacerConfig};
use crate::link::{ConnectionConfig, LinkConfig, TelemetryConfig};
use crate::routing::{PollingConfig, RoutingConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local).
/// Only returns files that exist.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/racerlink/config.toml");
    if system.exists() {
        files.push(system);
    }

    // User config (XDG_CONFIG_HOME or ~/.config)
    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("racerlink/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("racerlink.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Load config from a TOML file.
pub fn load_from_file(path: &Path) -> Result<RacerConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    parse_toml(&contents, path)
}

fn parse_toml(contents: &str, path: &Path) -> Result<RacerConfig, ConfigError> {
    toml::from_str(contents).map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Pick the overlay value unless it is still the compiled default.
///
/// An overlay cannot tell "unset" from "set to the default", so a later file
/// cannot restore a default that an earlier file changed. Use an env override
/// (e.g. `RACERLINK_USE_HTTPS=true`) for that.
fn pick<T: PartialEq>(base: T, overlay: T, default: T) -> T {
    if overlay != default {
        overlay
    } else {
        base
    }
}

/// Merge two configs, with `overlay` taking precedence field by field.
pub fn merge_configs(base: RacerConfig, overlay: RacerConfig) -> RacerConfig {
    let conn_default = ConnectionConfig::default();
    let polling_default = PollingConfig::default();
    let routing_default = RoutingConfig::default();
    let telemetry_default = TelemetryConfig::default();

    RacerConfig {
        link: LinkConfig {
            connection: ConnectionConfig {
                host: pick(
                    base.link.connection.host,
                    overlay.link.connection.host,
                    conn_default.host,
                ),
                use_https: pick(
                    base.link.connection.use_https,
                    overlay.link.connection.use_https,
                    conn_default.use_https,
                ),
                api_token: pick(
                    base.link.connection.api_token,
                    overlay.link.connection.api_token,
                    conn_default.api_token,
                ),
            },
            telemetry: TelemetryConfig {
                log_level: pick(
                    base.link.telemetry.log_level,
                    overlay.link.telemetry.log_level,
                    telemetry_default.log_level,
                ),
            },
        },
        polling: PollingConfig {
            interval_ms: pick(
                base.polling.interval_ms,
                overlay.polling.interval_ms,
                polling_default.interval_ms,
            ),
        },
        routing: RoutingConfig {
            take: pick(base.routing.take, overlay.routing.take, routing_default.take),
            proto_filter: pick(
                base.routing.proto_filter,
                overlay.routing.proto_filter,
                routing_default.proto_filter,
            ),
        },
    }
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut RacerConfig, sources: &mut ConfigSources) {
    apply_overrides_from(config, sources, |key| env::var(key).ok());
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Apply overrides from an arbitrary variable lookup.
fn apply_overrides_from<F>(config: &mut RacerConfig, sources: &mut ConfigSources, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = lookup("RACERLINK_HOST") {
        config.link.connection.host = v;
        sources.env_overrides.push("RACERLINK_HOST".to_string());
    }
    if let Some(v) = lookup("RACERLINK_API_TOKEN") {
        config.link.connection.api_token = v;
        sources.env_overrides.push("RACERLINK_API_TOKEN".to_string());
    }
    if let Some(v) = lookup("RACERLINK_USE_HTTPS").and_then(|v| parse_bool(&v)) {
        config.link.connection.use_https = v;
        sources.env_overrides.push("RACERLINK_USE_HTTPS".to_string());
    }

    if let Some(v) = lookup("RACERLINK_POLL_INTERVAL_MS") {
        if let Ok(ms) = v.trim().parse() {
            config.polling.interval_ms = ms;
            sources.env_overrides.push("RACERLINK_POLL_INTERVAL_MS".to_string());
        }
    }

    if let Some(v) = lookup("RACERLINK_TAKE").and_then(|v| parse_bool(&v)) {
        config.routing.take = v;
        sources.env_overrides.push("RACERLINK_TAKE".to_string());
    }
    if let Some(v) = lookup("RACERLINK_PROTO_FILTER") {
        config.routing.proto_filter = v;
        sources.env_overrides.push("RACERLINK_PROTO_FILTER".to_string());
    }

    if let Some(v) = lookup("RACERLINK_LOG_LEVEL") {
        config.link.telemetry.log_level = v;
        sources.env_overrides.push("RACERLINK_LOG_LEVEL".to_string());
    }
    // Also support RUST_LOG
    if let Some(v) = lookup("RUST_LOG") {
        config.link.telemetry.log_level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_discover_config_files() {
        // Just verify it doesn't panic
        let _files = discover_config_files();
    }

    #[test]
    fn test_parse_minimal_toml() {
        let toml = r#"
[connection]
host = "10.0.0.20"
"#;
        let config = parse_toml(toml, Path::new("test.toml")).unwrap();
        assert_eq!(config.link.connection.host, "10.0.0.20");
        // Other values should be defaults
        assert!(config.link.connection.use_https);
        assert_eq!(config.polling.interval_ms, 1000);
        assert_eq!(config.link.telemetry.log_level, "info");
    }

    #[test]
    fn test_parse_full_toml() {
        let toml = r#"
[connection]
host = "racer.studio-a"
use_https = false
api_token = "SRK_abcdefghij12"

[polling]
interval_ms = 500

[routing]
take = true
proto_filter = "MADI,GPI"

[telemetry]
log_level = "debug"
"#;
        let config = parse_toml(toml, Path::new("test.toml")).unwrap();

        assert_eq!(config.link.connection.host, "racer.studio-a");
        assert!(!config.link.connection.use_https);
        assert_eq!(config.link.connection.api_token, "SRK_abcdefghij12");
        assert_eq!(config.polling.interval_ms, 500);
        assert!(config.routing.take);
        assert_eq!(config.routing.proto_filter, "MADI,GPI");
        assert_eq!(config.link.telemetry.log_level, "debug");
    }

    #[test]
    fn test_parse_error_names_file() {
        let err = parse_toml("[connection\nhost=", Path::new("broken.toml")).unwrap_err();
        assert!(err.to_string().contains("broken.toml"));
    }

    #[test]
    fn test_merge_overlay_wins() {
        let mut base = RacerConfig::default();
        base.link.connection.host = "base-host".to_string();
        base.link.connection.api_token = "SRK_basebasebase".to_string();
        base.polling.interval_ms = 2000;

        let mut overlay = RacerConfig::default();
        overlay.link.connection.host = "overlay-host".to_string();
        overlay.routing.take = true;

        let merged = merge_configs(base, overlay);
        assert_eq!(merged.link.connection.host, "overlay-host");
        assert_eq!(merged.link.connection.api_token, "SRK_basebasebase");
        assert_eq!(merged.polling.interval_ms, 2000);
        assert!(merged.routing.take);
    }

    #[test]
    fn test_merge_cannot_restore_default() {
        let mut base = RacerConfig::default();
        base.link.connection.use_https = false;
        base.polling.interval_ms = 2000;

        let mut overlay = RacerConfig::default();
        overlay.link.connection.use_https = true;
        overlay.polling.interval_ms = 1000;

        let merged = merge_configs(base, overlay);
        assert!(!merged.link.connection.use_https);
        assert_eq!(merged.polling.interval_ms, 2000);

        let mut sources = ConfigSources::default();
        let mut config = merged;
        apply_overrides_from(&mut config, &mut sources, |k| match k {
            "RACERLINK_USE_HTTPS" => Some("true".to_string()),
            _ => None,
        });
        assert!(config.link.connection.use_https);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[routing]\ntake = true").unwrap();

        let config = load_from_file(file.path()).unwrap();
        assert!(config.routing.take);
    }

    #[test]
    fn test_missing_file() {
        let err = load_from_file(Path::new("/nonexistent/racerlink.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileRead { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("RACERLINK_HOST", "10.1.1.1"),
            ("RACERLINK_USE_HTTPS", "false"),
            ("RACERLINK_POLL_INTERVAL_MS", "750"),
            ("RACERLINK_TAKE", "yes"),
            ("RACERLINK_LOG_LEVEL", "warn"),
        ]
        .into_iter()
        .collect();

        let mut config = RacerConfig::default();
        let mut sources = ConfigSources::default();
        apply_overrides_from(&mut config, &mut sources, |k| {
            vars.get(k).map(|v| v.to_string())
        });

        assert_eq!(config.link.connection.host, "10.1.1.1");
        assert!(!config.link.connection.use_https);
        assert_eq!(config.polling.interval_ms, 750);
        assert!(config.routing.take);
        assert_eq!(config.link.telemetry.log_level, "warn");
        assert_eq!(sources.env_overrides.len(), 5);
    }

    #[test]
    fn test_env_garbage_ignored() {
        let mut config = RacerConfig::default();
        let mut sources = ConfigSources::default();
        apply_overrides_from(&mut config, &mut sources, |k| match k {
            "RACERLINK_POLL_INTERVAL_MS" => Some("soon".to_string()),
            "RACERLINK_TAKE" => Some("maybe".to_string()),
            _ => None,
        });

        assert_eq!(config.polling.interval_ms, 1000);
        assert!(!config.routing.take);
        assert!(sources.env_overrides.is_empty());
    }
}
