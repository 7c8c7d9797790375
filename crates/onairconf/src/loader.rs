//! Config file discovery, loading, and environment variable overlay.

use crate::{ConfigError, DispatchMode, OnAirConfig};
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
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
/// Returns paths in load order (system, user, local/cli).
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/onair/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("onair/config.toml");
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

    let local = PathBuf::from("onair.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Read a TOML file into a raw table.
pub fn load_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    parse_table(&contents, path)
}

pub(crate) fn parse_table(contents: &str, path: &Path) -> Result<toml::Table, ConfigError> {
    contents.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Deserialize a merged table. `path` is only used for error reporting.
pub(crate) fn table_to_config(table: toml::Table, path: &Path) -> Result<OnAirConfig, ConfigError> {
    toml::Value::Table(table)
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Deep-merge `overlay` into `base`. Nested tables merge key by key; any
/// other value in `overlay` replaces the one in `base`.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut OnAirConfig, sources: &mut ConfigSources) {
    if let Ok(v) = env::var("ONAIR_DISPATCH") {
        if let Ok(mode) = v.parse::<DispatchMode>() {
            config.scheduler.dispatch = mode;
            sources.env_overrides.push("ONAIR_DISPATCH".to_string());
        }
    }
    if let Ok(v) = env::var("ONAIR_SLOW_SENT_MS") {
        if let Ok(ms) = v.parse() {
            config.scheduler.slow_sent_ms = Some(ms);
            sources.env_overrides.push("ONAIR_SLOW_SENT_MS".to_string());
        }
    }
    if let Ok(v) = env::var("ONAIR_SLOW_FULFILLED_MS") {
        if let Ok(ms) = v.parse() {
            config.scheduler.slow_fulfilled_ms = Some(ms);
            sources.env_overrides.push("ONAIR_SLOW_FULFILLED_MS".to_string());
        }
    }
    if let Ok(v) = env::var("ONAIR_MAX_WAKE_MS") {
        if let Ok(ms) = v.parse() {
            config.scheduler.max_wake_ms = ms;
            sources.env_overrides.push("ONAIR_MAX_WAKE_MS".to_string());
        }
    }

    if let Ok(v) = env::var("ONAIR_LOG_LEVEL") {
        config.telemetry.log_level = v;
        sources.env_overrides.push("ONAIR_LOG_LEVEL".to_string());
    }
    // Also support RUST_LOG
    if let Ok(v) = env::var("RUST_LOG") {
        config.telemetry.log_level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_discover_config_files() {
        // Just verify it doesn't panic
        let _files = discover_config_files();
    }

    #[test]
    fn test_merge_tables_is_deep() {
        let mut base = parse_table(
            r#"
[scheduler]
dispatch = "in_order"
slow_sent_ms = 50

[devices.vision]
profile = "mixer"
"#,
            Path::new("base.toml"),
        )
        .unwrap();
        let overlay = parse_table(
            r#"
[scheduler]
slow_sent_ms = 20

[devices.audio]
profile = "fader"
"#,
            Path::new("overlay.toml"),
        )
        .unwrap();

        merge_tables(&mut base, overlay);
        let config = table_to_config(base, Path::new("merged")).unwrap();

        assert_eq!(config.scheduler.dispatch, DispatchMode::InOrder);
        assert_eq!(config.scheduler.slow_sent_ms, Some(20));
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.devices["vision"].profile, "mixer");
    }

    #[test]
    fn test_parse_error_names_file() {
        let err = parse_table("[scheduler\n", Path::new("broken.toml")).unwrap_err();
        match err {
            ConfigError::Parse { path, .. } => assert_eq!(path, PathBuf::from("broken.toml")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_load_with_cli_override() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[scheduler]
slow_fulfilled_ms = 300

[devices.lights]
profile = "lighting"
dispatch = "in_order"
"#
        )
        .unwrap();

        let (config, sources) = OnAirConfig::load_with_sources_from(Some(file.path())).unwrap();
        assert!(sources.files.iter().any(|p| p == file.path()));
        assert_eq!(config.devices["lights"].dispatch, Some(DispatchMode::InOrder));
        if !sources.env_overrides.iter().any(|v| v == "ONAIR_SLOW_FULFILLED_MS") {
            assert_eq!(config.scheduler.slow_fulfilled_ms, Some(300));
        }
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = load_table(Path::new("/nonexistent/onair.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileRead { .. }));
    }
}
