//! Minimal configuration loading for onair.
//!
//! Imported by every onair crate, so it keeps its dependency list short.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/onair/config.toml` (system)
//! 2. `~/.config/onair/config.toml` (user)
//! 3. `./onair.toml` (local override, replaced by a CLI path when given)
//! 4. Environment variables (`ONAIR_*`, `RUST_LOG`)
//!
//! Tables from each file are deep-merged before deserialising, so a local file
//! only needs the keys it changes.
//!
//! # Example Config
//!
//! ```toml
//! [scheduler]
//! dispatch = "burst"
//! slow_sent_ms = 50
//! slow_fulfilled_ms = 200
//!
//! [telemetry]
//! log_level = "info,onair=debug"
//!
//! [devices.vision]
//! profile = "mixer"
//! dispatch = "in_order"
//!
//! [devices.audio]
//! profile = "fader"
//! ```

pub mod devices;
pub mod infra;
pub mod loader;

pub use devices::DeviceConfig;
pub use infra::{DispatchMode, SchedulerConfig, TelemetryConfig};
pub use loader::{discover_config_files_with_override, ConfigSources};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
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
}

/// Complete onair configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OnAirConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Device instances keyed by device id.
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceConfig>,
}

impl OnAirConfig {
    /// Load configuration from all standard sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration, letting `config_path` replace `./onair.toml`.
    pub fn load_from(config_path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration and report which files and env vars contributed.
    pub fn load_with_sources_from(
        config_path: Option<&std::path::Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut merged = toml::Table::new();

        for path in loader::discover_config_files_with_override(config_path) {
            let table = loader::load_table(&path)?;
            loader::merge_tables(&mut merged, table);
            sources.files.push(path);
        }

        let origin = sources
            .files
            .last()
            .cloned()
            .unwrap_or_else(|| PathBuf::from("<defaults>"));
        let mut config = loader::table_to_config(merged, &origin)?;

        loader::apply_env_overrides(&mut config, &mut sources);

        Ok((config, sources))
    }

    /// Parse a single TOML document, without env overrides.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let path = PathBuf::from("<string>");
        let table = loader::parse_table(contents, &path)?;
        loader::table_to_config(table, &path)
    }

    /// Serialize config to a TOML string.
    pub fn to_toml(&self) -> String {
        let mut output = String::from("# onair configuration\n\n");
        match toml::to_string_pretty(self) {
            Ok(body) => output.push_str(&body),
            Err(e) => output.push_str(&format!("# failed to render config: {}\n", e)),
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OnAirConfig::default();
        assert_eq!(config.scheduler.dispatch, DispatchMode::Burst);
        assert!(config.devices.is_empty());
    }

    #[test]
    fn test_to_toml() {
        let mut config = OnAirConfig::default();
        config.devices.insert(
            "vision".to_string(),
            DeviceConfig {
                profile: "mixer".to_string(),
                ..Default::default()
            },
        );
        let toml = config.to_toml();
        assert!(toml.contains("[scheduler]"));
        assert!(toml.contains("[devices.vision]"));
        assert!(toml.contains("profile = \"mixer\""));
    }

    #[test]
    fn test_from_toml_str() {
        let config = OnAirConfig::from_toml_str(
            r#"
[scheduler]
dispatch = "in_order"
slow_sent_ms = 50

[devices.audio]
profile = "fader"
slow_sent_ms = 20

[devices.audio.options]
host = "10.0.0.5"
"#,
        )
        .unwrap();

        assert_eq!(config.scheduler.dispatch, DispatchMode::InOrder);
        assert_eq!(config.scheduler.slow_sent_ms, Some(50));
        let audio = &config.devices["audio"];
        assert_eq!(audio.profile, "fader");
        assert_eq!(audio.slow_sent_ms, Some(20));
        assert_eq!(
            audio.options.get("host").and_then(|v| v.as_str()),
            Some("10.0.0.5")
        );
    }

    #[test]
    fn test_bad_dispatch_mode_is_parse_error() {
        let err = OnAirConfig::from_toml_str("[scheduler]\ndispatch = \"whenever\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
