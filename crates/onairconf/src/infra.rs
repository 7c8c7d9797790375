//! Process-wide settings: scheduler defaults and telemetry.

use serde::{Deserialize, Serialize};

/// How a device scheduler dispatches due entries.
///
/// - `Burst`: every due entry fires immediately, nothing waits on a previous
///   send.
/// - `InOrder`: within one lane the next entry waits until the previous send
///   has settled. Lanes never wait on each other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    #[default]
    Burst,
    InOrder,
}

impl DispatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchMode::Burst => "burst",
            DispatchMode::InOrder => "in_order",
        }
    }
}

impl std::str::FromStr for DispatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "burst" => Ok(DispatchMode::Burst),
            "in_order" | "inorder" => Ok(DispatchMode::InOrder),
            other => Err(format!("unknown dispatch mode: {}", other)),
        }
    }
}

impl std::fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduler defaults applied to every device unless overridden.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Dispatch discipline.
    /// Default: burst
    #[serde(default)]
    pub dispatch: DispatchMode,

    /// Report a slow-sent diagnostic when an entry is dispatched more than
    /// this many ms after its planned time. Unset disables the check.
    #[serde(default)]
    pub slow_sent_ms: Option<u64>,

    /// Report a slow-fulfilled diagnostic when a send settles more than this
    /// many ms after its planned time. Unset disables the check.
    #[serde(default)]
    pub slow_fulfilled_ms: Option<u64>,

    /// Upper bound on how long the wake loop sleeps between evaluations.
    /// Default: 1000
    #[serde(default = "SchedulerConfig::default_max_wake_ms")]
    pub max_wake_ms: u64,
}

impl SchedulerConfig {
    fn default_max_wake_ms() -> u64 {
        1000
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            dispatch: DispatchMode::default(),
            slow_sent_ms: None,
            slow_fulfilled_ms: None,
            max_wake_ms: Self::default_max_wake_ms(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// `EnvFilter` directive string.
    /// Default: info,onair=debug
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info,onair=debug".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}
