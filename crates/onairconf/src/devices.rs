//! Per-device configuration.

use serde::{Deserialize, Serialize};

use crate::infra::{DispatchMode, SchedulerConfig};

/// One configured device instance.
///
/// Scheduler fields left unset fall back to the process-wide `[scheduler]`
/// section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Name of the device profile (generator tree + field semantics).
    #[serde(default)]
    pub profile: String,

    #[serde(default)]
    pub dispatch: Option<DispatchMode>,

    #[serde(default)]
    pub slow_sent_ms: Option<u64>,

    #[serde(default)]
    pub slow_fulfilled_ms: Option<u64>,

    /// Backend-specific options handed to the command sink on init.
    #[serde(default)]
    pub options: toml::Table,
}

impl DeviceConfig {
    /// Scheduler settings for this device after applying its overrides.
    pub fn scheduler(&self, defaults: &SchedulerConfig) -> SchedulerConfig {
        SchedulerConfig {
            dispatch: self.dispatch.unwrap_or(defaults.dispatch),
            slow_sent_ms: self.slow_sent_ms.or(defaults.slow_sent_ms),
            slow_fulfilled_ms: self.slow_fulfilled_ms.or(defaults.slow_fulfilled_ms),
            max_wake_ms: defaults.max_wake_ms,
        }
    }
}
