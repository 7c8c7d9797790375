//! Command sinks that need no real device.
//!
//! [`LoggingSink`] backs `onaird play`; [`MemorySink`] records what it was
//! sent and can be told to fail, which is what the session tests use.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use crate::command::Command;
use crate::primitives::DeviceId;
use crate::session::CommandSink;

/// Logs every command instead of sending it anywhere.
#[derive(Debug, Clone)]
pub struct LoggingSink {
    device: DeviceId,
}

impl LoggingSink {
    pub fn new(device: impl Into<DeviceId>) -> Self {
        Self {
            device: device.into(),
        }
    }
}

#[async_trait]
impl CommandSink for LoggingSink {
    async fn connect(&self, options: &Value) -> Result<()> {
        info!(device.id = %self.device, options = %options, "connected (logging sink)");
        Ok(())
    }

    async fn send_command(&self, command: &Command) -> Result<()> {
        info!(
            device.id = %self.device,
            command.name = %command.name,
            command.target = %command.target,
            command.origin = command.origin_object().unwrap_or("-"),
            value = %command.value,
            "{}",
            command.context
        );
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        info!(device.id = %self.device, "disconnected (logging sink)");
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Recorded {
    sent: Vec<Command>,
    failing_targets: HashSet<String>,
    refuse_connect: bool,
    connects: usize,
    disconnects: usize,
}

/// In-memory sink that records commands.
#[derive(Debug, Default)]
pub struct MemorySink {
    inner: Mutex<Recorded>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Recorded> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail every command addressed to `target` from now on.
    pub fn fail_target(&self, target: impl Into<String>) {
        self.lock().failing_targets.insert(target.into());
    }

    pub fn heal_target(&self, target: &str) {
        self.lock().failing_targets.remove(target);
    }

    pub fn refuse_connect(&self, refuse: bool) {
        self.lock().refuse_connect = refuse;
    }

    pub fn sent(&self) -> Vec<Command> {
        self.lock().sent.clone()
    }

    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    pub fn disconnects(&self) -> usize {
        self.lock().disconnects
    }
}

#[async_trait]
impl CommandSink for MemorySink {
    async fn connect(&self, _options: &Value) -> Result<()> {
        let mut inner = self.lock();
        if inner.refuse_connect {
            bail!("connection refused");
        }
        inner.connects += 1;
        Ok(())
    }

    async fn send_command(&self, command: &Command) -> Result<()> {
        let mut inner = self.lock();
        if inner.failing_targets.contains(&command.target) {
            bail!("device rejected {}", command.target);
        }
        inner.sent.push(command.clone());
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.lock().disconnects += 1;
        Ok(())
    }
}
