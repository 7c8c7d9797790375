//! Error taxonomy
//!
//! Field- and command-granularity errors ([`ResolutionError`], [`DiffError`],
//! [`DispatchError`]) are collected and logged without aborting the batch they
//! occurred in. Structural misuse ([`SchedulingError`], [`TreeError`]) is
//! returned synchronously to the caller.

use thiserror::Error;

use crate::command::Command;
use crate::primitives::{DeviceId, LayerId, ObjectId, Timestamp};

/// Invalid use of the scheduler. Nothing was queued.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulingError {
    #[error("cannot schedule at negative time {0}")]
    NegativeTime(Timestamp),

    #[error("scheduler has been disposed")]
    Disposed,
}

/// Malformed command generator tree, rejected at construction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    #[error("duplicate field '{field}' under '{path}'")]
    DuplicateField { path: String, field: String },

    #[error("empty command name at '{path}'")]
    EmptyCommandName { path: String },

    #[error("empty field name under '{path}'")]
    EmptyFieldName { path: String },
}

/// A generator failed. Its commands are dropped; the rest of the tree still
/// diffs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("generator at '{target}' failed: {message}")]
pub struct DiffError {
    pub target: String,
    pub message: String,
}

impl DiffError {
    pub fn new(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            message: message.into(),
        }
    }
}

/// A mapping/content combination the resolver cannot project. The affected
/// fields are skipped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("layer {layer}: content must be an object, got {found}")]
    UnsupportedContent { layer: LayerId, found: &'static str },

    #[error("layer {layer}: overridePriority must be an integer")]
    InvalidPriority { layer: LayerId },

    #[error("layer {layer}: composite element {index} has no mappedLayer")]
    MissingCompositeTarget { layer: LayerId, index: usize },

    #[error("layer {layer}: composite target {target} has no mapping")]
    UnmappedCompositeTarget { layer: LayerId, target: LayerId },

    #[error("layer {layer}: composite target {target} belongs to device {device}")]
    ForeignCompositeTarget {
        layer: LayerId,
        target: LayerId,
        device: DeviceId,
    },

    #[error("layer {layer}: {message}")]
    Projection { layer: LayerId, message: String },
}

/// The command sink rejected or failed a command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("sending {command} failed: {message}")]
pub struct DispatchError {
    /// `name@target` of the failed command.
    pub command: String,
    /// Timeline object that caused the command.
    pub origin: Option<ObjectId>,
    pub message: String,
}

impl DispatchError {
    pub fn new(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            origin: None,
            message: message.into(),
        }
    }

    pub fn for_command(command: &Command, message: impl Into<String>) -> Self {
        Self {
            command: command.label(),
            origin: command.origin.as_ref().map(|o| o.object_id.clone()),
            message: message.into(),
        }
    }
}

/// Errors surfaced by [`DeviceSession`](crate::DeviceSession).
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("device {0} has been terminated")]
    Terminated(DeviceId),

    #[error("device {device}: cannot {operation} while {state}")]
    InvalidState {
        device: DeviceId,
        operation: &'static str,
        state: &'static str,
    },

    #[error("device {device}: handshake failed: {source}")]
    Handshake {
        device: DeviceId,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Scheduling(#[from] SchedulingError),
}

/// Readable text for a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduling_error_display() {
        let err = SchedulingError::NegativeTime(Timestamp(-5));
        assert_eq!(err.to_string(), "cannot schedule at negative time -5ms");
    }

    #[test]
    fn test_resolution_error_names_layer() {
        let err = ResolutionError::UnmappedCompositeTarget {
            layer: "audio_all".to_string(),
            target: "fader9".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "layer audio_all: composite target fader9 has no mapping"
        );
    }
}
