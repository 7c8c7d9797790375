//! Device commands
//!
//! A command is one atomic instruction for a device backend. Commands are
//! produced by the differ, queued once, and discarded after the sink has been
//! called. They always carry the [`Origin`] of the state that caused them.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state::Origin;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Backend operation, e.g. `"programInput"` or `"setFaderLevel"`.
    pub name: String,
    /// Hierarchical address the operation applies to.
    pub target: String,
    pub value: Value,
    pub priority: i32,
    pub origin: Option<Origin>,
    /// Human-readable explanation for logs.
    pub context: String,
}

impl Command {
    pub fn new(name: impl Into<String>, target: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            value,
            priority: 0,
            origin: None,
            context: String::new(),
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    /// Attach the origin and take its priority.
    pub fn with_origin(mut self, origin: Option<Origin>) -> Self {
        if let Some(o) = &origin {
            self.priority = o.priority;
        }
        self.origin = origin;
        self
    }

    /// Timeline object id that caused this command, if known.
    pub fn origin_object(&self) -> Option<&str> {
        self.origin.as_ref().map(|o| o.object_id.as_str())
    }

    /// `name@target`, used in logs and errors.
    pub fn label(&self) -> String {
        format!("{}@{}", self.name, self.target)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.label(), self.value)?;
        if let Some(object) = self.origin_object() {
            write!(f, " (from {})", object)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_with_origin_sets_priority() {
        let cmd = Command::new("level", "channels.1.level", json!(-4)).with_origin(Some(Origin {
            object_id: "obj_b".to_string(),
            layer: "fader_b".to_string(),
            priority: 1,
        }));
        assert_eq!(cmd.priority, 1);
        assert_eq!(cmd.origin_object(), Some("obj_b"));
        assert_eq!(cmd.to_string(), "level@channels.1.level = -4 (from obj_b)");
    }

    #[test]
    fn test_label() {
        let cmd = Command::new("cut", "mixEffect.0", Value::Null);
        assert_eq!(cmd.label(), "cut@mixEffect.0");
        assert_eq!(cmd.origin_object(), None);
    }
}
