//! Declarative state differ
//!
//! A backend describes its device once as a [`CommandGeneratorTree`]: for
//! every field of its [`DeviceState`], either a fixed command name, a
//! generator function, a nested tree, or a per-key template ([`GeneratorNode::Each`]).
//! [`CommandGeneratorTree::diff`] walks that description depth-first in
//! lock-step with the old and new states and returns the commands that move
//! the device from one to the other.
//!
//! Ordering is the tree's declared field order, so trees list prerequisites
//! (select transition, route input) before the fields that depend on them
//! (start transition, take). The differ never reorders by priority.
//!
//! Fields whose new value is absent are skipped, so sparse states diff
//! safely. A field absent on the old side counts as "no prior value".

use std::collections::HashSet;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::command::Command;
use crate::error::{panic_message, DiffError, TreeError};
use crate::state::DeviceState;

/// Everything a generator may look at. Generators must treat it as read-only
/// and return the same commands for the same input.
pub struct GeneratorInput<'a> {
    pub value: &'a Value,
    /// `None` when the old state had nothing at this path.
    pub old_value: Option<&'a Value>,
    pub state: &'a DeviceState,
    pub old_state: &'a DeviceState,
    /// Accumulated command target, e.g. `"mixEffect.0.transition"`.
    pub target: &'a str,
    /// Path of the field inside the state.
    pub path: &'a [String],
}

pub type GeneratorFn =
    dyn Fn(&GeneratorInput<'_>) -> anyhow::Result<Option<Vec<Command>>> + Send + Sync;

/// When a generator is invoked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Gate {
    /// Only when the new value differs (deep equality) from the old one.
    #[default]
    Changed,
    /// On every diff where the new value is present; the generator does its
    /// own comparison (e.g. set-style comparison of lists).
    Always,
}

/// One node of the generator tree.
#[derive(Clone)]
pub enum GeneratorNode {
    /// Emit `{name, target, value}` when the value changed.
    Command(String),
    Generator {
        gate: Gate,
        generate: Arc<GeneratorFn>,
    },
    /// Fixed set of named fields, walked in declared order. `fragment`
    /// replaces the field key in the command target.
    Tree {
        fragment: Option<String>,
        fields: Vec<(String, GeneratorNode)>,
    },
    /// Apply `node` to every key of the new sub-object, in key order. Keys
    /// only present in the old state are absent values and get skipped.
    Each {
        fragment: Option<String>,
        node: Box<GeneratorNode>,
    },
    /// Declared but never diffed.
    Ignore,
}

impl GeneratorNode {
    pub fn command(name: impl Into<String>) -> Self {
        GeneratorNode::Command(name.into())
    }

    pub fn generator<F>(generate: F) -> Self
    where
        F: Fn(&GeneratorInput<'_>) -> anyhow::Result<Option<Vec<Command>>> + Send + Sync + 'static,
    {
        GeneratorNode::Generator {
            gate: Gate::Changed,
            generate: Arc::new(generate),
        }
    }

    pub fn generator_always<F>(generate: F) -> Self
    where
        F: Fn(&GeneratorInput<'_>) -> anyhow::Result<Option<Vec<Command>>> + Send + Sync + 'static,
    {
        GeneratorNode::Generator {
            gate: Gate::Always,
            generate: Arc::new(generate),
        }
    }

    pub fn tree<K: Into<String>>(fields: impl IntoIterator<Item = (K, GeneratorNode)>) -> Self {
        GeneratorNode::Tree {
            fragment: None,
            fields: fields.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    pub fn each(node: GeneratorNode) -> Self {
        GeneratorNode::Each {
            fragment: None,
            node: Box::new(node),
        }
    }

    /// Address this sub-tree as `fragment` instead of its field key. No-op on
    /// leaf nodes.
    pub fn at(mut self, new_fragment: impl Into<String>) -> Self {
        match &mut self {
            GeneratorNode::Tree { fragment, .. } | GeneratorNode::Each { fragment, .. } => {
                *fragment = Some(new_fragment.into());
            }
            _ => {}
        }
        self
    }

    fn fragment(&self) -> Option<&str> {
        match self {
            GeneratorNode::Tree { fragment, .. } | GeneratorNode::Each { fragment, .. } => {
                fragment.as_deref()
            }
            _ => None,
        }
    }
}

impl fmt::Debug for GeneratorNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GeneratorNode::Command(name) => f.debug_tuple("Command").field(name).finish(),
            GeneratorNode::Generator { gate, .. } => {
                f.debug_struct("Generator").field("gate", gate).finish_non_exhaustive()
            }
            GeneratorNode::Tree { fragment, fields } => f
                .debug_struct("Tree")
                .field("fragment", fragment)
                .field("fields", fields)
                .finish(),
            GeneratorNode::Each { fragment, node } => f
                .debug_struct("Each")
                .field("fragment", fragment)
                .field("node", node)
                .finish(),
            GeneratorNode::Ignore => f.write_str("Ignore"),
        }
    }
}

/// Commands produced by one diff, plus the generators that failed.
#[derive(Debug, Clone, Default)]
pub struct Diff {
    pub commands: Vec<Command>,
    pub errors: Vec<DiffError>,
}

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Validated, immutable description of how one device's state maps to
/// commands. Shared by every diff of a session.
#[derive(Debug, Clone)]
pub struct CommandGeneratorTree {
    fields: Vec<(String, GeneratorNode)>,
}

impl CommandGeneratorTree {
    /// Validate and wrap the top-level fields.
    pub fn new<K: Into<String>>(
        fields: impl IntoIterator<Item = (K, GeneratorNode)>,
    ) -> Result<Self, TreeError> {
        let fields: Vec<(String, GeneratorNode)> =
            fields.into_iter().map(|(k, v)| (k.into(), v)).collect();
        validate_fields(&fields, "")?;
        Ok(Self { fields })
    }

    /// Commands that move a device from `old` to `new`.
    pub fn diff(&self, old: &DeviceState, new: &DeviceState) -> Diff {
        let mut walk = Walk {
            old_state: old,
            new_state: new,
            path: Vec::new(),
            target: Vec::new(),
            out: Diff::default(),
        };
        walk.fields(&self.fields, Some(new.root()), Some(old.root()));
        walk.out
    }
}

fn validate_fields(fields: &[(String, GeneratorNode)], path: &str) -> Result<(), TreeError> {
    let mut seen = HashSet::new();
    for (key, node) in fields {
        if key.is_empty() {
            return Err(TreeError::EmptyFieldName {
                path: path.to_string(),
            });
        }
        if !seen.insert(key.as_str()) {
            return Err(TreeError::DuplicateField {
                path: path.to_string(),
                field: key.clone(),
            });
        }
        let child_path = if path.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", path, key)
        };
        validate_node(node, &child_path)?;
    }
    Ok(())
}

fn validate_node(node: &GeneratorNode, path: &str) -> Result<(), TreeError> {
    match node {
        GeneratorNode::Command(name) if name.is_empty() => Err(TreeError::EmptyCommandName {
            path: path.to_string(),
        }),
        GeneratorNode::Tree { fields, .. } => validate_fields(fields, path),
        GeneratorNode::Each { node, .. } => validate_node(node, &format!("{}.*", path)),
        _ => Ok(()),
    }
}

struct Walk<'a> {
    old_state: &'a DeviceState,
    new_state: &'a DeviceState,
    path: Vec<String>,
    target: Vec<String>,
    out: Diff,
}

impl<'a> Walk<'a> {
    fn fields(
        &mut self,
        fields: &[(String, GeneratorNode)],
        new: Option<&'a Value>,
        old: Option<&'a Value>,
    ) {
        let Some(new_map) = new.and_then(Value::as_object) else {
            return;
        };
        let old_map = old.and_then(Value::as_object);

        for (key, node) in fields {
            let Some(child_new) = new_map.get(key) else {
                continue;
            };
            let child_old = old_map.and_then(|m| m.get(key));
            self.enter(key, node, child_new, child_old);
        }
    }

    fn enter(&mut self, key: &str, node: &GeneratorNode, new: &'a Value, old: Option<&'a Value>) {
        self.path.push(key.to_string());
        self.target.push(node.fragment().unwrap_or(key).to_string());
        self.node(node, new, old);
        self.target.pop();
        self.path.pop();
    }

    fn node(&mut self, node: &GeneratorNode, new: &'a Value, old: Option<&'a Value>) {
        if new.is_null() {
            return;
        }

        match node {
            GeneratorNode::Command(name) => {
                if old == Some(new) {
                    return;
                }
                let origin = self.new_state.origin_for(&self.path).cloned();
                let context = match old {
                    Some(previous) => format!("{}: {} -> {}", self.path.join("."), previous, new),
                    None => format!("{}: unset -> {}", self.path.join("."), new),
                };
                self.out.commands.push(
                    Command::new(name.clone(), self.target.join("."), new.clone())
                        .with_origin(origin)
                        .with_context(context),
                );
            }
            GeneratorNode::Generator { gate, generate } => {
                if *gate == Gate::Changed && old == Some(new) {
                    return;
                }
                self.generate(generate, new, old);
            }
            GeneratorNode::Tree { fields, .. } => {
                self.fields(fields, Some(new), old);
            }
            GeneratorNode::Each { node, .. } => {
                let Some(new_map) = new.as_object() else {
                    debug!(path = %self.path.join("."), "expected an object for per-key node");
                    return;
                };
                let old_map = old.and_then(Value::as_object);
                let mut keys: Vec<&'a String> = new_map.keys().collect();
                keys.sort();
                for key in keys {
                    let child_old = old_map.and_then(|m| m.get(key));
                    self.enter(key, node, &new_map[key], child_old);
                }
            }
            GeneratorNode::Ignore => {}
        }
    }

    fn generate(&mut self, generate: &Arc<GeneratorFn>, new: &'a Value, old: Option<&'a Value>) {
        let target = self.target.join(".");
        let input = GeneratorInput {
            value: new,
            old_value: old,
            state: self.new_state,
            old_state: self.old_state,
            target: &target,
            path: &self.path,
        };

        // A panicking generator costs only its own commands.
        let outcome = match catch_unwind(AssertUnwindSafe(|| generate(&input))) {
            Ok(result) => result.map_err(|e| format!("{:#}", e)),
            Err(panic) => Err(panic_message(panic.as_ref())),
        };

        match outcome {
            Ok(Some(commands)) => {
                let origin = self.new_state.origin_for(&self.path);
                self.out.commands.extend(commands.into_iter().map(|cmd| {
                    if cmd.origin.is_none() {
                        cmd.with_origin(origin.cloned())
                    } else {
                        cmd
                    }
                }));
            }
            Ok(None) => {}
            Err(message) => {
                let error = DiffError::new(target, message);
                warn!(
                    target_path = %error.target,
                    origin = ?self.new_state.origin_for(&self.path).map(|o| &o.object_id),
                    error = %error.message,
                    "generator failed, dropping its commands"
                );
                self.out.errors.push(error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Origin;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn mixer_tree() -> CommandGeneratorTree {
        CommandGeneratorTree::new([
            (
                "mixEffects",
                GeneratorNode::each(GeneratorNode::tree([
                    ("transitionStyle", GeneratorNode::command("transitionStyle")),
                    ("previewInput", GeneratorNode::command("previewInput")),
                    ("programInput", GeneratorNode::command("programInput")),
                    (
                        "keyer",
                        GeneratorNode::tree([("onAir", GeneratorNode::command("keyerOnAir"))])
                            .at("keyer"),
                    ),
                ]))
                .at("mixEffect"),
            ),
            ("label", GeneratorNode::Ignore),
        ])
        .unwrap()
    }

    fn state(value: Value) -> DeviceState {
        DeviceState::from_value(value)
    }

    #[test]
    fn test_identical_states_produce_nothing() {
        let tree = mixer_tree();
        let s = state(json!({
            "mixEffects": {"0": {"programInput": 1, "previewInput": 2, "keyer": {"onAir": true}}},
            "label": "studio"
        }));
        let diff = tree.diff(&s, &s);
        assert!(diff.commands.is_empty());
        assert!(diff.errors.is_empty());
    }

    #[test]
    fn test_changed_leaf_emits_command_with_target() {
        let tree = mixer_tree();
        let old = state(json!({"mixEffects": {"0": {"programInput": 1}}}));
        let new = state(json!({"mixEffects": {"0": {"programInput": 5}}}));

        let diff = tree.diff(&old, &new);
        assert_eq!(diff.commands.len(), 1);
        let cmd = &diff.commands[0];
        assert_eq!(cmd.name, "programInput");
        assert_eq!(cmd.target, "mixEffect.0.programInput");
        assert_eq!(cmd.value, json!(5));
    }

    #[test]
    fn test_declared_order_not_state_order() {
        let tree = mixer_tree();
        let old = state(json!({}));
        let new = state(json!({"mixEffects": {"0": {
            "programInput": 3,
            "transitionStyle": "mix",
            "previewInput": 4
        }}}));

        let names: Vec<_> = tree
            .diff(&old, &new)
            .commands
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["transitionStyle", "previewInput", "programInput"]);
    }

    #[test]
    fn test_each_walks_keys_sorted() {
        let tree = mixer_tree();
        let new = state(json!({"mixEffects": {
            "1": {"programInput": 7},
            "0": {"programInput": 6}
        }}));
        let targets: Vec<_> = tree
            .diff(&DeviceState::empty(), &new)
            .commands
            .into_iter()
            .map(|c| c.target)
            .collect();
        assert_eq!(
            targets,
            vec!["mixEffect.0.programInput", "mixEffect.1.programInput"]
        );
    }

    #[test]
    fn test_absent_new_values_skipped() {
        let tree = mixer_tree();
        let old = state(json!({"mixEffects": {"0": {"programInput": 1, "previewInput": 2}}}));
        let new = state(json!({"mixEffects": {"0": {"programInput": 1}}}));
        assert!(tree.diff(&old, &new).commands.is_empty());

        let null_new = state(json!({"mixEffects": {"0": {"programInput": null}}}));
        assert!(tree.diff(&old, &null_new).commands.is_empty());
    }

    #[test]
    fn test_ignored_fields_never_diffed() {
        let tree = mixer_tree();
        let old = state(json!({"label": "a"}));
        let new = state(json!({"label": "b"}));
        assert!(tree.diff(&old, &new).commands.is_empty());
    }

    #[test]
    fn test_nested_fragment_addressing() {
        let tree = mixer_tree();
        let new = state(json!({"mixEffects": {"0": {"keyer": {"onAir": true}}}}));
        let diff = tree.diff(&DeviceState::empty(), &new);
        assert_eq!(diff.commands[0].target, "mixEffect.0.keyer.onAir");
        assert_eq!(diff.commands[0].name, "keyerOnAir");
    }

    #[test]
    fn test_generator_sees_missing_old_value() {
        let tree = CommandGeneratorTree::new([(
            "macro",
            GeneratorNode::generator(|input| {
                let verb = if input.old_value.is_none() { "load" } else { "swap" };
                Ok(Some(vec![Command::new(verb, input.target, input.value.clone())]))
            }),
        )])
        .unwrap();

        let new = state(json!({"macro": 3}));
        let first = tree.diff(&DeviceState::empty(), &new);
        assert_eq!(first.commands[0].name, "load");

        let second = tree.diff(&state(json!({"macro": 2})), &new);
        assert_eq!(second.commands[0].name, "swap");
    }

    #[test]
    fn test_gate_changed_skips_equal_values() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let tree = CommandGeneratorTree::new([(
            "inputs",
            GeneratorNode::generator(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }),
        )])
        .unwrap();

        let s = state(json!({"inputs": [1, 2, 3]}));
        tree.diff(&s, &s);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        tree.diff(&state(json!({"inputs": [1, 2]})), &s);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_gate_always_invokes_on_equal_values() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let tree = CommandGeneratorTree::new([(
            "inputs",
            GeneratorNode::generator_always(move |input| {
                counter.fetch_add(1, Ordering::SeqCst);
                // set-style comparison: order does not matter
                let mut new: Vec<i64> = input
                    .value
                    .as_array()
                    .map(|a| a.iter().filter_map(Value::as_i64).collect())
                    .unwrap_or_default();
                let mut old: Vec<i64> = input
                    .old_value
                    .and_then(Value::as_array)
                    .map(|a| a.iter().filter_map(Value::as_i64).collect())
                    .unwrap_or_default();
                new.sort();
                old.sort();
                if new == old {
                    return Ok(None);
                }
                Ok(Some(vec![Command::new("setInputs", input.target, input.value.clone())]))
            }),
        )])
        .unwrap();

        let a = state(json!({"inputs": [3, 1, 2]}));
        let b = state(json!({"inputs": [1, 2, 3]}));
        assert!(tree.diff(&a, &a).commands.is_empty());
        assert!(tree.diff(&a, &b).commands.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failing_generator_is_isolated() {
        let tree = CommandGeneratorTree::new([
            ("before", GeneratorNode::command("before")),
            (
                "broken",
                GeneratorNode::generator(|_| anyhow::bail!("unsupported transition")),
            ),
            ("after", GeneratorNode::command("after")),
        ])
        .unwrap();

        let new = state(json!({"before": 1, "broken": 2, "after": 3}));
        let diff = tree.diff(&DeviceState::empty(), &new);

        let names: Vec<_> = diff.commands.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["before", "after"]);
        assert_eq!(diff.errors.len(), 1);
        assert_eq!(diff.errors[0].target, "broken");
        assert!(diff.errors[0].message.contains("unsupported transition"));
    }

    #[test]
    fn test_panicking_generator_is_isolated() {
        let tree = CommandGeneratorTree::new([
            ("before", GeneratorNode::command("before")),
            ("broken", GeneratorNode::generator(|_| panic!("bad macro index"))),
            ("after", GeneratorNode::command("after")),
        ])
        .unwrap();

        let new = state(json!({"before": 1, "broken": 2, "after": 3}));
        let diff = tree.diff(&DeviceState::empty(), &new);

        let names: Vec<_> = diff.commands.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["before", "after"]);
        assert_eq!(diff.errors.len(), 1);
        assert_eq!(diff.errors[0].target, "broken");
        assert_eq!(diff.errors[0].message, "panicked: bad macro index");
    }

    #[test]
    fn test_commands_carry_origin() {
        let tree = CommandGeneratorTree::new([
            ("level", GeneratorNode::command("level")),
            (
                "scene",
                GeneratorNode::generator(|input| {
                    Ok(Some(vec![Command::new("recall", input.target, input.value.clone())]))
                }),
            ),
        ])
        .unwrap();

        let mut new = state(json!({"level": -4, "scene": 2}));
        new.set_origin(
            &["level"],
            Origin {
                object_id: "obj_level".to_string(),
                layer: "fader".to_string(),
                priority: 1,
            },
        );
        new.set_origin(
            &["scene"],
            Origin {
                object_id: "obj_scene".to_string(),
                layer: "lights".to_string(),
                priority: 0,
            },
        );

        let diff = tree.diff(&DeviceState::empty(), &new);
        assert_eq!(diff.commands[0].origin_object(), Some("obj_level"));
        assert_eq!(diff.commands[0].priority, 1);
        assert_eq!(diff.commands[1].origin_object(), Some("obj_scene"));
    }

    #[test]
    fn test_diff_is_deterministic() {
        let tree = mixer_tree();
        let old = state(json!({"mixEffects": {"0": {"programInput": 1}, "1": {"previewInput": 2}}}));
        let new = state(json!({"mixEffects": {
            "0": {"programInput": 2, "transitionStyle": "wipe"},
            "1": {"previewInput": 3, "keyer": {"onAir": false}}
        }}));

        let first = tree.diff(&old, &new).commands;
        for _ in 0..5 {
            assert_eq!(tree.diff(&old, &new).commands, first);
        }
    }

    #[test]
    fn test_every_changed_leaf_is_targeted() {
        let tree = mixer_tree();
        let old = state(json!({"mixEffects": {"0": {"programInput": 1, "previewInput": 1, "transitionStyle": "mix"}}}));
        let new = state(json!({"mixEffects": {"0": {"programInput": 2, "previewInput": 3, "transitionStyle": "wipe"}}}));

        let targets: HashSet<String> = tree
            .diff(&old, &new)
            .commands
            .into_iter()
            .map(|c| c.target)
            .collect();
        for field in ["programInput", "previewInput", "transitionStyle"] {
            assert!(targets.contains(&format!("mixEffect.0.{}", field)), "{} not targeted", field);
        }
    }

    #[test]
    fn test_tree_validation() {
        let dup = CommandGeneratorTree::new([
            ("a", GeneratorNode::command("a")),
            ("a", GeneratorNode::command("b")),
        ]);
        assert_eq!(
            dup.unwrap_err(),
            TreeError::DuplicateField {
                path: String::new(),
                field: "a".to_string()
            }
        );

        let empty = CommandGeneratorTree::new([(
            "me",
            GeneratorNode::each(GeneratorNode::tree([("cut", GeneratorNode::command(""))])),
        )]);
        assert_eq!(
            empty.unwrap_err(),
            TreeError::EmptyCommandName {
                path: "me.*.cut".to_string()
            }
        );
    }
}
