//! Device state snapshots and their history
//!
//! A [`DeviceState`] is the attribute tree a device should show at one
//! instant, e.g. `{"mixEffects": {"0": {"programInput": 3}}}`. Snapshots are
//! values: cloning is cheap (`Arc`) and writes copy on demand, so a snapshot
//! handed to the differ or stored in [`StateHistory`] never changes underneath
//! its holder.
//!
//! Each written path also records the [`Origin`] (timeline object, layer,
//! priority) that produced it, so commands stay traceable to a rundown item.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::primitives::{LayerId, ObjectId, Timestamp};

/// Which timeline object wrote a piece of state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    pub object_id: ObjectId,
    pub layer: LayerId,
    pub priority: i32,
}

/// Immutable-by-default device attribute tree.
#[derive(Debug, Clone)]
pub struct DeviceState {
    root: Arc<Value>,
    origins: Arc<BTreeMap<Vec<String>, Origin>>,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self::empty()
    }
}

impl PartialEq for DeviceState {
    /// Two states are equal when their attribute trees are; origins are
    /// bookkeeping.
    fn eq(&self, other: &Self) -> bool {
        self.root == other.root
    }
}

impl DeviceState {
    pub fn empty() -> Self {
        Self::from_map(Map::new())
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self {
            root: Arc::new(Value::Object(map)),
            origins: Arc::new(BTreeMap::new()),
        }
    }

    /// Build from a JSON value. Anything other than an object yields an empty
    /// state.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self::from_map(map),
            _ => Self::empty(),
        }
    }

    pub fn root(&self) -> &Value {
        &self.root
    }

    pub fn is_empty(&self) -> bool {
        self.root.as_object().map_or(true, |m| m.is_empty())
    }

    /// Value at `path`, if every segment exists.
    pub fn get<S: AsRef<str>>(&self, path: &[S]) -> Option<&Value> {
        let mut current: &Value = &self.root;
        for segment in path {
            current = current.as_object()?.get(segment.as_ref())?;
        }
        Some(current)
    }

    /// Write `value` at `path`, creating intermediate objects. A non-object
    /// value sitting on the path is replaced by an object.
    pub fn set<S: AsRef<str>>(&mut self, path: &[S], value: Value) {
        let Some((last, parents)) = path.split_last() else {
            if let Value::Object(map) = value {
                self.root = Arc::new(Value::Object(map));
            }
            return;
        };

        let mut current = Arc::make_mut(&mut self.root);
        for segment in parents {
            let map = ensure_object(current);
            current = map
                .entry(segment.as_ref().to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        ensure_object(current).insert(last.as_ref().to_string(), value);
    }

    /// Record who wrote `path`.
    pub fn set_origin<S: AsRef<str>>(&mut self, path: &[S], origin: Origin) {
        let key: Vec<String> = path.iter().map(|s| s.as_ref().to_string()).collect();
        Arc::make_mut(&mut self.origins).insert(key, origin);
    }

    /// Origin for `path`: the exact path, else the nearest ancestor, else the
    /// first descendant in key order.
    pub fn origin_for<S: AsRef<str>>(&self, path: &[S]) -> Option<&Origin> {
        let key: Vec<String> = path.iter().map(|s| s.as_ref().to_string()).collect();

        for len in (0..=key.len()).rev() {
            if let Some(origin) = self.origins.get(&key[..len]) {
                return Some(origin);
            }
        }

        self.origins
            .range(key.clone()..)
            .take_while(|(k, _)| k.starts_with(&key))
            .map(|(_, origin)| origin)
            .next()
    }

    pub fn origins(&self) -> impl Iterator<Item = (&Vec<String>, &Origin)> {
        self.origins.iter()
    }
}

fn ensure_object(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value was just replaced by an object"),
    }
}

/// Result of looking up the state in effect at some time.
///
/// `Missing` is a distinct case rather than a silent empty default: it means
/// nothing was ever recorded up to that time (fresh session, or
/// history pruned past it). Callers decide how to treat it.
#[derive(Debug, Clone, PartialEq)]
pub enum PriorState {
    Found { time: Timestamp, state: DeviceState },
    Missing,
}

impl PriorState {
    /// The found state, or an empty one for `Missing`.
    pub fn into_state(self) -> DeviceState {
        match self {
            PriorState::Found { state, .. } => state,
            PriorState::Missing => DeviceState::empty(),
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, PriorState::Missing)
    }
}

/// Short linear history of computed device states keyed by effective time.
#[derive(Debug, Default)]
pub struct StateHistory {
    states: BTreeMap<Timestamp, DeviceState>,
}

impl StateHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `state` as effective from `time`. Anything recorded for a later
    /// time belonged to the superseded plan and is dropped.
    pub fn record(&mut self, time: Timestamp, state: DeviceState) {
        let _superseded = self.states.split_off(&(time + 1));
        self.states.insert(time, state);
    }

    /// The state recorded for the greatest time `<= time`.
    pub fn state_at(&self, time: Timestamp) -> PriorState {
        match self.states.range(..=time).next_back() {
            Some((t, state)) => PriorState::Found {
                time: *t,
                state: state.clone(),
            },
            None => PriorState::Missing,
        }
    }

    /// The state recorded for the greatest time `< time`. A state recorded
    /// exactly at `time` may belong to a plan that is about to be replaced, so
    /// it is never the baseline for a new plan at that time.
    pub fn state_before(&self, time: Timestamp) -> PriorState {
        match self.states.range(..time).next_back() {
            Some((t, state)) => PriorState::Found {
                time: *t,
                state: state.clone(),
            },
            None => PriorState::Missing,
        }
    }

    /// Drop states that are fully in the past: everything before the newest
    /// state strictly before `horizon` is removed. Returns how many were dropped.
    pub fn prune(&mut self, horizon: Timestamp) -> usize {
        let Some(keep_from) = self.states.range(..horizon).next_back().map(|(t, _)| *t) else {
            return 0;
        };
        let kept = self.states.split_off(&keep_from);
        let dropped = self.states.len();
        self.states = kept;
        dropped
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn times(&self) -> Vec<Timestamp> {
        self.states.keys().copied().collect()
    }

    pub fn clear(&mut self) {
        self.states.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn origin(object: &str) -> Origin {
        Origin {
            object_id: object.to_string(),
            layer: "layer".to_string(),
            priority: 0,
        }
    }

    #[test]
    fn test_set_and_get_nested() {
        let mut state = DeviceState::empty();
        state.set(&["mixEffects", "0", "programInput"], json!(3));
        state.set(&["mixEffects", "0", "previewInput"], json!(4));

        assert_eq!(state.get(&["mixEffects", "0", "programInput"]), Some(&json!(3)));
        assert_eq!(
            state.root(),
            &json!({"mixEffects": {"0": {"programInput": 3, "previewInput": 4}}})
        );
        assert_eq!(state.get(&["mixEffects", "1"]), None);
    }

    #[test]
    fn test_set_replaces_scalar_on_path() {
        let mut state = DeviceState::from_value(json!({"fader": 1}));
        state.set(&["fader", "level"], json!(-6));
        assert_eq!(state.root(), &json!({"fader": {"level": -6}}));
    }

    #[test]
    fn test_clone_is_copy_on_write() {
        let mut a = DeviceState::empty();
        a.set(&["x"], json!(1));
        let snapshot = a.clone();
        a.set(&["x"], json!(2));

        assert_eq!(snapshot.get(&["x"]), Some(&json!(1)));
        assert_eq!(a.get(&["x"]), Some(&json!(2)));
    }

    #[test]
    fn test_origin_lookup_prefers_exact_then_ancestor_then_descendant() {
        let mut state = DeviceState::empty();
        state.set_origin(&["channels", "1", "level"], origin("obj_level"));
        state.set_origin(&["channels", "2"], origin("obj_channel"));

        assert_eq!(
            state.origin_for(&["channels", "1", "level"]).unwrap().object_id,
            "obj_level"
        );
        assert_eq!(
            state.origin_for(&["channels", "2", "muted"]).unwrap().object_id,
            "obj_channel"
        );
        assert_eq!(
            state.origin_for(&["channels", "1"]).unwrap().object_id,
            "obj_level"
        );
        assert!(state.origin_for(&["lights"]).is_none());
    }

    #[test]
    fn test_equality_ignores_origins() {
        let mut a = DeviceState::from_value(json!({"x": 1}));
        let b = DeviceState::from_value(json!({"x": 1}));
        a.set_origin(&["x"], origin("o"));
        assert_eq!(a, b);
    }

    #[test]
    fn test_history_lookup_and_missing() {
        let mut history = StateHistory::new();
        assert!(history.state_at(Timestamp(100)).is_missing());

        history.record(Timestamp(100), DeviceState::from_value(json!({"x": 1})));
        history.record(Timestamp(200), DeviceState::from_value(json!({"x": 2})));

        assert!(history.state_at(Timestamp(99)).is_missing());
        match history.state_at(Timestamp(150)) {
            PriorState::Found { time, state } => {
                assert_eq!(time, Timestamp(100));
                assert_eq!(state.get(&["x"]), Some(&json!(1)));
            }
            PriorState::Missing => panic!("expected a state"),
        }
        assert_eq!(
            history.state_at(Timestamp(200)).into_state().get(&["x"]),
            Some(&json!(2))
        );
    }

    #[test]
    fn test_state_before_skips_state_at_same_time() {
        let mut history = StateHistory::new();
        history.record(Timestamp(100), DeviceState::from_value(json!({"x": 1})));
        history.record(Timestamp(200), DeviceState::from_value(json!({"x": 2})));

        assert!(history.state_before(Timestamp(100)).is_missing());
        match history.state_before(Timestamp(200)) {
            PriorState::Found { time, state } => {
                assert_eq!(time, Timestamp(100));
                assert_eq!(state.get(&["x"]), Some(&json!(1)));
            }
            PriorState::Missing => panic!("expected a state"),
        }
        assert_eq!(
            history.state_before(Timestamp(201)).into_state().get(&["x"]),
            Some(&json!(2))
        );
    }

    #[test]
    fn test_record_drops_superseded_future_states() {
        let mut history = StateHistory::new();
        history.record(Timestamp(100), DeviceState::empty());
        history.record(Timestamp(300), DeviceState::empty());
        history.record(Timestamp(200), DeviceState::empty());

        assert_eq!(history.times(), vec![Timestamp(100), Timestamp(200)]);
    }

    #[test]
    fn test_prune_keeps_state_in_effect() {
        let mut history = StateHistory::new();
        for t in [100, 200, 300, 400] {
            history.record(Timestamp(t), DeviceState::empty());
        }
        assert_eq!(history.times(), vec![Timestamp(100), Timestamp(200), Timestamp(300), Timestamp(400)]);

        let dropped = history.prune(Timestamp(250));
        assert_eq!(dropped, 1);
        assert_eq!(history.times(), vec![Timestamp(200), Timestamp(300), Timestamp(400)]);

        assert_eq!(history.prune(Timestamp(50)), 0);

        // A horizon landing on a recorded time keeps the state before it.
        assert_eq!(history.prune(Timestamp(300)), 0);
        assert_eq!(history.prune(Timestamp(400)), 1);
        assert_eq!(history.times(), vec![Timestamp(300), Timestamp(400)]);
    }
}
