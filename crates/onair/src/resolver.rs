//! Timeline to device-state projection
//!
//! Takes the externally resolved timeline (layer → object, content, instance)
//! and the layer mappings, and builds the one [`DeviceState`] a device should
//! show. Only layers mapped to this device contribute.
//!
//! Conflicts are settled by priority: every field write gets
//! `content.overridePriority ?? mapping.priority ?? 0`, writes are
//! stable-sorted ascending, and later writes win. Layers are visited in name
//! order, so equal priorities resolve the same way on every call.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::ResolutionError;
use crate::primitives::{DeviceId, LayerId, ObjectId, Timestamp};
use crate::state::{DeviceState, Origin};

/// Content key carrying a per-object priority override.
pub const OVERRIDE_PRIORITY_KEY: &str = "overridePriority";
/// Content key carrying composite fan-out elements.
pub const COMPOSITE_KEY: &str = "composite";
/// Key inside a composite element naming the layer whose mapping it uses.
pub const MAPPED_LAYER_KEY: &str = "mappedLayer";

/// Enable window of a resolved timeline object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub start: Timestamp,
    #[serde(default)]
    pub end: Option<Timestamp>,
}

impl Instance {
    pub fn covers(&self, time: Timestamp) -> bool {
        self.start <= time && self.end.map_or(true, |end| time < end)
    }
}

/// One active layer of the resolved timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedLayer {
    pub object_id: ObjectId,
    pub content: Value,
    pub instance: Instance,
}

/// State of the whole timeline at one time, as delivered by the timeline
/// library. Read-only here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResolvedTimelineState {
    pub layers: BTreeMap<LayerId, ResolvedLayer>,
}

impl ResolvedTimelineState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_layer(
        mut self,
        layer: impl Into<LayerId>,
        object_id: impl Into<ObjectId>,
        content: Value,
        instance: Instance,
    ) -> Self {
        self.layers.insert(
            layer.into(),
            ResolvedLayer {
                object_id: object_id.into(),
                content,
                instance,
            },
        );
        self
    }
}

/// Binds a layer to a device and a place inside its state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mapping {
    pub device: DeviceId,
    /// Where the layer's content lands in the device state.
    #[serde(default)]
    pub path: Vec<String>,
    #[serde(default)]
    pub priority: Option<i32>,
}

impl Mapping {
    pub fn new<S: Into<String>>(device: impl Into<DeviceId>, path: impl IntoIterator<Item = S>) -> Self {
        Self {
            device: device.into(),
            path: path.into_iter().map(Into::into).collect(),
            priority: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }
}

pub type Mappings = BTreeMap<LayerId, Mapping>;

/// One value written at one state path.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldWrite {
    pub path: Vec<String>,
    pub value: Value,
}

/// Turns one layer's content into field writes. Backends with content that
/// does not map one-to-one onto state paths provide their own.
pub trait ContentProjector: Send + Sync {
    fn project(
        &self,
        layer: &str,
        mapping: &Mapping,
        content: &Map<String, Value>,
    ) -> Result<Vec<FieldWrite>, ResolutionError>;
}

/// Default projector: every leaf of the content lands under `mapping.path`.
/// Objects are walked, anything else (arrays included) is a leaf.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlattenProjector;

impl ContentProjector for FlattenProjector {
    fn project(
        &self,
        _layer: &str,
        mapping: &Mapping,
        content: &Map<String, Value>,
    ) -> Result<Vec<FieldWrite>, ResolutionError> {
        let mut writes = Vec::new();
        let mut path = mapping.path.clone();
        flatten_into(content, &mut path, &mut writes);
        Ok(writes)
    }
}

fn flatten_into(map: &Map<String, Value>, path: &mut Vec<String>, writes: &mut Vec<FieldWrite>) {
    for (key, value) in map {
        if key == OVERRIDE_PRIORITY_KEY || key == COMPOSITE_KEY {
            continue;
        }
        path.push(key.clone());
        match value {
            Value::Object(inner) if !inner.is_empty() => flatten_into(inner, path, writes),
            _ => writes.push(FieldWrite {
                path: path.clone(),
                value: value.clone(),
            }),
        }
        path.pop();
    }
}

/// Output of one resolution: the state plus the fields that had to be
/// skipped.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub state: DeviceState,
    pub errors: Vec<ResolutionError>,
}

struct PendingWrite {
    priority: i32,
    origin: Origin,
    write: FieldWrite,
}

/// Per-device projection of resolved timelines.
#[derive(Clone)]
pub struct Resolver {
    device: DeviceId,
    base: DeviceState,
    projector: Arc<dyn ContentProjector>,
}

impl Resolver {
    pub fn new(device: impl Into<DeviceId>) -> Self {
        Self {
            device: device.into(),
            base: DeviceState::empty(),
            projector: Arc::new(FlattenProjector),
        }
    }

    /// State the resolver starts from, so unconstrained fields fall back to
    /// device defaults instead of disappearing.
    pub fn with_base(mut self, base: DeviceState) -> Self {
        self.base = base;
        self
    }

    pub fn with_projector(mut self, projector: Arc<dyn ContentProjector>) -> Self {
        self.projector = projector;
        self
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// Build the device state implied by `timeline` at `time`.
    pub fn resolve(
        &self,
        timeline: &ResolvedTimelineState,
        mappings: &Mappings,
        time: Timestamp,
    ) -> Resolution {
        let mut errors = Vec::new();
        let mut pending = Vec::new();

        // BTreeMap iteration is lexicographic by layer name.
        for (layer, resolved) in &timeline.layers {
            let Some(mapping) = mappings.get(layer) else {
                continue;
            };
            if mapping.device != self.device {
                continue;
            }
            if !resolved.instance.covers(time) {
                debug!(
                    device.id = %self.device,
                    layer = %layer,
                    object = %resolved.object_id,
                    "instance not active at {}, skipping",
                    time
                );
                continue;
            }

            if let Err(e) =
                self.collect_layer(layer, resolved, mapping, mappings, &mut pending, &mut errors)
            {
                errors.push(e);
            }
        }

        // Stable: equal priorities keep layer order, so the later layer wins.
        pending.sort_by_key(|w| w.priority);

        let mut state = self.base.clone();
        for PendingWrite {
            origin,
            write,
            ..
        } in pending
        {
            state.set(&write.path, write.value);
            state.set_origin(&write.path, origin);
        }

        for error in &errors {
            warn!(device.id = %self.device, error = %error, "skipped timeline content");
        }

        Resolution { state, errors }
    }

    fn collect_layer(
        &self,
        layer: &str,
        resolved: &ResolvedLayer,
        mapping: &Mapping,
        mappings: &Mappings,
        pending: &mut Vec<PendingWrite>,
        errors: &mut Vec<ResolutionError>,
    ) -> Result<(), ResolutionError> {
        let content = resolved
            .content
            .as_object()
            .ok_or_else(|| ResolutionError::UnsupportedContent {
                layer: layer.to_string(),
                found: json_kind(&resolved.content),
            })?;

        let override_priority = read_override_priority(layer, content)?;
        let priority = override_priority.or(mapping.priority).unwrap_or(0);
        let origin = Origin {
            object_id: resolved.object_id.clone(),
            layer: layer.to_string(),
            priority,
        };

        for write in self.projector.project(layer, mapping, content)? {
            pending.push(PendingWrite {
                priority,
                origin: origin.clone(),
                write,
            });
        }

        if let Some(composite) = content.get(COMPOSITE_KEY) {
            self.collect_composite(
                layer,
                resolved,
                composite,
                override_priority,
                mappings,
                pending,
                errors,
            );
        }

        Ok(())
    }

    /// Fan one object out to the mappings of other layers. Each element
    /// inherits the composite's override priority unless it sets its own.
    /// A bad element is reported and skipped; its siblings still apply.
    #[allow(clippy::too_many_arguments)]
    fn collect_composite(
        &self,
        layer: &str,
        resolved: &ResolvedLayer,
        composite: &Value,
        inherited_priority: Option<i32>,
        mappings: &Mappings,
        pending: &mut Vec<PendingWrite>,
        errors: &mut Vec<ResolutionError>,
    ) {
        let Some(elements) = composite.as_array() else {
            errors.push(ResolutionError::Projection {
                layer: layer.to_string(),
                message: format!("composite must be an array, got {}", json_kind(composite)),
            });
            return;
        };

        for (index, element) in elements.iter().enumerate() {
            if let Err(e) = self.collect_composite_element(
                layer,
                resolved,
                index,
                element,
                inherited_priority,
                mappings,
                pending,
            ) {
                errors.push(e);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn collect_composite_element(
        &self,
        layer: &str,
        resolved: &ResolvedLayer,
        index: usize,
        element: &Value,
        inherited_priority: Option<i32>,
        mappings: &Mappings,
        pending: &mut Vec<PendingWrite>,
    ) -> Result<(), ResolutionError> {
        let Some(element) = element.as_object() else {
            return Err(ResolutionError::UnsupportedContent {
                layer: layer.to_string(),
                found: json_kind(element),
            });
        };
        let target = element
            .get(MAPPED_LAYER_KEY)
            .and_then(Value::as_str)
            .ok_or(ResolutionError::MissingCompositeTarget {
                layer: layer.to_string(),
                index,
            })?;
        let target_mapping =
            mappings
                .get(target)
                .ok_or_else(|| ResolutionError::UnmappedCompositeTarget {
                    layer: layer.to_string(),
                    target: target.to_string(),
                })?;
        if target_mapping.device != self.device {
            return Err(ResolutionError::ForeignCompositeTarget {
                layer: layer.to_string(),
                target: target.to_string(),
                device: target_mapping.device.clone(),
            });
        }

        let own_priority = read_override_priority(layer, element)?;
        let priority = own_priority
            .or(inherited_priority)
            .or(target_mapping.priority)
            .unwrap_or(0);
        let origin = Origin {
            object_id: resolved.object_id.clone(),
            layer: layer.to_string(),
            priority,
        };

        let mut fields = element.clone();
        fields.remove(MAPPED_LAYER_KEY);
        for write in self.projector.project(target, target_mapping, &fields)? {
            pending.push(PendingWrite {
                priority,
                origin: origin.clone(),
                write,
            });
        }

        Ok(())
    }
}

fn read_override_priority(
    layer: &str,
    content: &Map<String, Value>,
) -> Result<Option<i32>, ResolutionError> {
    match content.get(OVERRIDE_PRIORITY_KEY) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_i64()
            .and_then(|p| i32::try_from(p).ok())
            .map(Some)
            .ok_or_else(|| ResolutionError::InvalidPriority {
                layer: layer.to_string(),
            }),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
