//! Built-in device profiles.
//!
//! A profile is the only device-specific code a backend needs: its generator
//! tree, its default state, and its lane split. Configuration picks one by
//! name (`profile = "mixer"`).

use anyhow::{bail, Result};
use serde_json::Value;

use crate::command::Command;
use crate::differ::{CommandGeneratorTree, GeneratorInput, GeneratorNode};
use crate::error::TreeError;
use crate::primitives::LaneId;
use crate::session::DeviceProfile;
use crate::state::DeviceState;

pub const MIXER: &str = "mixer";
pub const FADER: &str = "fader";

pub fn names() -> &'static [&'static str] {
    &[MIXER, FADER]
}

/// Look up a built-in profile by name.
pub fn builtin(name: &str) -> Result<Option<DeviceProfile>, TreeError> {
    match name {
        MIXER => mixer().map(Some),
        FADER => fader().map(Some),
        _ => Ok(None),
    }
}

/// Vision mixer: mix effects with transition style, preview/program inputs
/// and keyers, plus auxiliary outputs and macros. One lane per mix effect.
///
/// Targets look like `mixEffect.0.programInput`, `mixEffect.0.keyer.1.onAir`,
/// `aux.2`.
pub fn mixer() -> Result<DeviceProfile, TreeError> {
    let tree = CommandGeneratorTree::new([
        (
            "mixEffects",
            GeneratorNode::each(GeneratorNode::tree([
                // Style and preview go first; the take depends on both.
                ("transitionStyle", GeneratorNode::command("transitionStyle")),
                ("previewInput", GeneratorNode::command("previewInput")),
                ("programInput", GeneratorNode::generator(program_input)),
                (
                    "keyers",
                    GeneratorNode::each(GeneratorNode::tree([
                        ("fillSource", GeneratorNode::command("keyerFill")),
                        ("onAir", GeneratorNode::command("keyerOnAir")),
                    ]))
                    .at("keyer"),
                ),
            ]))
            .at("mixEffect"),
        ),
        ("auxiliaries", GeneratorNode::each(GeneratorNode::command("auxSource")).at("aux")),
        ("macros", GeneratorNode::generator_always(run_macros)),
        ("label", GeneratorNode::Ignore),
    ])?;

    Ok(DeviceProfile::new(MIXER, tree).with_lanes(mix_effect_lane))
}

/// Audio console: per-channel level and mute plus a master level. Single
/// lane; levels are in dB.
pub fn fader() -> Result<DeviceProfile, TreeError> {
    let tree = CommandGeneratorTree::new([
        (
            "channels",
            GeneratorNode::each(GeneratorNode::tree([
                ("muted", GeneratorNode::command("setMute")),
                ("level", GeneratorNode::command("setFaderLevel")),
            ]))
            .at("channel"),
        ),
        ("master", GeneratorNode::tree([("level", GeneratorNode::command("setMasterLevel"))])),
    ])?;

    let mut base = DeviceState::empty();
    base.set(&["master", "level"], Value::from(0));

    Ok(DeviceProfile::new(FADER, tree).with_base_state(base))
}

/// `mixEffect.N.*` commands share lane `mixEffect.N`; everything else uses
/// the default lane.
fn mix_effect_lane(command: &Command) -> LaneId {
    let mut parts = command.target.split('.');
    match (parts.next(), parts.next()) {
        (Some("mixEffect"), Some(index)) => LaneId::new(format!("mixEffect.{}", index)),
        _ => LaneId::default(),
    }
}

/// Cut straight to the input, or run the mix effect's auto transition when a
/// non-cut style is set.
fn program_input(input: &GeneratorInput<'_>) -> Result<Option<Vec<Command>>> {
    let Some(source) = input.value.as_u64() else {
        bail!("program input must be an input number, got {}", input.value);
    };

    let mut style_path: Vec<&str> = input.path.iter().map(String::as_str).collect();
    style_path.pop();
    style_path.push("transitionStyle");

    let name = match input.state.get(&style_path).and_then(Value::as_str) {
        None | Some("cut") => "cut",
        Some(_) => "autoTransition",
    };
    Ok(Some(vec![Command::new(name, input.target, Value::from(source))]))
}

/// Macros are a list of macro ids; run the ones not already in the old list.
fn run_macros(input: &GeneratorInput<'_>) -> Result<Option<Vec<Command>>> {
    let Some(new) = input.value.as_array() else {
        bail!("macros must be a list, got {}", input.value);
    };
    let old = input.old_value.and_then(Value::as_array);

    let commands: Vec<Command> = new
        .iter()
        .filter(|id| !old.is_some_and(|old| old.contains(*id)))
        .map(|id| Command::new("runMacro", input.target, id.clone()))
        .collect();

    Ok((!commands.is_empty()).then_some(commands))
}
