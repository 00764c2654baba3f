//! Device Probe: decides whether a udev device record is a joystick-class
//! input device, and if so extracts its node path and display name.

use std::path::PathBuf;

use log::trace;
use tokio_udev::Device;

const EVENT_NODE_PREFIX: &str = "/dev/input/event";

/// An accepted joystick device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbedJoystick {
    pub node: PathBuf,
    pub name: String,
}

/// Applies the three acceptance rules in order. Rejection is not an
/// error: a keyboard, mouse, or legacy `js*` node simply isn't a match.
pub fn probe(device: &Device) -> Option<ProbedJoystick> {
    if device.property_value("ID_INPUT_JOYSTICK").and_then(|v| v.to_str()) != Some("1") {
        return None;
    }

    let node = device.devnode()?;
    if !node.to_string_lossy().starts_with(EVENT_NODE_PREFIX) {
        trace!("{node:?} has ID_INPUT_JOYSTICK=1 but is not an evdev node, skipping");
        return None;
    }

    let name = parent_name(device).unwrap_or_else(|| node.to_string_lossy().into_owned());

    Some(ProbedJoystick {
        node: node.to_owned(),
        name,
    })
}

fn parent_name(device: &Device) -> Option<String> {
    let parent = device.parent()?;
    let name = parent.property_value("NAME")?.to_str()?;
    let name = name.trim_matches('"');
    if name.is_empty() {
        None
    } else {
        Some(name.to_owned())
    }
}
