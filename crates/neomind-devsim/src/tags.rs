//! Log and control-plane tags.
//!
//! Every device log line is tagged `[SCOPE][OP][deviceId][DIR][SUB]`, and every
//! control-plane transition is a `[scope, op, event]` triple. The short wire
//! forms are what operators see in consoles, so `Display` renders them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which part of the device emitted the line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    #[serde(rename = "HUB")]
    Hub,
    #[serde(rename = "DPS")]
    Dps,
    #[serde(rename = "DEV")]
    Device,
    #[serde(rename = "EDG")]
    Edge,
    #[serde(rename = "MOD")]
    Module,
    #[serde(rename = "LEA")]
    Leaf,
    #[serde(rename = "FNC")]
    Function,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hub => "HUB",
            Self::Dps => "DPS",
            Self::Device => "DEV",
            Self::Edge => "EDG",
            Self::Module => "MOD",
            Self::Leaf => "LEA",
            Self::Function => "FNC",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What kind of work the line describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    #[serde(rename = "PROC")]
    Proc,
    #[serde(rename = "TWIN")]
    Twin,
    #[serde(rename = "MSG")]
    Msg,
    #[serde(rename = "METH")]
    Method,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proc => "PROC",
            Self::Twin => "TWIN",
            Self::Msg => "MSG",
            Self::Method => "METH",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Data direction relative to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "RECV")]
    Recv,
    #[serde(rename = "SEND")]
    Send,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Recv => "RECV",
            Self::Send => "SEND",
        })
    }
}

/// Control-plane event, the third element of a control-plane triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ControlEvent {
    On,
    #[default]
    Off,
    Init,
    Success,
    Connected,
    Trying,
    Error,
    Delay,
}

impl fmt::Display for ControlEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::On => "ON",
            Self::Off => "OFF",
            Self::Init => "INIT",
            Self::Success => "SUCCESS",
            Self::Connected => "CONNECTED",
            Self::Trying => "TRYING",
            Self::Error => "ERROR",
            Self::Delay => "DELAY",
        })
    }
}

/// A `[scope, op, event]` control-plane triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlPlane(pub Scope, pub Operation, pub ControlEvent);

/// Sub-message marking a component-scoped send.
pub const SUB_COMPONENT: &str = "C";

/// Format a device console line.
pub fn format_line(
    scope: Scope,
    op: Operation,
    device_id: &str,
    direction: Option<Direction>,
    sub: Option<&str>,
    message: &str,
) -> String {
    let mut line = format!("[{}][{}][{}]", scope, op, device_id);
    if let Some(direction) = direction {
        line.push_str(&format!("[{}]", direction));
    }
    if let Some(sub) = sub.filter(|s| !s.is_empty()) {
        line.push_str(&format!("[{}]", sub));
    }
    line.push(' ');
    line.push_str(message);
    line
}
