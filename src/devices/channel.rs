//! Identity value types shared by the registry, the allocator and the dispatch loop.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Platform-assigned id of an opened device, stable while the device stays connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub u32);

/// 0-based virtual joystick slot. Drivers usually number their devices from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VirtualSlot(pub u8);

impl fmt::Display for VirtualSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "virtual #{}", u16::from(self.0) + 1)
    }
}

/// Arena index of a device record inside the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub usize);

/// Arena index of a control object inside the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ControlId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Axis,
    Button,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Axis => write!(f, "axis"),
            ChannelKind::Button => write!(f, "button"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Input,
    Output,
}

/// Stable key a device is looked up by.
///
/// Physical devices are matched by product name or GUID string, virtual devices by slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeviceIdentity {
    Physical(String),
    Virtual(VirtualSlot),
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceIdentity::Physical(name) => write!(f, "'{}'", name),
            DeviceIdentity::Virtual(slot) => write!(f, "{}", slot),
        }
    }
}

/// Uniquely identifies one input or output channel on the platform side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId {
    pub instance: InstanceId,
    pub kind: ChannelKind,
    pub index: u8,
}

/// Result of a registration or an allocation: where the control lives and its handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelRef {
    pub device: DeviceId,
    pub kind: ChannelKind,
    pub index: u8,
    pub control: ControlId,
}
