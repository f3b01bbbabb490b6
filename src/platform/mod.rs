//! Platform seams: the joystick event source and the virtual joystick driver
//!
//! Both are external collaborators. The engine only sees the traits below:
//!
//! ```text
//! EventSource ──[RawEvent]──► dispatch thread
//! VirtualDriver ──open(slot)──► VirtualOutput ◄──writes── main context
//! ```
//!
//! Two backends ship with the crate:
//!
//! 1. [`loopback`] - in-process simulated devices, the virtual outputs echo back as events
//! 2. [`gilrs_backend`] - physical joysticks through gilrs, virtual devices via loopback

use crate::devices::channel::{ChannelId, ChannelKind, InstanceId, VirtualSlot};
use std::time::Duration;

#[cfg(feature = "gilrs")]
pub mod gilrs_backend;
pub mod loopback;

/// Highest value accepted by [`VirtualOutput::set_axis`].
pub const VIRTUAL_AXIS_MAX: u16 = 0x8000;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Failed to initialize backend: {0}")]
    Initialization(String),

    #[error("Event source torn down: {0}")]
    Disconnected(String),

    #[error("Failed to open {slot}: {reason}")]
    Open { slot: VirtualSlot, reason: String },

    #[error("Write rejected: {0}")]
    Write(String),
}

/// What the platform reports about one connected device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub instance: InstanceId,
    pub name: String,
    pub guid: String,
    /// Set when the device is one of the virtual joysticks this process can drive.
    pub virtual_slot: Option<VirtualSlot>,
    pub axes: u8,
    pub buttons: u8,
    pub hats: u8,
}

impl DeviceDescriptor {
    pub fn capacity(&self, kind: ChannelKind) -> u8 {
        match kind {
            ChannelKind::Axis => self.axes,
            ChannelKind::Button => self.buttons,
        }
    }
}

/// One event as delivered by the blocking wait.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawEvent {
    Axis {
        instance: InstanceId,
        index: u8,
        value: i16,
    },
    Button {
        instance: InstanceId,
        index: u8,
        pressed: bool,
    },
    Hat {
        instance: InstanceId,
        index: u8,
        value: u8,
    },
}

/// Native channel value carried from the dispatch thread to the owning control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawValue {
    Axis(i16),
    Button(bool),
}

impl RawEvent {
    pub fn instance(&self) -> InstanceId {
        match *self {
            RawEvent::Axis { instance, .. }
            | RawEvent::Button { instance, .. }
            | RawEvent::Hat { instance, .. } => instance,
        }
    }

    /// Hats are never routed, so they have no channel id.
    pub fn channel(&self) -> Option<(ChannelId, RawValue)> {
        match *self {
            RawEvent::Axis {
                instance,
                index,
                value,
            } => Some((
                ChannelId {
                    instance,
                    kind: ChannelKind::Axis,
                    index,
                },
                RawValue::Axis(value),
            )),
            RawEvent::Button {
                instance,
                index,
                pressed,
            } => Some((
                ChannelId {
                    instance,
                    kind: ChannelKind::Button,
                    index,
                },
                RawValue::Button(pressed),
            )),
            RawEvent::Hat { .. } => None,
        }
    }
}

/// Blocking source of joystick events. Lives on the dispatch thread only.
pub trait EventSource {
    /// Enumerate every device the source can report events for.
    fn devices(&mut self) -> Result<Vec<DeviceDescriptor>, BackendError>;

    /// Block until the next event or until `timeout` elapses.
    ///
    /// An error means the source is gone for good.
    fn wait_event(&mut self, timeout: Duration) -> Result<Option<RawEvent>, BackendError>;
}

/// Builds the event source on the dispatch thread, some platform APIs are not `Send`.
pub type SourceFactory = Box<dyn FnOnce() -> Result<Box<dyn EventSource>, BackendError> + Send>;

/// Opens exclusive write handles on virtual joysticks.
pub trait VirtualDriver: Send {
    fn open(&mut self, slot: VirtualSlot) -> Result<Box<dyn VirtualOutput>, BackendError>;
}

/// Exclusive writer for one virtual joystick. Indexes are 1-based, as drivers expect.
pub trait VirtualOutput: Send {
    fn set_axis(&mut self, axis: u8, value: u16) -> Result<(), BackendError>;
    fn set_button(&mut self, button: u8, pressed: bool) -> Result<(), BackendError>;
}
