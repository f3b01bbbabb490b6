//! Control objects, one per registered channel
//!
//! Each concrete control implements only the capabilities its direction allows:
//!
//! | control        | ReadAxis | WriteAxis | ReadButton | WriteButton |
//! |----------------|----------|-----------|------------|-------------|
//! | `InputAxis`    | x        |           |            |             |
//! | `OutputAxis`   | x        | x         |            |             |
//! | `InputButton`  |          |           | x          |             |
//! | `OutputButton` |          |           | x          | x           |
//!
//! Controls never open devices. They hold the device's arena index and go through the
//! shared device table for every read and write.

use super::channel::{ChannelKind, ControlId, DeviceId, Direction};
use super::encoding::{decode_native, AxisEncoding};
use super::table::SharedDevices;
use crate::engine::timers::PulseTimers;
use crate::error::EngineError;
use crate::platform::RawValue;
use tokio::time::Instant;
use tokio_util::time::delay_queue;
use tracing::debug;

/// Typed notification published by a control after decoding an event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Notification {
    Moved(f64),
    Pressed,
    Released,
    Switched(bool),
}

/// Notification tagged with the control that published it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlEvent {
    pub control: ControlId,
    pub notification: Notification,
}

pub trait ReadAxis {
    fn value(&self) -> f64;
}

pub trait WriteAxis: ReadAxis {
    fn move_to(&mut self, value: f64) -> Result<(), EngineError>;
}

pub trait ReadButton {
    fn state(&self) -> bool;
}

pub trait WriteButton: ReadButton {
    fn set_state(&mut self, state: bool) -> Result<(), EngineError>;
}

/// Non-owning link from a control to its device.
#[derive(Clone)]
pub struct DeviceLink {
    table: SharedDevices,
    device: DeviceId,
}

impl DeviceLink {
    pub(crate) fn new(table: SharedDevices, device: DeviceId) -> Self {
        Self { table, device }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }
}

#[derive(Clone)]
pub struct InputAxis {
    id: ControlId,
    link: DeviceLink,
    index: u8,
}

impl ReadAxis for InputAxis {
    fn value(&self) -> f64 {
        decode_native(self.link.table.axis(self.link.device, self.index))
    }
}

#[derive(Clone)]
pub struct OutputAxis {
    id: ControlId,
    link: DeviceLink,
    index: u8,
    encoding: AxisEncoding,
}

impl ReadAxis for OutputAxis {
    fn value(&self) -> f64 {
        decode_native(self.link.table.axis(self.link.device, self.index))
    }
}

impl WriteAxis for OutputAxis {
    fn move_to(&mut self, value: f64) -> Result<(), EngineError> {
        let encoded = self.encoding.encode(value);
        self.link
            .table
            .write_axis(self.link.device, self.index, encoded, value)
    }
}

#[derive(Clone)]
pub struct InputButton {
    id: ControlId,
    link: DeviceLink,
    index: u8,
}

impl ReadButton for InputButton {
    fn state(&self) -> bool {
        self.link.table.button(self.link.device, self.index)
    }
}

/// Timer outstanding for a pulse, and the level the button returns to when it fires.
#[derive(Debug, Clone)]
pub struct PendingPulse {
    pub key: delay_queue::Key,
    pub deadline: Instant,
    pub rest: bool,
}

#[derive(Clone)]
pub struct OutputButton {
    id: ControlId,
    link: DeviceLink,
    index: u8,
    pulse: Option<PendingPulse>,
}

impl ReadButton for OutputButton {
    fn state(&self) -> bool {
        self.link.table.button(self.link.device, self.index)
    }
}

impl WriteButton for OutputButton {
    fn set_state(&mut self, state: bool) -> Result<(), EngineError> {
        self.link
            .table
            .write_button(self.link.device, self.index, state)
    }
}

impl OutputButton {
    pub fn id(&self) -> ControlId {
        self.id
    }

    pub fn pending_pulse(&self) -> Option<&PendingPulse> {
        self.pulse.as_ref()
    }

    /// Omitted target toggles. Returns `None` when the button already holds the target.
    fn resolve(&self, target: Option<bool>) -> Option<bool> {
        let current = self.state();
        match target {
            Some(target) if target == current => None,
            Some(target) => Some(target),
            None => Some(!current),
        }
    }

    /// Write a level and hold it. Cancels any pulse still pending on this button.
    ///
    /// Returns whether anything was written.
    pub fn switch(
        &mut self,
        target: Option<bool>,
        timers: &mut PulseTimers,
    ) -> Result<bool, EngineError> {
        let Some(target) = self.resolve(target) else {
            return Ok(false);
        };
        self.set_state(target)?;
        if let Some(pending) = self.pulse.take() {
            timers.cancel(&pending.key);
        }
        Ok(true)
    }

    /// Write a level and schedule the return to rest.
    ///
    /// A pulse started while another is pending replaces its timer and keeps the rest
    /// level of the first one, so at most one timer is outstanding per button.
    pub fn pulse(
        &mut self,
        target: Option<bool>,
        timers: &mut PulseTimers,
    ) -> Result<bool, EngineError> {
        let rest = self
            .pulse
            .as_ref()
            .map_or_else(|| self.state(), |pending| pending.rest);
        let Some(target) = self.resolve(target) else {
            return Ok(false);
        };
        self.set_state(target)?;
        if let Some(pending) = self.pulse.take() {
            timers.cancel(&pending.key);
        }
        let (key, deadline) = timers.schedule(self.id);
        debug!(
            "Pulse on button #{} to {}, back to {} at {:?}",
            self.index, target, rest, deadline
        );
        self.pulse = Some(PendingPulse {
            key,
            deadline,
            rest,
        });
        Ok(true)
    }

    pub fn switch_on(&mut self, timers: &mut PulseTimers) -> Result<bool, EngineError> {
        self.switch(Some(true), timers)
    }

    pub fn switch_off(&mut self, timers: &mut PulseTimers) -> Result<bool, EngineError> {
        self.switch(Some(false), timers)
    }

    pub fn pulse_on_off(&mut self, timers: &mut PulseTimers) -> Result<bool, EngineError> {
        self.pulse(Some(true), timers)
    }

    pub fn pulse_off_on(&mut self, timers: &mut PulseTimers) -> Result<bool, EngineError> {
        self.pulse(Some(false), timers)
    }

    /// Timer expiry: return to the rest level.
    ///
    /// The pending record is cleared even when the write fails, the queue entry is gone.
    pub fn end_pulse(&mut self) -> Result<(), EngineError> {
        let Some(pending) = self.pulse.take() else {
            return Ok(());
        };
        if self.state() != pending.rest {
            self.set_state(pending.rest)?;
        }
        Ok(())
    }
}

/// One control object of any direction and kind.
#[derive(Clone)]
pub enum Control {
    InputAxis(InputAxis),
    OutputAxis(OutputAxis),
    InputButton(InputButton),
    OutputButton(OutputButton),
}

impl Control {
    pub(crate) fn new(
        id: ControlId,
        link: DeviceLink,
        kind: ChannelKind,
        index: u8,
        direction: Direction,
        encoding: AxisEncoding,
    ) -> Self {
        match (kind, direction) {
            (ChannelKind::Axis, Direction::Input) => Control::InputAxis(InputAxis {
                id,
                link,
                index,
            }),
            (ChannelKind::Axis, Direction::Output) => Control::OutputAxis(OutputAxis {
                id,
                link,
                index,
                encoding,
            }),
            (ChannelKind::Button, Direction::Input) => Control::InputButton(InputButton {
                id,
                link,
                index,
            }),
            (ChannelKind::Button, Direction::Output) => Control::OutputButton(OutputButton {
                id,
                link,
                index,
                pulse: None,
            }),
        }
    }

    pub fn id(&self) -> ControlId {
        match self {
            Control::InputAxis(c) => c.id,
            Control::OutputAxis(c) => c.id,
            Control::InputButton(c) => c.id,
            Control::OutputButton(c) => c.id,
        }
    }

    pub fn device(&self) -> DeviceId {
        match self {
            Control::InputAxis(c) => c.link.device,
            Control::OutputAxis(c) => c.link.device,
            Control::InputButton(c) => c.link.device,
            Control::OutputButton(c) => c.link.device,
        }
    }

    pub fn index(&self) -> u8 {
        match self {
            Control::InputAxis(c) => c.index,
            Control::OutputAxis(c) => c.index,
            Control::InputButton(c) => c.index,
            Control::OutputButton(c) => c.index,
        }
    }

    pub fn kind(&self) -> ChannelKind {
        match self {
            Control::InputAxis(_) | Control::OutputAxis(_) => ChannelKind::Axis,
            Control::InputButton(_) | Control::OutputButton(_) => ChannelKind::Button,
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            Control::InputAxis(_) | Control::InputButton(_) => Direction::Input,
            Control::OutputAxis(_) | Control::OutputButton(_) => Direction::Output,
        }
    }

    pub fn as_output_axis_mut(&mut self) -> Option<&mut OutputAxis> {
        match self {
            Control::OutputAxis(axis) => Some(axis),
            _ => None,
        }
    }

    pub fn as_output_button(&self) -> Option<&OutputButton> {
        match self {
            Control::OutputButton(button) => Some(button),
            _ => None,
        }
    }

    pub fn as_output_button_mut(&mut self) -> Option<&mut OutputButton> {
        match self {
            Control::OutputButton(button) => Some(button),
            _ => None,
        }
    }

    /// Current axis value, `None` for buttons.
    pub fn value(&self) -> Option<f64> {
        match self {
            Control::InputAxis(c) => Some(c.value()),
            Control::OutputAxis(c) => Some(c.value()),
            _ => None,
        }
    }

    /// Current button state, `None` for axes.
    pub fn state(&self) -> Option<bool> {
        match self {
            Control::InputButton(c) => Some(c.state()),
            Control::OutputButton(c) => Some(c.state()),
            _ => None,
        }
    }

    /// Decode a raw value routed to this control into notifications, in emission order.
    ///
    /// Output controls publish their echoes too, but their state only changes through
    /// their own writes.
    pub fn process_event(&self, raw: RawValue) -> Vec<Notification> {
        match (self, raw) {
            (Control::InputAxis(_) | Control::OutputAxis(_), RawValue::Axis(value)) => {
                vec![Notification::Moved(decode_native(value))]
            }
            (Control::InputButton(_) | Control::OutputButton(_), RawValue::Button(pressed)) => {
                button_notifications(pressed)
            }
            (control, raw) => {
                debug!(
                    "Ignoring {:?} routed to {} control #{}",
                    raw,
                    control.kind(),
                    control.index()
                );
                Vec::new()
            }
        }
    }

    /// Replace an input control by the output control for the same channel.
    ///
    /// Output controls are left untouched.
    pub(crate) fn upgrade(&mut self, encoding: AxisEncoding) {
        match self {
            Control::InputAxis(axis) => {
                let upgraded = OutputAxis {
                    id: axis.id,
                    link: axis.link.clone(),
                    index: axis.index,
                    encoding,
                };
                *self = Control::OutputAxis(upgraded);
            }
            Control::InputButton(button) => {
                let upgraded = OutputButton {
                    id: button.id,
                    link: button.link.clone(),
                    index: button.index,
                    pulse: None,
                };
                *self = Control::OutputButton(upgraded);
            }
            Control::OutputAxis(_) | Control::OutputButton(_) => {}
        }
    }
}

fn button_notifications(pressed: bool) -> Vec<Notification> {
    let edge = if pressed {
        Notification::Pressed
    } else {
        Notification::Released
    };
    vec![edge, Notification::Switched(pressed)]
}
