//! Physical joysticks through gilrs.
//!
//! gilrs normalizes every device to a gamepad layout, so channel indexes come from the
//! fixed [`AXES`] and [`BUTTONS`] tables. Virtual joysticks are not read through gilrs:
//! the loopback source reports them, and gilrs devices carrying the virtual device name
//! are hidden so they are not mistaken for physical ones.

use super::loopback::LoopbackHub;
use super::{BackendError, DeviceDescriptor, EventSource, RawEvent, SourceFactory};
use crate::devices::channel::InstanceId;
use crate::devices::encoding::encode_native;
use gilrs::{Axis, Button, Event, EventType, GamepadId, Gilrs};
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// gilrs ids start at 0 like the loopback ones, keep them apart.
const GILRS_INSTANCE_BASE: u32 = 0x1000;

/// Longest gilrs wait before the virtual echo stream is checked again.
const VIRTUAL_POLL_SLICE: Duration = Duration::from_millis(5);

pub const AXES: [Axis; 8] = [
    Axis::LeftStickX,
    Axis::LeftStickY,
    Axis::LeftZ,
    Axis::RightStickX,
    Axis::RightStickY,
    Axis::RightZ,
    Axis::DPadX,
    Axis::DPadY,
];

pub const BUTTONS: [Button; 19] = [
    Button::South,
    Button::East,
    Button::North,
    Button::West,
    Button::C,
    Button::Z,
    Button::LeftTrigger,
    Button::LeftTrigger2,
    Button::RightTrigger,
    Button::RightTrigger2,
    Button::Select,
    Button::Start,
    Button::Mode,
    Button::LeftThumb,
    Button::RightThumb,
    Button::DPadUp,
    Button::DPadDown,
    Button::DPadLeft,
    Button::DPadRight,
];

pub fn axis_index(axis: Axis) -> Option<u8> {
    AXES.iter()
        .position(|a| *a == axis)
        .and_then(|i| u8::try_from(i).ok())
}

pub fn button_index(button: Button) -> Option<u8> {
    BUTTONS
        .iter()
        .position(|b| *b == button)
        .and_then(|i| u8::try_from(i).ok())
}

fn instance_of(id: GamepadId) -> InstanceId {
    let raw = u32::try_from(usize::from(id)).unwrap_or(u32::MAX);
    InstanceId(GILRS_INSTANCE_BASE.saturating_add(raw))
}

fn uuid_string(uuid: [u8; 16]) -> String {
    uuid.iter().map(|b| format!("{:02x}", b)).collect()
}

pub struct GilrsSource {
    gilrs: Gilrs,
    virtual_source: Box<dyn EventSource>,
    virtual_name: String,
    hidden: HashSet<GamepadId>,
}

impl GilrsSource {
    fn convert(&self, id: GamepadId, event: EventType) -> Option<RawEvent> {
        let instance = instance_of(id);
        match event {
            EventType::AxisChanged(axis, value, _) => match axis_index(axis) {
                Some(index) => Some(RawEvent::Axis {
                    instance,
                    index,
                    value: encode_native(f64::from(value)),
                }),
                None => {
                    debug!("Ignoring unsupported axis: {:?}", axis);
                    None
                }
            },
            EventType::ButtonPressed(button, _) | EventType::ButtonReleased(button, _) => {
                let pressed = matches!(event, EventType::ButtonPressed(..));
                match button_index(button) {
                    Some(index) => Some(RawEvent::Button {
                        instance,
                        index,
                        pressed,
                    }),
                    None => {
                        debug!("Ignoring unsupported button: {:?}", button);
                        None
                    }
                }
            }
            EventType::Connected => {
                info!("Gamepad {} connected after startup, not routed", id);
                None
            }
            EventType::Disconnected => {
                warn!("Gamepad {} disconnected", id);
                None
            }
            _ => None,
        }
    }
}

impl EventSource for GilrsSource {
    fn devices(&mut self) -> Result<Vec<DeviceDescriptor>, BackendError> {
        let mut devices = Vec::new();
        for (id, gamepad) in self.gilrs.gamepads() {
            if gamepad.name() == self.virtual_name {
                debug!("Hiding virtual joystick {} from the physical list", id);
                self.hidden.insert(id);
                continue;
            }
            info!(
                "  ID: {}, Name: {}, UUID: {}",
                id,
                gamepad.name(),
                uuid_string(gamepad.uuid())
            );
            devices.push(DeviceDescriptor {
                instance: instance_of(id),
                name: gamepad.name().to_string(),
                guid: uuid_string(gamepad.uuid()),
                virtual_slot: None,
                axes: AXES.len() as u8,
                buttons: BUTTONS.len() as u8,
                hats: 0,
            });
        }
        if devices.is_empty() {
            warn!("No physical joystick connected");
        }

        let virtuals = self.virtual_source.devices()?;
        devices.extend(virtuals.into_iter().filter(|d| d.virtual_slot.is_some()));
        Ok(devices)
    }

    fn wait_event(&mut self, timeout: Duration) -> Result<Option<RawEvent>, BackendError> {
        let started = Instant::now();
        loop {
            if let Some(event) = self.virtual_source.wait_event(Duration::ZERO)? {
                return Ok(Some(event));
            }

            let remaining = timeout.saturating_sub(started.elapsed());
            if let Some(Event { id, event, .. }) = self
                .gilrs
                .next_event_blocking(Some(remaining.min(VIRTUAL_POLL_SLICE)))
            {
                if self.hidden.contains(&id) {
                    continue;
                }
                if let Some(raw) = self.convert(id, event) {
                    return Ok(Some(raw));
                }
            }

            if started.elapsed() >= timeout {
                return Ok(None);
            }
        }
    }
}

/// gilrs for physical devices, `hub` for the virtual ones.
pub fn source_factory(virtual_name: String, hub: &LoopbackHub) -> SourceFactory {
    let virtual_factory = hub.source_factory();
    Box::new(move || {
        let virtual_source = virtual_factory()?;
        info!("Initializing gilrs joystick interface");
        let gilrs = Gilrs::new().map_err(|e| {
            error!("Failed to initialize gilrs: {}", e);
            BackendError::Initialization(e.to_string())
        })?;
        Ok(Box::new(GilrsSource {
            gilrs,
            virtual_source,
            virtual_name,
            hidden: HashSet::new(),
        }) as Box<dyn EventSource>)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_give_stable_indexes() {
        assert_eq!(axis_index(Axis::LeftStickX), Some(0));
        assert_eq!(axis_index(Axis::DPadY), Some(7));
        assert_eq!(axis_index(Axis::Unknown), None);
        assert_eq!(button_index(Button::South), Some(0));
        assert_eq!(button_index(Button::DPadRight), Some(18));
        assert_eq!(button_index(Button::Unknown), None);
    }

    #[test]
    fn uuids_print_as_hex() {
        let mut uuid = [0u8; 16];
        uuid[0] = 0xab;
        uuid[15] = 0x01;
        let text = uuid_string(uuid);
        assert_eq!(text.len(), 32);
        assert!(text.starts_with("ab00"));
        assert!(text.ends_with("01"));
    }
}
