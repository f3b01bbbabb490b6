//! In-process joystick backend.
//!
//! Simulated physical devices are fed through an [`Injector`]. Virtual devices behave
//! like a virtual joystick driver: every write made through a [`VirtualOutput`] is
//! recorded and echoed back as an event, the way the OS reports a vJoy device as a
//! regular joystick.

use super::{
    BackendError, DeviceDescriptor, EventSource, RawEvent, SourceFactory, VirtualDriver,
    VirtualOutput, VIRTUAL_AXIS_MAX,
};
use crate::devices::channel::{InstanceId, VirtualSlot};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Name every simulated virtual joystick reports, like the real driver does.
pub const VIRTUAL_DEVICE_NAME: &str = "vJoy Device";

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct SimulatedDevice {
    pub name: String,
    #[serde(default = "default_axes")]
    pub axes: u8,
    #[serde(default = "default_buttons")]
    pub buttons: u8,
    #[serde(default)]
    pub hats: u8,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct LoopbackLayout {
    pub virtual_devices: u8,
    pub virtual_axes: u8,
    pub virtual_buttons: u8,
    pub physical: Vec<SimulatedDevice>,
}

fn default_axes() -> u8 {
    3
}

fn default_buttons() -> u8 {
    32
}

impl Default for LoopbackLayout {
    fn default() -> Self {
        Self {
            virtual_devices: 2,
            virtual_axes: 8,
            virtual_buttons: 128,
            physical: Vec::new(),
        }
    }
}

/// One write received by a simulated virtual joystick (1-based indexes, driver units).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordedWrite {
    Axis { slot: VirtualSlot, axis: u8, value: u16 },
    Button { slot: VirtualSlot, button: u8, pressed: bool },
}

enum LoopbackMessage {
    Event(RawEvent),
    TearDown(String),
}

#[derive(Default)]
struct HubState {
    receiver: Option<Receiver<LoopbackMessage>>,
    opened: HashSet<VirtualSlot>,
    writes: Vec<RecordedWrite>,
    reject_writes: bool,
}

/// Owns the simulated devices and hands out the source, the driver and injectors.
#[derive(Clone)]
pub struct LoopbackHub {
    devices: Arc<Vec<DeviceDescriptor>>,
    sender: Sender<LoopbackMessage>,
    state: Arc<Mutex<HubState>>,
}

impl LoopbackHub {
    pub fn new(layout: &LoopbackLayout) -> Self {
        let mut devices = Vec::new();
        for (i, device) in layout.physical.iter().enumerate() {
            let instance = InstanceId(u32::try_from(i).unwrap_or(u32::MAX));
            devices.push(DeviceDescriptor {
                instance,
                name: device.name.clone(),
                guid: format!("loopback-{:04x}", instance.0),
                virtual_slot: None,
                axes: device.axes,
                buttons: device.buttons,
                hats: device.hats,
            });
        }
        let first_virtual = devices.len();
        for slot in 0..layout.virtual_devices {
            let instance =
                InstanceId(u32::try_from(first_virtual + usize::from(slot)).unwrap_or(u32::MAX));
            devices.push(DeviceDescriptor {
                instance,
                name: VIRTUAL_DEVICE_NAME.to_string(),
                guid: format!("loopback-vjoy-{:02x}", slot),
                virtual_slot: Some(VirtualSlot(slot)),
                axes: layout.virtual_axes,
                buttons: layout.virtual_buttons,
                hats: 0,
            });
        }
        info!(
            "Loopback backend with {} physical and {} virtual device(s)",
            layout.physical.len(),
            layout.virtual_devices
        );

        let (sender, receiver) = mpsc::channel();
        let state = HubState {
            receiver: Some(receiver),
            ..HubState::default()
        };
        Self {
            devices: Arc::new(devices),
            sender,
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn devices(&self) -> &[DeviceDescriptor] {
        &self.devices
    }

    /// Factory for the dispatch thread. The event stream can only be taken once.
    pub fn source_factory(&self) -> SourceFactory {
        let hub = self.clone();
        Box::new(move || {
            let receiver = hub.lock().receiver.take().ok_or_else(|| {
                BackendError::Initialization("loopback source already taken".into())
            })?;
            Ok(Box::new(LoopbackSource {
                devices: hub.devices.to_vec(),
                receiver,
            }) as Box<dyn EventSource>)
        })
    }

    pub fn driver(&self) -> LoopbackDriver {
        LoopbackDriver { hub: self.clone() }
    }

    pub fn injector(&self) -> Injector {
        Injector { hub: self.clone() }
    }

    /// Every write received so far, oldest first.
    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.lock().writes.clone()
    }

    pub fn is_opened(&self, slot: VirtualSlot) -> bool {
        self.lock().opened.contains(&slot)
    }

    /// Make every following virtual write fail, as if the driver went away.
    pub fn reject_writes(&self, reject: bool) {
        self.lock().reject_writes = reject;
    }

    /// End the event stream with a fatal error.
    pub fn tear_down(&self, reason: &str) {
        if self
            .sender
            .send(LoopbackMessage::TearDown(reason.to_string()))
            .is_err()
        {
            debug!("Loopback source already gone");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn instance_of_slot(&self, slot: VirtualSlot) -> Option<InstanceId> {
        self.devices
            .iter()
            .find(|d| d.virtual_slot == Some(slot))
            .map(|d| d.instance)
    }

    fn emit(&self, event: RawEvent) {
        if self.sender.send(LoopbackMessage::Event(event)).is_err() {
            debug!("Loopback source dropped, event discarded: {:?}", event);
        }
    }
}

pub struct LoopbackSource {
    devices: Vec<DeviceDescriptor>,
    receiver: Receiver<LoopbackMessage>,
}

impl EventSource for LoopbackSource {
    fn devices(&mut self) -> Result<Vec<DeviceDescriptor>, BackendError> {
        Ok(self.devices.clone())
    }

    fn wait_event(&mut self, timeout: Duration) -> Result<Option<RawEvent>, BackendError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(LoopbackMessage::Event(event)) => Ok(Some(event)),
            Ok(LoopbackMessage::TearDown(reason)) => Err(BackendError::Disconnected(reason)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            // Every hub handle dropped. recv_timeout returns at once from now on, still
            // honor the timeout so callers polling in a loop do not spin.
            Err(RecvTimeoutError::Disconnected) => {
                std::thread::sleep(timeout);
                Ok(None)
            }
        }
    }
}

pub struct LoopbackDriver {
    hub: LoopbackHub,
}

impl VirtualDriver for LoopbackDriver {
    fn open(&mut self, slot: VirtualSlot) -> Result<Box<dyn VirtualOutput>, BackendError> {
        let descriptor = self
            .hub
            .devices
            .iter()
            .find(|d| d.virtual_slot == Some(slot))
            .cloned()
            .ok_or_else(|| BackendError::Open {
                slot,
                reason: "no such virtual device".into(),
            })?;
        if !self.hub.lock().opened.insert(slot) {
            return Err(BackendError::Open {
                slot,
                reason: "already owned by another writer".into(),
            });
        }
        info!("Opened {} for writing", slot);
        Ok(Box::new(LoopbackOutput {
            hub: self.hub.clone(),
            slot,
            instance: descriptor.instance,
            axes: descriptor.axes,
            buttons: descriptor.buttons,
        }))
    }
}

struct LoopbackOutput {
    hub: LoopbackHub,
    slot: VirtualSlot,
    instance: InstanceId,
    axes: u8,
    buttons: u8,
}

impl LoopbackOutput {
    fn check_writable(&self) -> Result<(), BackendError> {
        if self.hub.lock().reject_writes {
            return Err(BackendError::Write(format!("{} rejected the write", self.slot)));
        }
        Ok(())
    }
}

impl VirtualOutput for LoopbackOutput {
    fn set_axis(&mut self, axis: u8, value: u16) -> Result<(), BackendError> {
        self.check_writable()?;
        if axis == 0 || axis > self.axes || value > VIRTUAL_AXIS_MAX {
            return Err(BackendError::Write(format!(
                "axis {} = {:#06x} out of range on {}",
                axis, value, self.slot
            )));
        }
        self.hub.lock().writes.push(RecordedWrite::Axis {
            slot: self.slot,
            axis,
            value,
        });
        self.hub.emit(RawEvent::Axis {
            instance: self.instance,
            index: axis - 1,
            value: driver_to_native(value),
        });
        Ok(())
    }

    fn set_button(&mut self, button: u8, pressed: bool) -> Result<(), BackendError> {
        self.check_writable()?;
        if button == 0 || button > self.buttons {
            return Err(BackendError::Write(format!(
                "button {} out of range on {}",
                button, self.slot
            )));
        }
        self.hub.lock().writes.push(RecordedWrite::Button {
            slot: self.slot,
            button,
            pressed,
        });
        self.hub.emit(RawEvent::Button {
            instance: self.instance,
            index: button - 1,
            pressed,
        });
        Ok(())
    }
}

/// Driver units (0..=0x8000) to the native signed range joystick APIs report.
fn driver_to_native(value: u16) -> i16 {
    let scaled = i32::from(value) * 0xFFFF / i32::from(VIRTUAL_AXIS_MAX) - 0x8000;
    i16::try_from(scaled.clamp(i32::from(i16::MIN), i32::from(i16::MAX))).unwrap_or(i16::MAX)
}

/// Feeds simulated physical input, addressed by device name.
#[derive(Clone)]
pub struct Injector {
    hub: LoopbackHub,
}

impl Injector {
    fn instance_of(&self, device: &str) -> Option<InstanceId> {
        self.hub
            .devices
            .iter()
            .find(|d| d.virtual_slot.is_none() && (d.name == device || d.guid == device))
            .map(|d| d.instance)
    }

    pub fn button(&self, device: &str, index: u8, pressed: bool) -> bool {
        match self.instance_of(device) {
            Some(instance) => {
                self.hub.emit(RawEvent::Button {
                    instance,
                    index,
                    pressed,
                });
                true
            }
            None => {
                warn!("No simulated device named '{}'", device);
                false
            }
        }
    }

    /// `value` is normalized to [-1, 1].
    pub fn axis(&self, device: &str, index: u8, value: f64) -> bool {
        match self.instance_of(device) {
            Some(instance) => {
                self.hub.emit(RawEvent::Axis {
                    instance,
                    index,
                    value: crate::devices::encoding::encode_native(value),
                });
                true
            }
            None => {
                warn!("No simulated device named '{}'", device);
                false
            }
        }
    }

    /// Inject an event on a virtual device, as if another process wrote to it.
    pub fn virtual_button(&self, slot: VirtualSlot, index: u8, pressed: bool) -> bool {
        match self.hub.instance_of_slot(slot) {
            Some(instance) => {
                self.hub.emit(RawEvent::Button {
                    instance,
                    index,
                    pressed,
                });
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn layout() -> LoopbackLayout {
        LoopbackLayout {
            physical: vec![SimulatedDevice {
                name: "Throttle".into(),
                axes: 2,
                buttons: 8,
                hats: 1,
            }],
            virtual_devices: 2,
            virtual_axes: 8,
            virtual_buttons: 32,
        }
    }

    #[test]
    fn virtual_devices_follow_physical_ones() {
        let hub = LoopbackHub::new(&layout());
        let devices = hub.devices();
        assert_eq!(devices.len(), 3);
        assert_eq!(devices[0].virtual_slot, None);
        assert_eq!(devices[1].virtual_slot, Some(VirtualSlot(0)));
        assert_eq!(devices[2].instance, InstanceId(2));
        assert_eq!(devices[2].name, VIRTUAL_DEVICE_NAME);
    }

    #[test]
    fn writes_are_echoed_as_events() {
        let hub = LoopbackHub::new(&layout());
        let mut source = (hub.source_factory())().unwrap();
        let mut output = hub.driver().open(VirtualSlot(1)).unwrap();

        output.set_button(4, true).unwrap();
        output.set_axis(1, VIRTUAL_AXIS_MAX).unwrap();

        let first = source.wait_event(Duration::from_millis(10)).unwrap();
        assert_eq!(
            first,
            Some(RawEvent::Button {
                instance: InstanceId(2),
                index: 3,
                pressed: true
            })
        );
        let second = source.wait_event(Duration::from_millis(10)).unwrap();
        assert_eq!(
            second,
            Some(RawEvent::Axis {
                instance: InstanceId(2),
                index: 0,
                value: i16::MAX
            })
        );
        assert_eq!(hub.writes().len(), 2);
    }

    #[test]
    fn virtual_slots_have_a_single_writer() {
        let hub = LoopbackHub::new(&layout());
        let mut driver = hub.driver();
        assert!(driver.open(VirtualSlot(0)).is_ok());
        assert!(driver.open(VirtualSlot(0)).is_err());
        assert!(driver.open(VirtualSlot(5)).is_err());
        assert!(hub.is_opened(VirtualSlot(0)));
    }

    #[test]
    fn out_of_range_and_rejected_writes_fail() {
        let hub = LoopbackHub::new(&layout());
        let mut output = hub.driver().open(VirtualSlot(0)).unwrap();
        assert!(output.set_button(0, true).is_err());
        assert!(output.set_button(33, true).is_err());
        hub.reject_writes(true);
        assert!(output.set_button(1, true).is_err());
        hub.reject_writes(false);
        assert!(output.set_button(1, true).is_ok());
    }

    #[test]
    fn tear_down_is_fatal_for_the_source() {
        let hub = LoopbackHub::new(&layout());
        let mut source = (hub.source_factory())().unwrap();
        assert!((hub.source_factory())().is_err());
        hub.tear_down("unplugged");
        assert!(matches!(
            source.wait_event(Duration::from_millis(10)),
            Err(BackendError::Disconnected(_))
        ));
    }

    #[test]
    fn closed_stream_still_waits_out_the_timeout() {
        let hub = LoopbackHub::new(&layout());
        let mut source = (hub.source_factory())().unwrap();
        drop(hub);

        let started = Instant::now();
        assert_eq!(source.wait_event(Duration::from_millis(20)).unwrap(), None);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn driver_units_cover_the_native_range() {
        assert_eq!(driver_to_native(0), i16::MIN);
        assert_eq!(driver_to_native(VIRTUAL_AXIS_MAX), i16::MAX);
        assert!(driver_to_native(0x4000).abs() <= 1);
    }
}
