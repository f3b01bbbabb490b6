//! Device and control arenas
//!
//! The registry owns one record per acquired device and one [`Control`] per registered
//! channel. Devices are opened lazily, on the first identity that resolves to them, and
//! every later lookup reuses the record. Virtual devices start read-only. The first
//! output registration opens the driver handle and upgrades every control on the device
//! in place.

use super::allocator::AllocationRecord;
use super::channel::{
    ChannelKind, ChannelRef, ControlId, DeviceId, DeviceIdentity, Direction, InstanceId,
    VirtualSlot,
};
use super::controls::{Control, DeviceLink};
use super::encoding::AxisEncoding;
use super::table::SharedDevices;
use crate::error::EngineError;
use crate::platform::{DeviceDescriptor, VirtualDriver};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

struct DeviceRecord {
    identity: DeviceIdentity,
    descriptor: DeviceDescriptor,
    axes: BTreeMap<u8, ControlId>,
    buttons: BTreeMap<u8, ControlId>,
    output_enabled: bool,
}

impl DeviceRecord {
    fn bound(&self, kind: ChannelKind) -> &BTreeMap<u8, ControlId> {
        match kind {
            ChannelKind::Axis => &self.axes,
            ChannelKind::Button => &self.buttons,
        }
    }

    fn bound_mut(&mut self, kind: ChannelKind) -> &mut BTreeMap<u8, ControlId> {
        match kind {
            ChannelKind::Axis => &mut self.axes,
            ChannelKind::Button => &mut self.buttons,
        }
    }
}

pub struct DeviceRegistry {
    table: SharedDevices,
    available: Vec<DeviceDescriptor>,
    devices: Vec<DeviceRecord>,
    by_identity: HashMap<DeviceIdentity, DeviceId>,
    by_instance: HashMap<InstanceId, DeviceId>,
    controls: Vec<Control>,
    driver: Box<dyn VirtualDriver>,
    encoding: AxisEncoding,
    allocations: AllocationRecord,
}

impl DeviceRegistry {
    /// `available` is what the event source enumerated at startup.
    pub fn new(
        available: Vec<DeviceDescriptor>,
        table: SharedDevices,
        driver: Box<dyn VirtualDriver>,
        encoding: AxisEncoding,
    ) -> Self {
        Self {
            table,
            available,
            devices: Vec::new(),
            by_identity: HashMap::new(),
            by_instance: HashMap::new(),
            controls: Vec::new(),
            driver,
            encoding,
            allocations: AllocationRecord::default(),
        }
    }

    pub fn table(&self) -> &SharedDevices {
        &self.table
    }

    pub fn encoding(&self) -> AxisEncoding {
        self.encoding
    }

    pub fn allocations(&self) -> &AllocationRecord {
        &self.allocations
    }

    /// Slots of every virtual joystick the platform reported, ascending.
    pub fn virtual_slots(&self) -> Vec<VirtualSlot> {
        let mut slots: Vec<VirtualSlot> = self
            .available
            .iter()
            .filter_map(|d| d.virtual_slot)
            .collect();
        slots.sort_unstable();
        slots.dedup();
        slots
    }

    /// Resolve an identity to a device record, opening it on first use.
    pub fn acquire(&mut self, identity: &DeviceIdentity) -> Result<DeviceId, EngineError> {
        if let Some(&device) = self.by_identity.get(identity) {
            return Ok(device);
        }

        let candidates: Vec<&DeviceDescriptor> = self
            .available
            .iter()
            .filter(|d| match identity {
                DeviceIdentity::Physical(key) => {
                    d.virtual_slot.is_none() && (&d.name == key || &d.guid == key)
                }
                DeviceIdentity::Virtual(slot) => d.virtual_slot == Some(*slot),
            })
            .collect();
        let descriptor = match candidates.as_slice() {
            [] => return Err(EngineError::DeviceNotFound(identity.clone())),
            [one] => (*one).clone(),
            many => {
                return Err(EngineError::DeviceAmbiguous {
                    identity: identity.clone(),
                    candidates: many.len(),
                })
            }
        };

        // Same device reached through its name and its GUID.
        if let Some(&device) = self.by_instance.get(&descriptor.instance) {
            self.by_identity.insert(identity.clone(), device);
            return Ok(device);
        }

        info!(
            "Opening device {} (instance {}, {} axes, {} buttons, {} hats)",
            identity, descriptor.instance.0, descriptor.axes, descriptor.buttons, descriptor.hats
        );
        let device = self.table.insert(identity.clone(), descriptor.clone());
        self.by_identity.insert(identity.clone(), device);
        self.by_instance.insert(descriptor.instance, device);
        self.devices.push(DeviceRecord {
            identity: identity.clone(),
            descriptor,
            axes: BTreeMap::new(),
            buttons: BTreeMap::new(),
            output_enabled: false,
        });
        Ok(device)
    }

    fn record(&self, device: DeviceId) -> Result<&DeviceRecord, EngineError> {
        self.devices
            .get(device.0)
            .ok_or_else(|| EngineError::Channel(format!("unknown device {:?}", device)))
    }

    pub fn identity(&self, device: DeviceId) -> Option<&DeviceIdentity> {
        self.devices.get(device.0).map(|r| &r.identity)
    }

    pub fn descriptor(&self, device: DeviceId) -> Option<&DeviceDescriptor> {
        self.devices.get(device.0).map(|r| &r.descriptor)
    }

    pub fn is_output_enabled(&self, device: DeviceId) -> bool {
        self.devices
            .get(device.0)
            .is_some_and(|r| r.output_enabled)
    }

    /// Bind a control to one channel of an acquired device.
    ///
    /// Registering an already bound channel returns the existing control. An output
    /// request on a virtual device upgrades the whole device first. Once a device is
    /// upgraded, input requests also get output controls.
    pub fn register(
        &mut self,
        device: DeviceId,
        kind: ChannelKind,
        index: u8,
        direction: Direction,
    ) -> Result<ChannelRef, EngineError> {
        let record = self.record(device)?;
        if index >= record.descriptor.capacity(kind) {
            return Err(EngineError::ChannelOutOfRange {
                identity: record.identity.clone(),
                kind,
                index,
            });
        }
        if direction == Direction::Output {
            self.enable_output(device)?;
        }

        let record = self.record(device)?;
        if let Some(&control) = record.bound(kind).get(&index) {
            return Ok(ChannelRef {
                device,
                kind,
                index,
                control,
            });
        }

        let direction = if record.output_enabled {
            Direction::Output
        } else {
            Direction::Input
        };
        let slot = record.descriptor.virtual_slot;
        let control = ControlId(self.controls.len());
        self.controls.push(Control::new(
            control,
            DeviceLink::new(self.table.clone(), device),
            kind,
            index,
            direction,
            self.encoding,
        ));
        if let Some(record) = self.devices.get_mut(device.0) {
            record.bound_mut(kind).insert(index, control);
        }
        if let Some(slot) = slot {
            self.allocations.claim(slot, kind, index);
        }
        self.table.add_route(device, kind, index, control);
        debug!(
            "Registered {:?} {} #{} on {:?} as {:?}",
            direction, kind, index, device, control
        );

        Ok(ChannelRef {
            device,
            kind,
            index,
            control,
        })
    }

    /// Open the virtual driver handle and turn every control on the device into an
    /// output control. Has no effect on an already enabled device.
    pub fn enable_output(&mut self, device: DeviceId) -> Result<(), EngineError> {
        let record = self.record(device)?;
        if record.output_enabled {
            return Ok(());
        }
        let Some(slot) = record.descriptor.virtual_slot else {
            return Err(EngineError::OutputNotEnabled(record.identity.clone()));
        };

        let output = self.driver.open(slot).map_err(EngineError::DeviceIo)?;
        self.table.attach_output(device, output);

        let Some(record) = self.devices.get_mut(device.0) else {
            return Ok(());
        };
        record.output_enabled = true;
        let bound: Vec<ControlId> = record
            .axes
            .values()
            .chain(record.buttons.values())
            .copied()
            .collect();
        for control in &bound {
            if let Some(control) = self.controls.get_mut(control.0) {
                control.upgrade(self.encoding);
            }
        }
        info!(
            "Output enabled on {}, upgraded {} control(s)",
            slot,
            bound.len()
        );
        Ok(())
    }

    pub fn control(&self, id: ControlId) -> Option<&Control> {
        self.controls.get(id.0)
    }

    pub fn control_mut(&mut self, id: ControlId) -> Option<&mut Control> {
        self.controls.get_mut(id.0)
    }

    pub fn controls(&self) -> &[Control] {
        &self.controls
    }

    /// Controls bound on a device, axes first, each in index order.
    pub fn controls_of(&self, device: DeviceId) -> Vec<ControlId> {
        self.devices
            .get(device.0)
            .map(|r| r.axes.values().chain(r.buttons.values()).copied().collect())
            .unwrap_or_default()
    }

    fn register_on(
        &mut self,
        identity: DeviceIdentity,
        kind: ChannelKind,
        index: u8,
        direction: Direction,
    ) -> Result<ChannelRef, EngineError> {
        let device = self.acquire(&identity)?;
        self.register(device, kind, index, direction)
    }

    pub fn physical_axis(&mut self, device: &str, index: u8) -> Result<ChannelRef, EngineError> {
        self.register_on(
            DeviceIdentity::Physical(device.to_string()),
            ChannelKind::Axis,
            index,
            Direction::Input,
        )
    }

    pub fn physical_button(&mut self, device: &str, index: u8) -> Result<ChannelRef, EngineError> {
        self.register_on(
            DeviceIdentity::Physical(device.to_string()),
            ChannelKind::Button,
            index,
            Direction::Input,
        )
    }

    pub fn virtual_axis(
        &mut self,
        slot: VirtualSlot,
        index: u8,
        as_output: bool,
    ) -> Result<ChannelRef, EngineError> {
        self.register_on(
            DeviceIdentity::Virtual(slot),
            ChannelKind::Axis,
            index,
            if as_output {
                Direction::Output
            } else {
                Direction::Input
            },
        )
    }

    pub fn virtual_button(
        &mut self,
        slot: VirtualSlot,
        index: u8,
        as_output: bool,
    ) -> Result<ChannelRef, EngineError> {
        self.register_on(
            DeviceIdentity::Virtual(slot),
            ChannelKind::Button,
            index,
            if as_output {
                Direction::Output
            } else {
                Direction::Input
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::loopback::{LoopbackHub, LoopbackLayout, SimulatedDevice};

    fn hub() -> LoopbackHub {
        LoopbackHub::new(&LoopbackLayout {
            physical: vec![
                SimulatedDevice {
                    name: "LEFT VPC Stick".into(),
                    axes: 3,
                    buttons: 16,
                    hats: 1,
                },
                SimulatedDevice {
                    name: "Twin".into(),
                    axes: 2,
                    buttons: 4,
                    hats: 0,
                },
                SimulatedDevice {
                    name: "Twin".into(),
                    axes: 2,
                    buttons: 4,
                    hats: 0,
                },
            ],
            virtual_devices: 2,
            virtual_axes: 4,
            virtual_buttons: 8,
        })
    }

    fn registry(hub: &LoopbackHub) -> DeviceRegistry {
        DeviceRegistry::new(
            hub.devices().to_vec(),
            SharedDevices::new(),
            Box::new(hub.driver()),
            AxisEncoding::Symmetric,
        )
    }

    #[test]
    fn acquire_is_idempotent_and_reports_lookup_failures() {
        let hub = hub();
        let mut registry = registry(&hub);
        let stick = DeviceIdentity::Physical("LEFT VPC Stick".into());
        let first = registry.acquire(&stick).unwrap();
        assert_eq!(registry.acquire(&stick).unwrap(), first);

        let by_guid = DeviceIdentity::Physical("loopback-0000".into());
        assert_eq!(registry.acquire(&by_guid).unwrap(), first);

        assert!(matches!(
            registry.acquire(&DeviceIdentity::Physical("Missing".into())),
            Err(EngineError::DeviceNotFound(_))
        ));
        assert!(matches!(
            registry.acquire(&DeviceIdentity::Physical("Twin".into())),
            Err(EngineError::DeviceAmbiguous { candidates: 2, .. })
        ));
        assert!(registry
            .acquire(&DeviceIdentity::Physical("loopback-0002".into()))
            .is_ok());
    }

    #[test]
    fn same_channel_returns_the_same_control() {
        let hub = hub();
        let mut registry = registry(&hub);
        let a = registry.physical_button("LEFT VPC Stick", 3).unwrap();
        let b = registry.physical_button("LEFT VPC Stick", 3).unwrap();
        assert_eq!(a, b);
        assert_eq!(registry.controls().len(), 1);
        assert!(matches!(
            registry.physical_button("LEFT VPC Stick", 16),
            Err(EngineError::ChannelOutOfRange { .. })
        ));
    }

    #[test]
    fn first_output_registration_upgrades_the_whole_device() {
        let hub = hub();
        let mut registry = registry(&hub);
        let axis = registry.virtual_axis(VirtualSlot(0), 1, false).unwrap();
        let button = registry.virtual_button(VirtualSlot(0), 2, false).unwrap();
        let other = registry.virtual_button(VirtualSlot(1), 2, false).unwrap();
        assert!(!hub.is_opened(VirtualSlot(0)));

        let out = registry.virtual_button(VirtualSlot(0), 5, true).unwrap();
        assert!(hub.is_opened(VirtualSlot(0)));

        for channel in [axis, button, out] {
            let control = registry.control(channel.control).unwrap();
            assert_eq!(control.direction(), Direction::Output);
            assert_eq!(control.index(), channel.index);
            assert_eq!(control.id(), channel.control);
        }
        assert_eq!(
            registry.control(other.control).unwrap().direction(),
            Direction::Input
        );

        let later = registry.virtual_axis(VirtualSlot(0), 3, false).unwrap();
        assert_eq!(
            registry.control(later.control).unwrap().direction(),
            Direction::Output
        );
        assert!(!hub.is_opened(VirtualSlot(1)));
    }

    #[test]
    fn physical_devices_cannot_be_written() {
        let hub = hub();
        let mut registry = registry(&hub);
        let device = registry
            .acquire(&DeviceIdentity::Physical("LEFT VPC Stick".into()))
            .unwrap();
        assert!(matches!(
            registry.register(device, ChannelKind::Button, 0, Direction::Output),
            Err(EngineError::OutputNotEnabled(_))
        ));
    }

    #[test]
    fn virtual_registrations_are_claimed() {
        let hub = hub();
        let mut registry = registry(&hub);
        registry.virtual_button(VirtualSlot(1), 6, false).unwrap();
        registry.physical_button("LEFT VPC Stick", 6).unwrap();
        assert!(registry
            .allocations()
            .is_claimed(VirtualSlot(1), ChannelKind::Button, 6));
        assert_eq!(registry.allocations().len(), 1);
        assert_eq!(registry.virtual_slots(), vec![VirtualSlot(0), VirtualSlot(1)]);
    }
}
