//! Device table shared between the dispatch thread and the main context
//!
//! This is the only structure both contexts touch. The dispatch thread caches incoming
//! channel values and looks up routes. The main context writes virtual outputs, adds
//! routes and attaches writers during an upgrade. Every method takes the lock for a
//! single read or write and releases it before returning.

use super::channel::{ChannelId, ChannelKind, ControlId, DeviceId, DeviceIdentity, InstanceId};
use super::encoding::encode_native;
use crate::error::EngineError;
use crate::platform::{DeviceDescriptor, RawValue, VirtualOutput};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

struct TableEntry {
    identity: DeviceIdentity,
    descriptor: DeviceDescriptor,
    axes: Vec<i16>,
    buttons: Vec<bool>,
    routes: HashMap<(ChannelKind, u8), ControlId>,
    output: Option<Box<dyn VirtualOutput>>,
}

#[derive(Default)]
struct DeviceTable {
    by_instance: HashMap<InstanceId, DeviceId>,
    entries: Vec<TableEntry>,
}

impl DeviceTable {
    fn entry(&self, device: DeviceId) -> Option<&TableEntry> {
        self.entries.get(device.0)
    }

    fn entry_mut(&mut self, device: DeviceId) -> Option<&mut TableEntry> {
        self.entries.get_mut(device.0)
    }
}

/// Cloneable handle on the shared table.
#[derive(Clone, Default)]
pub struct SharedDevices {
    inner: Arc<Mutex<DeviceTable>>,
}

impl SharedDevices {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, DeviceTable> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking an opened device. Ids are handed out in insertion order.
    pub(crate) fn insert(&self, identity: DeviceIdentity, descriptor: DeviceDescriptor) -> DeviceId {
        let mut table = self.lock();
        let id = DeviceId(table.entries.len());
        table.by_instance.insert(descriptor.instance, id);
        table.entries.push(TableEntry {
            identity,
            axes: vec![0; usize::from(descriptor.axes)],
            buttons: vec![false; usize::from(descriptor.buttons)],
            descriptor,
            routes: HashMap::new(),
            output: None,
        });
        id
    }

    pub(crate) fn add_route(&self, device: DeviceId, kind: ChannelKind, index: u8, control: ControlId) {
        if let Some(entry) = self.lock().entry_mut(device) {
            entry.routes.insert((kind, index), control);
        }
    }

    /// Cache an incoming value and return the control routed to that channel, if any.
    ///
    /// A device with an output attached keeps the values last written to it: echoes of
    /// those writes arrive late and would roll the cache back.
    pub fn observe(&self, channel: ChannelId, value: RawValue) -> Option<ControlId> {
        let mut table = self.lock();
        let device = *table.by_instance.get(&channel.instance)?;
        let entry = table.entry_mut(device)?;
        let route = entry.routes.get(&(channel.kind, channel.index)).copied();
        if entry.output.is_some() {
            return route;
        }
        let index = usize::from(channel.index);
        match value {
            RawValue::Axis(raw) => {
                if let Some(slot) = entry.axes.get_mut(index) {
                    *slot = raw;
                }
            }
            RawValue::Button(pressed) => {
                if let Some(slot) = entry.buttons.get_mut(index) {
                    *slot = pressed;
                }
            }
        }
        route
    }

    pub fn axis(&self, device: DeviceId, index: u8) -> i16 {
        self.lock()
            .entry(device)
            .and_then(|e| e.axes.get(usize::from(index)).copied())
            .unwrap_or(0)
    }

    pub fn button(&self, device: DeviceId, index: u8) -> bool {
        self.lock()
            .entry(device)
            .and_then(|e| e.buttons.get(usize::from(index)).copied())
            .unwrap_or(false)
    }

    pub fn identity(&self, device: DeviceId) -> Option<DeviceIdentity> {
        self.lock().entry(device).map(|e| e.identity.clone())
    }

    pub fn descriptor(&self, device: DeviceId) -> Option<DeviceDescriptor> {
        self.lock().entry(device).map(|e| e.descriptor.clone())
    }

    pub fn has_output(&self, device: DeviceId) -> bool {
        self.lock()
            .entry(device)
            .is_some_and(|e| e.output.is_some())
    }

    pub(crate) fn attach_output(&self, device: DeviceId, output: Box<dyn VirtualOutput>) {
        if let Some(entry) = self.lock().entry_mut(device) {
            entry.output = Some(output);
        }
    }

    /// Write an encoded axis value and cache it so readers see the writer's state.
    pub(crate) fn write_axis(
        &self,
        device: DeviceId,
        index: u8,
        encoded: u16,
        value: f64,
    ) -> Result<(), EngineError> {
        let mut table = self.lock();
        let entry = table
            .entry_mut(device)
            .ok_or_else(|| EngineError::Channel(format!("unknown device {:?}", device)))?;
        let (output, slot) = match (&mut entry.output, entry.descriptor.virtual_slot) {
            (Some(output), Some(slot)) => (output, slot),
            _ => return Err(EngineError::OutputNotEnabled(entry.identity.clone())),
        };
        output
            .set_axis(index.saturating_add(1), encoded)
            .map_err(|source| EngineError::OutputWrite { slot, source })?;
        if let Some(cached) = entry.axes.get_mut(usize::from(index)) {
            *cached = encode_native(value);
        }
        Ok(())
    }

    pub(crate) fn write_button(&self, device: DeviceId, index: u8, pressed: bool) -> Result<(), EngineError> {
        let mut table = self.lock();
        let entry = table
            .entry_mut(device)
            .ok_or_else(|| EngineError::Channel(format!("unknown device {:?}", device)))?;
        let (output, slot) = match (&mut entry.output, entry.descriptor.virtual_slot) {
            (Some(output), Some(slot)) => (output, slot),
            _ => return Err(EngineError::OutputNotEnabled(entry.identity.clone())),
        };
        output
            .set_button(index.saturating_add(1), pressed)
            .map_err(|source| EngineError::OutputWrite { slot, source })?;
        if let Some(cached) = entry.buttons.get_mut(usize::from(index)) {
            *cached = pressed;
        }
        debug!("{} button #{} <- {}", entry.identity, index, pressed);
        Ok(())
    }

    /// Drop every virtual writer. Called once the main context has drained its queue.
    pub fn release_outputs(&self) {
        let mut table = self.lock();
        let released = table
            .entries
            .iter_mut()
            .filter_map(|e| e.output.take())
            .count();
        info!("Released {} virtual output handle(s)", released);
    }
}
