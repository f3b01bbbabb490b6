//! Picks the next free virtual channel.
//!
//! Slots are walked in ascending order, ignored slots are skipped, and within a slot the
//! lowest unclaimed index wins. Claims are never released, so for a fixed pool and
//! ignore-list the sequence of results is deterministic.

use super::channel::{ChannelKind, ChannelRef, DeviceIdentity, Direction, VirtualSlot};
use super::registry::DeviceRegistry;
use crate::error::EngineError;
use std::collections::BTreeSet;
use std::ops::Range;
use tracing::{debug, warn};

/// Every `(slot, kind, index)` handed out so far. Only grows.
#[derive(Debug, Default, Clone)]
pub struct AllocationRecord {
    claimed: BTreeSet<(VirtualSlot, ChannelKind, u8)>,
}

impl AllocationRecord {
    /// Returns `false` when the channel was already claimed.
    pub fn claim(&mut self, slot: VirtualSlot, kind: ChannelKind, index: u8) -> bool {
        self.claimed.insert((slot, kind, index))
    }

    pub fn is_claimed(&self, slot: VirtualSlot, kind: ChannelKind, index: u8) -> bool {
        self.claimed.contains(&(slot, kind, index))
    }

    pub fn len(&self) -> usize {
        self.claimed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claimed.is_empty()
    }
}

/// Lowest free axis across the pool.
pub fn next_free_axis(
    registry: &mut DeviceRegistry,
    pool: &[VirtualSlot],
    ignore: &[VirtualSlot],
    as_output: bool,
) -> Result<ChannelRef, EngineError> {
    next_free(registry, ChannelKind::Axis, pool, ignore, None, as_output)
}

/// Lowest free button across the pool, restricted to `range` when given.
pub fn next_free_button(
    registry: &mut DeviceRegistry,
    pool: &[VirtualSlot],
    ignore: &[VirtualSlot],
    range: Option<Range<u8>>,
    as_output: bool,
) -> Result<ChannelRef, EngineError> {
    next_free(registry, ChannelKind::Button, pool, ignore, range, as_output)
}

fn next_free(
    registry: &mut DeviceRegistry,
    kind: ChannelKind,
    pool: &[VirtualSlot],
    ignore: &[VirtualSlot],
    range: Option<Range<u8>>,
    as_output: bool,
) -> Result<ChannelRef, EngineError> {
    let mut slots = pool.to_vec();
    slots.sort_unstable();
    slots.dedup();

    let direction = if as_output {
        Direction::Output
    } else {
        Direction::Input
    };

    for slot in slots {
        if ignore.contains(&slot) {
            debug!("Skipping ignored {}", slot);
            continue;
        }
        let device = registry.acquire(&DeviceIdentity::Virtual(slot))?;
        let capacity = registry
            .descriptor(device)
            .map_or(0, |descriptor| descriptor.capacity(kind));
        let window = match &range {
            Some(range) => range.start..range.end.min(capacity),
            None => 0..capacity,
        };
        let free = window
            .into_iter()
            .find(|&index| !registry.allocations().is_claimed(slot, kind, index));
        if let Some(index) = free {
            debug!("Allocated {} #{} on {}", kind, index, slot);
            return registry.register(device, kind, index, direction);
        }
    }

    warn!("Virtual {} pool exhausted", kind);
    Err(EngineError::NoChannelsAvailable { kind })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::encoding::AxisEncoding;
    use crate::devices::table::SharedDevices;
    use crate::platform::loopback::{LoopbackHub, LoopbackLayout};

    fn registry(virtual_devices: u8, buttons: u8) -> DeviceRegistry {
        let hub = LoopbackHub::new(&LoopbackLayout {
            physical: Vec::new(),
            virtual_devices,
            virtual_axes: 2,
            virtual_buttons: buttons,
        });
        DeviceRegistry::new(
            hub.devices().to_vec(),
            SharedDevices::new(),
            Box::new(hub.driver()),
            AxisEncoding::Symmetric,
        )
    }

    #[test]
    fn buttons_are_handed_out_in_increasing_order_until_exhausted() {
        let mut registry = registry(2, 3);
        let pool = registry.virtual_slots();
        let mut seen = Vec::new();
        loop {
            match next_free_button(&mut registry, &pool, &[], None, false) {
                Ok(channel) => seen.push((channel.device, channel.index)),
                Err(EngineError::NoChannelsAvailable { kind }) => {
                    assert_eq!(kind, ChannelKind::Button);
                    break;
                }
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(seen.len(), 6);
        assert!(seen.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(registry.allocations().len(), 6);
    }

    #[test]
    fn ignored_slots_and_ranges_are_honoured() {
        let mut registry = registry(3, 8);
        let pool = [VirtualSlot(2), VirtualSlot(0), VirtualSlot(1)];
        let ignore = [VirtualSlot(0)];

        let first = next_free_button(&mut registry, &pool, &ignore, Some(4..6), true).unwrap();
        let second = next_free_button(&mut registry, &pool, &ignore, Some(4..6), true).unwrap();
        let third = next_free_button(&mut registry, &pool, &ignore, Some(4..6), true).unwrap();

        let slot_of = |registry: &DeviceRegistry, channel: ChannelRef| {
            registry.descriptor(channel.device).unwrap().virtual_slot.unwrap()
        };
        assert_eq!((slot_of(&registry, first), first.index), (VirtualSlot(1), 4));
        assert_eq!((slot_of(&registry, second), second.index), (VirtualSlot(1), 5));
        assert_eq!((slot_of(&registry, third), third.index), (VirtualSlot(2), 4));
    }

    #[test]
    fn explicit_registrations_are_skipped_by_allocation() {
        let mut registry = registry(1, 4);
        registry.virtual_button(VirtualSlot(0), 0, false).unwrap();
        registry.virtual_button(VirtualSlot(0), 1, false).unwrap();
        let pool = registry.virtual_slots();
        let next = next_free_button(&mut registry, &pool, &[], None, false).unwrap();
        assert_eq!(next.index, 2);
    }

    #[test]
    fn range_outside_capacity_is_exhausted() {
        let mut registry = registry(1, 4);
        let pool = registry.virtual_slots();
        assert!(matches!(
            next_free_button(&mut registry, &pool, &[], Some(10..20), false),
            Err(EngineError::NoChannelsAvailable { .. })
        ));
    }

    #[test]
    fn axes_come_from_the_first_slot_with_room() {
        let mut registry = registry(2, 4);
        let pool = registry.virtual_slots();
        let indexes: Vec<u8> = (0..3)
            .map(|_| next_free_axis(&mut registry, &pool, &[], true).unwrap().index)
            .collect();
        assert_eq!(indexes, vec![0, 1, 0]);
    }
}
