//! Error taxonomy for the routing engine
//!
//! Startup errors (`DeviceNotFound`, `DeviceAmbiguous`, `NoChannelsAvailable`) abort
//! binding construction. `DeviceIo` ends the dispatch loop. `OutputWrite` is transient
//! and only ever reported to the caller of a write.

use crate::devices::channel::{ChannelKind, DeviceIdentity, VirtualSlot};
use crate::platform::BackendError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("No device found for identity {0}")]
    DeviceNotFound(DeviceIdentity),

    #[error("Identity {identity} matches {candidates} devices, use a GUID instead")]
    DeviceAmbiguous {
        identity: DeviceIdentity,
        candidates: usize,
    },

    #[error("No more available {kind} on any virtual device: please create more")]
    NoChannelsAvailable { kind: ChannelKind },

    #[error("Channel {kind} #{index} does not exist on {identity}")]
    ChannelOutOfRange {
        identity: DeviceIdentity,
        kind: ChannelKind,
        index: u8,
    },

    #[error("Device I/O error: {0}")]
    DeviceIo(#[source] BackendError),

    #[error("Failed to write virtual device {slot}: {source}")]
    OutputWrite {
        slot: VirtualSlot,
        #[source]
        source: BackendError,
    },

    #[error("Output has not been enabled for {0}")]
    OutputNotEnabled(DeviceIdentity),

    #[error("Binding error: {0}")]
    Binding(String),

    #[error("Channel error: {0}")]
    Channel(String),
}

impl EngineError {
    /// Errors after which the process needs a full restart.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, EngineError::OutputWrite { .. })
    }
}
