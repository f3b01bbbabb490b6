//! Device and control abstraction
//!
//! Implements the input side of the routing engine:
//!
//! 1. [`channel`] - Identity value types
//! 2. [`registry`] - Device and control arenas, lazy opening and output upgrade
//! 3. [`controls`] - Control objects and their capabilities
//! 4. [`allocator`] - Next free virtual channel
//! 5. [`dispatch`] - Dedicated thread routing platform events to controls
//!
//! # Architecture
//!
//! ```text
//! EventSource ──► DispatchLoop ──[ControlId, RawValue]──► Engine ──► Control
//!                  (own thread)       (mpsc queue)         (main)
//! ```
//!
//! The dispatch thread and the main context only share the [`table::SharedDevices`]
//! table, locked for one operation at a time.

pub mod allocator;
pub mod channel;
pub mod controls;
pub mod dispatch;
pub mod encoding;
pub mod registry;
pub mod table;
