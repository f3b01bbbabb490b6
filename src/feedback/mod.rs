//! Feedback-synchronized switches
//!
//! A [`FeedbackSwitch`] wraps one output button and one observed in-app flag, and
//! drives the button until the flag matches the last request:
//!
//! ```text
//!            switch(target)           sample == request
//!  Unset ──────────────────► Converging ─────────────────► Converged
//!                                ▲                              │
//!                                └──── sample != request ───────┘
//! ```
//!
//! Corrections depend on the [`BindingMode`] and are never batched: one per mismatch
//! observation, then the switch waits for the next sample.

pub mod switch;
pub mod telemetry;

pub use switch::{BindingMode, Correction, FeedbackSwitch, SwitchPhase};
pub use telemetry::{FlagBank, FlagSample, TelemetrySender};
