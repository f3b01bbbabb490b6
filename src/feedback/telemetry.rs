//! Observed flag samples
//!
//! The telemetry collaborator only ever reports a status bitfield. [`FlagBank`] turns
//! consecutive bitfields into per-flag change samples, in flag name order, and
//! [`TelemetrySender`] carries them into the main context.

use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagSample {
    pub flag: String,
    pub state: bool,
}

/// Named bits of a status word, with the last state seen for each.
#[derive(Debug, Clone, Default)]
pub struct FlagBank {
    bits: BTreeMap<String, u8>,
    last: BTreeMap<String, bool>,
}

impl FlagBank {
    /// Bits above 63 are dropped with a warning.
    pub fn new(bits: &BTreeMap<String, u8>) -> Self {
        let mut kept = BTreeMap::new();
        for (name, &bit) in bits {
            if bit >= 64 {
                warn!("Flag '{}' uses bit {}, status words are 64 bits wide", name, bit);
                continue;
            }
            kept.insert(name.clone(), bit);
        }
        Self {
            bits: kept,
            last: BTreeMap::new(),
        }
    }

    pub fn contains(&self, flag: &str) -> bool {
        self.bits.contains_key(flag)
    }

    pub fn flags(&self) -> impl Iterator<Item = &str> {
        self.bits.keys().map(String::as_str)
    }

    /// Samples for every flag whose state differs from the previous word.
    /// The first word reports every flag.
    pub fn apply(&mut self, word: u64) -> Vec<FlagSample> {
        let mut samples = Vec::new();
        for (flag, &bit) in &self.bits {
            let state = word & (1u64 << bit) != 0;
            if self.last.get(flag) != Some(&state) {
                self.last.insert(flag.clone(), state);
                samples.push(FlagSample {
                    flag: flag.clone(),
                    state,
                });
            }
        }
        debug!("Status word {:#018x} changed {} flag(s)", word, samples.len());
        samples
    }

    /// Single flag update. Returns `None` when the state did not change or the flag
    /// is unknown.
    pub fn set(&mut self, flag: &str, state: bool) -> Option<FlagSample> {
        if !self.contains(flag) {
            warn!("Unknown flag '{}'", flag);
            return None;
        }
        if self.last.get(flag) == Some(&state) {
            return None;
        }
        self.last.insert(flag.to_string(), state);
        Some(FlagSample {
            flag: flag.to_string(),
            state,
        })
    }
}

/// Marshals samples into the main context, in the order they are sent.
#[derive(Clone)]
pub struct TelemetrySender {
    sender: mpsc::Sender<FlagSample>,
}

impl TelemetrySender {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<FlagSample>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }

    /// Returns `false` once the main context stopped listening.
    pub async fn send(&self, sample: FlagSample) -> bool {
        match self.sender.send(sample).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Telemetry sample dropped: {:?}", e.0);
                false
            }
        }
    }

    /// For telemetry readers running on their own OS thread.
    pub fn blocking_send(&self, sample: FlagSample) -> bool {
        match self.sender.blocking_send(sample) {
            Ok(()) => true,
            Err(e) => {
                warn!("Telemetry sample dropped: {:?}", e.0);
                false
            }
        }
    }
}
