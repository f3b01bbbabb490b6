//! Pulse revert timers, owned by the main context.

use crate::devices::channel::ControlId;
use std::future::poll_fn;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::debug;

/// Default time a pulsed button holds its target level.
pub const DEFAULT_PULSE: Duration = Duration::from_millis(100);

pub struct PulseTimers {
    queue: DelayQueue<ControlId>,
    duration: Duration,
}

impl Default for PulseTimers {
    fn default() -> Self {
        Self::new(DEFAULT_PULSE)
    }
}

impl PulseTimers {
    pub fn new(duration: Duration) -> Self {
        Self {
            queue: DelayQueue::new(),
            duration,
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Arm a one-shot revert for `control`, one pulse duration from now.
    pub fn schedule(&mut self, control: ControlId) -> (delay_queue::Key, Instant) {
        let deadline = Instant::now() + self.duration;
        let key = self.queue.insert_at(control, deadline);
        (key, deadline)
    }

    pub fn cancel(&mut self, key: &delay_queue::Key) {
        match self.queue.try_remove(key) {
            Some(expired) => debug!("Cancelled pending pulse on {:?}", expired.get_ref()),
            None => debug!("Pulse timer already gone"),
        }
    }

    /// Wait for the next revert. Resolves to `None` right away when nothing is armed.
    pub async fn next_expired(&mut self) -> Option<ControlId> {
        poll_fn(|cx| self.queue.poll_expired(cx))
            .await
            .map(|expired| expired.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn cancelled_timers_never_fire() {
        let mut timers = PulseTimers::default();
        let (first, _) = timers.schedule(ControlId(1));
        let (_, deadline) = timers.schedule(ControlId(2));
        timers.cancel(&first);
        assert_eq!(timers.len(), 1);

        assert_eq!(timers.next_expired().await, Some(ControlId(2)));
        assert!(Instant::now() >= deadline);
        assert!(Instant::now() < deadline + Duration::from_millis(5));
        assert!(timers.is_empty());
        assert_eq!(timers.next_expired().await, None);
    }
}
