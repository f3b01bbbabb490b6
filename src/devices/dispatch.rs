//! Event dispatch loop
//!
//! Runs on a dedicated OS thread. It blocks on the platform source, and on a full queue
//! until the main context catches up or a stop is requested. Every event is classified,
//! cached in the shared table and, when its channel is routed, forwarded as
//! `(ControlId, RawValue)` to the main context. Unrouted events and hats are dropped. A
//! source error ends the loop for good.

use super::channel::ControlId;
use super::table::SharedDevices;
use crate::error::EngineError;
use crate::platform::{BackendError, DeviceDescriptor, EventSource, RawEvent, RawValue, SourceFactory};
use chrono::Local;
use statum::{machine, state};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Pause between two attempts to hand a message to a full queue.
const QUEUE_FULL_RETRY: Duration = Duration::from_millis(1);

/// What the dispatch thread hands to the main context.
#[derive(Debug)]
pub enum DispatchMessage {
    Event { control: ControlId, raw: RawValue },
    /// The source failed. Nothing follows this message.
    Failed(BackendError),
}

#[derive(Clone, Debug)]
pub struct DispatchSettings {
    /// Upper bound on one blocking wait, and so on the time to notice a stop request.
    pub poll_interval: Duration,
    pub stats_interval: chrono::Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            stats_interval: chrono::Duration::seconds(10),
        }
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum DispatchState {
    Starting,
    Running,
}

#[machine]
pub struct DispatchLoop<S: DispatchState> {
    source: Box<dyn EventSource>,
    table: SharedDevices,
    sender: mpsc::Sender<DispatchMessage>,
    stop: Arc<AtomicBool>,
    settings: DispatchSettings,
}

impl DispatchLoop<Starting> {
    pub fn create(
        factory: SourceFactory,
        table: SharedDevices,
        sender: mpsc::Sender<DispatchMessage>,
        stop: Arc<AtomicBool>,
        settings: DispatchSettings,
    ) -> Result<Self, BackendError> {
        debug!("Creating dispatch loop with settings: {:?}", settings);
        let source = factory()?;
        Ok(Self::new(source, table, sender, stop, settings))
    }

    /// Enumerate the devices and move to the running state.
    pub fn enumerate(
        mut self,
    ) -> Result<(DispatchLoop<Running>, Vec<DeviceDescriptor>), BackendError> {
        let devices = self.source.devices()?;
        info!("Event source reports {} device(s):", devices.len());
        for device in &devices {
            info!(
                "  [{}] {} ({}), {} axes, {} buttons, {} hats{}",
                device.instance.0,
                device.name,
                device.guid,
                device.axes,
                device.buttons,
                device.hats,
                device
                    .virtual_slot
                    .map(|slot| format!(", {}", slot))
                    .unwrap_or_default()
            );
        }
        Ok((self.transition(), devices))
    }
}

impl DispatchLoop<Running> {
    /// Route one event. Returns `false` once the main context stopped listening.
    pub fn dispatch(&mut self, event: RawEvent) -> bool {
        let Some((channel, raw)) = event.channel() else {
            debug!("Dropping hat event: {:?}", event);
            return true;
        };
        let Some(control) = self.table.observe(channel, raw) else {
            debug!("Unrouted event: {:?}", event);
            return true;
        };
        send_until_stopped(&self.sender, &self.stop, DispatchMessage::Event { control, raw })
    }

    pub fn run(&mut self) -> Result<(), BackendError> {
        info!("Starting dispatch loop");

        let mut event_count = 0u64;
        let mut routed_count = 0u64;
        let mut last_log_time = Local::now();
        let log_interval = self.settings.stats_interval;

        while !self.stop.load(Ordering::Acquire) {
            if let Some(event) = self.source.wait_event(self.settings.poll_interval)? {
                event_count += 1;
                if event.channel().is_some() {
                    routed_count += 1;
                }
                if !self.dispatch(event) {
                    break;
                }
            }

            let now = Local::now();
            if now - last_log_time > log_interval {
                info!(
                    "Dispatch stats: {} events ({} on axes/buttons) in last {} seconds (avg {:.2}/sec)",
                    event_count,
                    routed_count,
                    log_interval.num_seconds(),
                    event_count as f64 / log_interval.num_seconds().max(1) as f64
                );
                event_count = 0;
                routed_count = 0;
                last_log_time = now;
            }
        }

        info!("Dispatch loop stopped");
        Ok(())
    }
}

/// Queue `message`, waiting while the queue is full. Gives up once a stop is requested
/// or the receiver is gone, so a stalled main context cannot keep the thread alive.
fn send_until_stopped(
    sender: &mpsc::Sender<DispatchMessage>,
    stop: &AtomicBool,
    mut message: DispatchMessage,
) -> bool {
    loop {
        match sender.try_send(message) {
            Ok(()) => return true,
            Err(TrySendError::Full(returned)) => {
                if stop.load(Ordering::Acquire) {
                    debug!("Stop requested with a full queue, dropping {:?}", returned);
                    return false;
                }
                message = returned;
                std::thread::sleep(QUEUE_FULL_RETRY);
            }
            Err(TrySendError::Closed(returned)) => {
                warn!("Main context gone, dropping {:?}", returned);
                return false;
            }
        }
    }
}

/// Owns the dispatch thread.
pub struct DispatchHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl DispatchHandle {
    /// Start the thread, build the source on it and wait for its device list.
    pub async fn spawn(
        factory: SourceFactory,
        table: SharedDevices,
        sender: mpsc::Sender<DispatchMessage>,
        settings: DispatchSettings,
    ) -> Result<(Self, Vec<DeviceDescriptor>), EngineError> {
        info!("Spawning dispatch thread");
        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = oneshot::channel();

        let thread_stop = stop.clone();
        let failure_stop = stop.clone();
        let thread = std::thread::Builder::new()
            .name("dispatch".into())
            .spawn(move || {
                let starting =
                    match DispatchLoop::create(factory, table, sender.clone(), thread_stop, settings) {
                        Ok(starting) => starting,
                        Err(e) => {
                            error!("Failed to create event source: {}", e);
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                let mut running = match starting.enumerate() {
                    Ok((running, devices)) => {
                        if ready_tx.send(Ok(devices)).is_err() {
                            warn!("Nobody waits for the device list, stopping");
                            return;
                        }
                        running
                    }
                    Err(e) => {
                        error!("Failed to enumerate devices: {}", e);
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = running.run() {
                    error!("Dispatch loop terminated with error: {}", e);
                    send_until_stopped(&sender, &failure_stop, DispatchMessage::Failed(e));
                }
            })
            .map_err(|e| EngineError::Channel(format!("failed to spawn dispatch thread: {}", e)))?;

        let devices = ready_rx
            .await
            .map_err(|_| EngineError::Channel("dispatch thread exited during startup".into()))?
            .map_err(EngineError::DeviceIo)?;

        info!("Dispatch thread running");
        Ok((
            Self {
                stop,
                thread: Some(thread),
            },
            devices,
        ))
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Ask the thread to stop and wait for it. Takes at most one poll interval.
    pub async fn shutdown(mut self) {
        self.stop.store(true, Ordering::Release);
        let Some(thread) = self.thread.take() else {
            return;
        };
        match tokio::task::spawn_blocking(move || thread.join()).await {
            Ok(Ok(())) => info!("Dispatch thread joined"),
            Ok(Err(_)) => error!("Dispatch thread panicked"),
            Err(e) => error!("Failed to join dispatch thread: {}", e),
        }
    }
}

impl Drop for DispatchHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}
