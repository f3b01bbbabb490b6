//! Main-context routing engine
//!
//! The engine owns the registry arenas, the feedback switches and the pulse timers. Its
//! run loop drains three sources on a single-threaded scheduler:
//!
//! ```text
//! dispatch queue ──[ControlId, RawValue]──┐
//! telemetry queue ──[FlagSample]──────────┼──► Engine ──► virtual outputs
//! pulse timers ──[ControlId]──────────────┘
//! ```
//!
//! Each queue is handled in arrival order, without coalescing. `OutputWrite` errors are
//! logged and the loop goes on, every other error ends it.

pub mod routes;
pub mod timers;

use crate::devices::channel::ControlId;
use crate::devices::controls::{Control, ControlEvent, OutputButton, WriteAxis};
use crate::devices::dispatch::DispatchMessage;
use crate::devices::registry::DeviceRegistry;
use crate::error::EngineError;
use crate::feedback::{BindingMode, Correction, FeedbackSwitch, FlagSample};
use crate::platform::RawValue;
use routes::{Action, Route, Subscriber, SwitchId, Target};
use std::collections::HashMap;
use std::time::Duration;
use timers::PulseTimers;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

pub struct Engine {
    registry: DeviceRegistry,
    timers: PulseTimers,
    switches: Vec<FeedbackSwitch>,
    by_flag: HashMap<String, Vec<SwitchId>>,
    subscribers: HashMap<ControlId, Vec<Subscriber>>,
}

fn output_button(
    registry: &mut DeviceRegistry,
    control: ControlId,
) -> Result<&mut OutputButton, EngineError> {
    registry
        .control_mut(control)
        .and_then(Control::as_output_button_mut)
        .ok_or_else(|| EngineError::Channel(format!("{:?} is not an output button", control)))
}

/// Log transient errors, pass fatal ones through.
fn settle(result: Result<(), EngineError>) -> Result<(), EngineError> {
    match result {
        Err(e) if !e.is_fatal() => {
            warn!("Transient engine error: {}", e);
            Ok(())
        }
        other => other,
    }
}

impl Engine {
    pub fn new(registry: DeviceRegistry, pulse: Duration) -> Self {
        info!("Creating engine with {:?} pulses", pulse);
        Self {
            registry,
            timers: PulseTimers::new(pulse),
            switches: Vec::new(),
            by_flag: HashMap::new(),
            subscribers: HashMap::new(),
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut DeviceRegistry {
        &mut self.registry
    }

    pub fn timers(&self) -> &PulseTimers {
        &self.timers
    }

    /// Wrap an output button with an observed flag.
    pub fn add_feedback_switch(
        &mut self,
        name: &str,
        button: ControlId,
        flag: &str,
        mode: BindingMode,
    ) -> Result<SwitchId, EngineError> {
        output_button(&mut self.registry, button)?;
        let id = SwitchId(self.switches.len());
        self.switches
            .push(FeedbackSwitch::new(name, button, flag, mode));
        self.by_flag.entry(flag.to_string()).or_default().push(id);
        info!("Feedback switch '{}' follows '{}' ({:?})", name, flag, mode);
        Ok(id)
    }

    pub fn feedback_switch(&self, id: SwitchId) -> Option<&FeedbackSwitch> {
        self.switches.get(id.0)
    }

    pub fn feedback_switches(&self) -> &[FeedbackSwitch] {
        &self.switches
    }

    /// Channel receiving every notification of `control`, until the receiver is dropped.
    pub fn subscribe(&mut self, control: ControlId) -> mpsc::UnboundedReceiver<ControlEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers
            .entry(control)
            .or_default()
            .push(Subscriber::Channel(sender));
        receiver
    }

    pub fn add_route(&mut self, source: ControlId, route: Route) -> Result<(), EngineError> {
        let control = self
            .registry
            .control(source)
            .ok_or_else(|| EngineError::Binding(format!("unknown source {:?}", source)))?;
        if control.kind() != route.trigger.source_kind() {
            return Err(EngineError::Binding(format!(
                "{:?} is never published by {} #{}",
                route.trigger,
                control.kind(),
                control.index()
            )));
        }
        match route.target {
            Target::Axis(target) => {
                self.registry
                    .control_mut(target)
                    .and_then(Control::as_output_axis_mut)
                    .ok_or_else(|| {
                        EngineError::Binding(format!("{:?} is not an output axis", target))
                    })?;
            }
            Target::Button(target) => {
                output_button(&mut self.registry, target)?;
            }
            Target::Switch(id) => {
                if self.switches.get(id.0).is_none() {
                    return Err(EngineError::Binding(format!("unknown switch {:?}", id)));
                }
            }
        }
        debug!("Route {:?} -> {:?}", source, route);
        self.subscribers
            .entry(source)
            .or_default()
            .push(Subscriber::Route(route));
        Ok(())
    }

    /// Decode a raw value on its control and deliver the notifications in order.
    pub fn handle_raw(&mut self, control: ControlId, raw: RawValue) -> Result<(), EngineError> {
        let notifications = self
            .registry
            .control(control)
            .ok_or_else(|| EngineError::Channel(format!("event for unknown {:?}", control)))?
            .process_event(raw);
        let mut outcome = Ok(());
        for notification in notifications {
            let result = self.deliver(ControlEvent {
                control,
                notification,
            });
            if outcome.is_ok() {
                outcome = result;
            }
        }
        outcome
    }

    fn deliver(&mut self, event: ControlEvent) -> Result<(), EngineError> {
        let Some(mut subscribers) = self.subscribers.remove(&event.control) else {
            return Ok(());
        };
        let mut outcome = Ok(());
        subscribers.retain(|subscriber| match subscriber {
            Subscriber::Channel(sender) => sender.send(event).is_ok(),
            Subscriber::Route(route) => {
                if let Some(action) = route.action(&event.notification) {
                    if let Err(e) = self.apply(route.target, action) {
                        warn!("Route from {:?} failed: {}", event.control, e);
                        if outcome.is_ok() {
                            outcome = Err(e);
                        }
                    }
                }
                true
            }
        });
        self.subscribers.insert(event.control, subscribers);
        outcome
    }

    /// Perform one write on a logical output.
    pub fn apply(&mut self, target: Target, action: Action) -> Result<(), EngineError> {
        match (target, action) {
            (Target::Axis(control), Action::Move(value)) => self
                .registry
                .control_mut(control)
                .and_then(Control::as_output_axis_mut)
                .ok_or_else(|| EngineError::Channel(format!("{:?} is not an output axis", control)))?
                .move_to(value),
            (Target::Button(control), Action::Switch(level)) => {
                output_button(&mut self.registry, control)?.switch(level, &mut self.timers)?;
                Ok(())
            }
            (Target::Button(control), Action::Pulse(level)) => {
                output_button(&mut self.registry, control)?.pulse(level, &mut self.timers)?;
                Ok(())
            }
            (Target::Switch(id), Action::Switch(level)) => self.switch(id, level).map(|_| ()),
            (target, action) => Err(EngineError::Binding(format!(
                "{:?} cannot be applied to {:?}",
                action, target
            ))),
        }
    }

    /// Request a state on a feedback switch.
    pub fn switch(
        &mut self,
        id: SwitchId,
        target: Option<bool>,
    ) -> Result<Option<Correction>, EngineError> {
        let switch = self
            .switches
            .get_mut(id.0)
            .ok_or_else(|| EngineError::Channel(format!("unknown switch {:?}", id)))?;
        let button = output_button(&mut self.registry, switch.button())?;
        switch.switch(target, button, &mut self.timers)
    }

    /// Inbound surface of the telemetry collaborator.
    pub fn on_observed_flag_changed(&mut self, flag: &str, state: bool) -> Result<(), EngineError> {
        let Some(ids) = self.by_flag.get(flag).cloned() else {
            debug!("No switch follows '{}'", flag);
            return Ok(());
        };
        debug!("Observed '{}' = {}", flag, state);
        let mut outcome = Ok(());
        for id in ids {
            let Some(switch) = self.switches.get_mut(id.0) else {
                continue;
            };
            let result = output_button(&mut self.registry, switch.button())
                .and_then(|button| switch.on_observed(state, button, &mut self.timers));
            if let Err(e) = result {
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        }
        outcome
    }

    /// Timer expiry for a pulsed button.
    pub fn end_pulse(&mut self, control: ControlId) -> Result<(), EngineError> {
        output_button(&mut self.registry, control)?.end_pulse()
    }

    fn handle_message(&mut self, message: DispatchMessage) -> Result<(), EngineError> {
        match message {
            DispatchMessage::Event { control, raw } => settle(self.handle_raw(control, raw)),
            DispatchMessage::Failed(e) => {
                error!("Event source failed: {}", e);
                Err(EngineError::DeviceIo(e))
            }
        }
    }

    /// Run until the dispatch queue closes, a shutdown is requested or a fatal error occurs.
    pub async fn run(
        &mut self,
        events: &mut mpsc::Receiver<DispatchMessage>,
        telemetry: &mut mpsc::Receiver<FlagSample>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), EngineError> {
        info!("Engine running");
        let mut telemetry_open = true;
        loop {
            tokio::select! {
                message = events.recv() => match message {
                    Some(message) => self.handle_message(message)?,
                    None => {
                        info!("Dispatch queue closed");
                        return Ok(());
                    }
                },
                sample = telemetry.recv(), if telemetry_open => match sample {
                    Some(FlagSample { flag, state }) => {
                        settle(self.on_observed_flag_changed(&flag, state))?
                    }
                    None => {
                        debug!("Telemetry queue closed");
                        telemetry_open = false;
                    }
                },
                Some(control) = self.timers.next_expired(), if !self.timers.is_empty() => {
                    settle(self.end_pulse(control))?
                }
                _ = shutdown.changed() => {
                    info!("Engine shutdown requested");
                    return Ok(());
                }
            }
        }
    }

    /// Handle whatever is still queued. Used once the dispatch thread has stopped.
    pub fn drain(&mut self, events: &mut mpsc::Receiver<DispatchMessage>) -> usize {
        let mut drained = 0;
        while let Ok(message) = events.try_recv() {
            drained += 1;
            if let Err(e) = self.handle_message(message) {
                warn!("Error while draining: {}", e);
            }
        }
        debug!("Drained {} queued message(s)", drained);
        drained
    }

    /// Drop every virtual output handle. Pending pulses are abandoned.
    pub fn close(self) {
        if !self.timers.is_empty() {
            info!("Abandoning {} pending pulse(s)", self.timers.len());
        }
        self.registry.table().release_outputs();
    }
}

#[cfg(test)]
mod tests {
    use super::routes::{Command, Trigger};
    use super::*;
    use crate::devices::channel::{ChannelId, ChannelKind, VirtualSlot};
    use crate::devices::controls::{Notification, ReadButton};
    use crate::devices::encoding::AxisEncoding;
    use crate::devices::table::SharedDevices;
    use crate::platform::loopback::{LoopbackHub, LoopbackLayout, RecordedWrite, SimulatedDevice};
    use tokio::time::{advance, Instant};

    fn setup() -> (LoopbackHub, Engine) {
        let hub = LoopbackHub::new(&LoopbackLayout {
            physical: vec![SimulatedDevice {
                name: "Stick".into(),
                axes: 2,
                buttons: 4,
                hats: 0,
            }],
            virtual_devices: 1,
            virtual_axes: 2,
            virtual_buttons: 8,
        });
        let registry = DeviceRegistry::new(
            hub.devices().to_vec(),
            SharedDevices::new(),
            Box::new(hub.driver()),
            AxisEncoding::Symmetric,
        );
        (hub, Engine::new(registry, timers::DEFAULT_PULSE))
    }

    fn state(engine: &Engine, control: ControlId) -> bool {
        engine
            .registry()
            .control(control)
            .and_then(Control::as_output_button)
            .map(|b| b.state())
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn pulse_then_opposite_pulse_leaves_one_timer() {
        let (hub, mut engine) = setup();
        let button = engine
            .registry_mut()
            .virtual_button(VirtualSlot(0), 0, true)
            .unwrap()
            .control;
        let target = Target::Button(button);

        engine.apply(target, Action::Pulse(Some(true))).unwrap();
        advance(Duration::from_millis(40)).await;
        engine.apply(target, Action::Pulse(Some(false))).unwrap();
        assert_eq!(engine.timers().len(), 1);

        let deadline = engine
            .registry()
            .control(button)
            .and_then(Control::as_output_button)
            .and_then(|b| b.pending_pulse().map(|p| p.deadline))
            .unwrap();
        let expired = engine.timers.next_expired().await.unwrap();
        assert_eq!(expired, button);
        assert!(Instant::now() >= deadline);
        engine.end_pulse(expired).unwrap();

        assert!(engine.timers().is_empty());
        assert!(!state(&engine, button));
        let presses = hub
            .writes()
            .iter()
            .filter(|w| matches!(w, RecordedWrite::Button { pressed: true, .. }))
            .count();
        assert_eq!(presses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn late_echoes_do_not_roll_back_written_state() {
        let (hub, mut engine) = setup();
        let button = engine
            .registry_mut()
            .virtual_button(VirtualSlot(0), 2, true)
            .unwrap()
            .control;
        let target = Target::Button(button);
        let instance = hub
            .devices()
            .iter()
            .find(|d| d.virtual_slot == Some(VirtualSlot(0)))
            .unwrap()
            .instance;
        let channel = ChannelId {
            instance,
            kind: ChannelKind::Button,
            index: 2,
        };

        engine.apply(target, Action::Pulse(Some(true))).unwrap();
        let expired = engine.timers.next_expired().await.unwrap();
        engine.end_pulse(expired).unwrap();
        assert!(!state(&engine, button));

        // The press echo shows up after the release was already written.
        let routed = engine
            .registry()
            .table()
            .observe(channel, RawValue::Button(true));
        assert_eq!(routed, Some(button));
        engine.handle_raw(button, RawValue::Button(true)).unwrap();
        assert!(!state(&engine, button));

        engine.apply(target, Action::Pulse(None)).unwrap();
        assert!(state(&engine, button));
        let expired = engine.timers.next_expired().await.unwrap();
        engine.end_pulse(expired).unwrap();
        assert!(!state(&engine, button));

        let edges: Vec<bool> = hub
            .writes()
            .iter()
            .filter_map(|w| match w {
                RecordedWrite::Button {
                    button: 3, pressed, ..
                } => Some(*pressed),
                _ => None,
            })
            .collect();
        assert_eq!(edges, vec![true, false, true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn switch_cancels_a_pending_pulse() {
        let (_hub, mut engine) = setup();
        let button = engine
            .registry_mut()
            .virtual_button(VirtualSlot(0), 1, true)
            .unwrap()
            .control;
        engine
            .apply(Target::Button(button), Action::Pulse(None))
            .unwrap();
        engine
            .apply(Target::Button(button), Action::Switch(Some(false)))
            .unwrap();
        assert!(engine.timers().is_empty());
        assert!(!state(&engine, button));
    }

    #[tokio::test(start_paused = true)]
    async fn routes_and_channel_subscribers_see_notifications_in_order() {
        let (hub, mut engine) = setup();
        let source = engine.registry_mut().physical_button("Stick", 2).unwrap().control;
        let output = engine
            .registry_mut()
            .virtual_button(VirtualSlot(0), 3, true)
            .unwrap()
            .control;
        engine
            .add_route(
                source,
                Route::new(Trigger::Switched, Command::Follow, Target::Button(output)).unwrap(),
            )
            .unwrap();
        let mut events = engine.subscribe(source);

        engine.handle_raw(source, RawValue::Button(true)).unwrap();
        assert!(state(&engine, output));
        assert_eq!(events.try_recv().unwrap().notification, Notification::Pressed);
        assert_eq!(
            events.try_recv().unwrap().notification,
            Notification::Switched(true)
        );
        assert_eq!(
            hub.writes(),
            vec![RecordedWrite::Button {
                slot: VirtualSlot(0),
                button: 4,
                pressed: true
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn axis_passthrough_encodes_for_the_driver() {
        let (hub, mut engine) = setup();
        let source = engine.registry_mut().physical_axis("Stick", 0).unwrap().control;
        let output = engine
            .registry_mut()
            .virtual_axis(VirtualSlot(0), 1, true)
            .unwrap()
            .control;
        engine
            .add_route(
                source,
                Route::new(Trigger::Moved, Command::Move, Target::Axis(output)).unwrap(),
            )
            .unwrap();
        engine.handle_raw(source, RawValue::Axis(i16::MAX)).unwrap();
        assert_eq!(
            hub.writes(),
            vec![RecordedWrite::Axis {
                slot: VirtualSlot(0),
                axis: 2,
                value: 0x8000
            }]
        );
        assert!(
            (engine.registry().control(output).unwrap().value().unwrap() - 1.0).abs() < 1e-4
        );
    }

    #[tokio::test(start_paused = true)]
    async fn routes_are_checked_against_their_source() {
        let (_hub, mut engine) = setup();
        let source = engine.registry_mut().physical_axis("Stick", 0).unwrap().control;
        let output = engine
            .registry_mut()
            .virtual_button(VirtualSlot(0), 0, true)
            .unwrap()
            .control;
        let route = Route::new(Trigger::Pressed, Command::Toggle, Target::Button(output)).unwrap();
        assert!(matches!(
            engine.add_route(source, route),
            Err(EngineError::Binding(_))
        ));
        assert!(matches!(
            engine.add_feedback_switch("x", source, "flag", BindingMode::ToggleOnly),
            Err(EngineError::Channel(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_route_write_is_transient() {
        let (hub, mut engine) = setup();
        let source = engine.registry_mut().physical_button("Stick", 0).unwrap().control;
        let output = engine
            .registry_mut()
            .virtual_button(VirtualSlot(0), 0, true)
            .unwrap()
            .control;
        engine
            .add_route(
                source,
                Route::new(Trigger::Pressed, Command::Toggle, Target::Button(output)).unwrap(),
            )
            .unwrap();
        hub.reject_writes(true);
        let result = engine.handle_raw(source, RawValue::Button(true));
        assert!(matches!(result, Err(EngineError::OutputWrite { .. })));
        assert!(settle(result).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn flag_changes_reach_every_switch_on_the_flag() {
        let (hub, mut engine) = setup();
        let a = engine
            .registry_mut()
            .virtual_button(VirtualSlot(0), 0, true)
            .unwrap()
            .control;
        let b = engine
            .registry_mut()
            .virtual_button(VirtualSlot(0), 1, true)
            .unwrap()
            .control;
        let first = engine
            .add_feedback_switch("gear", a, "gear_down", BindingMode::ToggleOnly)
            .unwrap();
        let second = engine
            .add_feedback_switch("gear hold", b, "gear_down", BindingMode::HoldCapable)
            .unwrap();

        engine.on_observed_flag_changed("gear_down", false).unwrap();
        assert_eq!(engine.switch(first, Some(true)).unwrap(), Some(Correction::Pulse));
        assert_eq!(
            engine.switch(second, Some(true)).unwrap(),
            Some(Correction::Hold(true))
        );
        engine.on_observed_flag_changed("gear_down", true).unwrap();
        engine.on_observed_flag_changed("unrelated", true).unwrap();
        assert_eq!(hub.writes().len(), 2);
    }
}
