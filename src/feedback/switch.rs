use crate::devices::channel::ControlId;
use crate::devices::controls::{OutputButton, ReadButton};
use crate::engine::timers::PulseTimers;
use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// How the application's binding for the switch reacts to the output button.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BindingMode {
    /// Every press edge toggles the in-app state.
    #[default]
    ToggleOnly,
    /// The in-app state follows the held level, but only changes on an edge.
    HoldCapable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchPhase {
    Unset,
    Converging,
    Converged,
}

/// Write issued to move the in-app state toward the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correction {
    Pulse,
    Hold(bool),
}

/// Output button kept in step with an observed in-app flag.
#[derive(Debug, Clone)]
pub struct FeedbackSwitch {
    name: String,
    button: ControlId,
    flag: String,
    mode: BindingMode,
    requested: Option<bool>,
    observed: Option<bool>,
    /// A correction went out and no sample changed since.
    awaiting: bool,
}

impl FeedbackSwitch {
    pub fn new(name: &str, button: ControlId, flag: &str, mode: BindingMode) -> Self {
        Self {
            name: name.to_string(),
            button,
            flag: flag.to_string(),
            mode,
            requested: None,
            observed: None,
            awaiting: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn button(&self) -> ControlId {
        self.button
    }

    pub fn flag(&self) -> &str {
        &self.flag
    }

    pub fn mode(&self) -> BindingMode {
        self.mode
    }

    pub fn requested(&self) -> Option<bool> {
        self.requested
    }

    pub fn observed(&self) -> Option<bool> {
        self.observed
    }

    /// Unknown observed state counts as a mismatch until the first sample arrives.
    pub fn phase(&self) -> SwitchPhase {
        match self.requested {
            None => SwitchPhase::Unset,
            Some(requested) if self.observed == Some(requested) => SwitchPhase::Converged,
            Some(_) => SwitchPhase::Converging,
        }
    }

    /// Request an in-app state. Without a target, toggles the observed state.
    ///
    /// Corrects right away when the request creates a known mismatch.
    pub fn switch(
        &mut self,
        target: Option<bool>,
        button: &mut OutputButton,
        timers: &mut PulseTimers,
    ) -> Result<Option<Correction>, EngineError> {
        let target = target.unwrap_or_else(|| !self.observed.unwrap_or(false));
        let changed = self.requested != Some(target);
        self.requested = Some(target);
        info!("{} requested {}", self.name, if target { "on" } else { "off" });

        match self.observed {
            None => {
                debug!("{} waits for the first '{}' sample", self.name, self.flag);
                Ok(None)
            }
            Some(observed) if observed == target => {
                self.awaiting = false;
                Ok(None)
            }
            Some(_) if changed || !self.awaiting => self.correct(target, button, timers),
            Some(_) => {
                debug!("{} already has a correction in flight", self.name);
                Ok(None)
            }
        }
    }

    /// New sample of the observed flag.
    ///
    /// At most one correction per sample, and none while a previous one has not been
    /// answered by a change of the flag.
    pub fn on_observed(
        &mut self,
        state: bool,
        button: &mut OutputButton,
        timers: &mut PulseTimers,
    ) -> Result<Option<Correction>, EngineError> {
        let changed = self.observed != Some(state);
        self.observed = Some(state);

        let Some(requested) = self.requested else {
            return Ok(None);
        };
        if requested == state {
            if changed {
                debug!("{} converged on {}", self.name, state);
            }
            self.awaiting = false;
            return Ok(None);
        }
        if !changed && self.awaiting {
            debug!("{} still waiting for '{}' to follow", self.name, self.flag);
            return Ok(None);
        }
        self.correct(requested, button, timers)
    }

    fn correct(
        &mut self,
        requested: bool,
        button: &mut OutputButton,
        timers: &mut PulseTimers,
    ) -> Result<Option<Correction>, EngineError> {
        let correction = match self.mode {
            BindingMode::ToggleOnly => Correction::Pulse,
            BindingMode::HoldCapable if button.state() == requested => Correction::Pulse,
            BindingMode::HoldCapable => Correction::Hold(requested),
        };
        let result = match correction {
            Correction::Pulse => button.pulse(None, timers),
            Correction::Hold(level) => button.switch(Some(level), timers),
        };
        match result {
            Ok(_) => {
                info!("{} correcting toward {} with {:?}", self.name, requested, correction);
                self.awaiting = true;
                Ok(Some(correction))
            }
            Err(e) => {
                warn!("{} correction failed: {}", self.name, e);
                self.awaiting = false;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::channel::VirtualSlot;
    use crate::devices::encoding::AxisEncoding;
    use crate::devices::registry::DeviceRegistry;
    use crate::devices::table::SharedDevices;
    use crate::platform::loopback::{LoopbackHub, LoopbackLayout, RecordedWrite};

    struct Rig {
        hub: LoopbackHub,
        registry: DeviceRegistry,
        timers: PulseTimers,
        button: ControlId,
    }

    fn rig() -> Rig {
        let hub = LoopbackHub::new(&LoopbackLayout {
            physical: Vec::new(),
            virtual_devices: 1,
            virtual_axes: 1,
            virtual_buttons: 8,
        });
        let mut registry = DeviceRegistry::new(
            hub.devices().to_vec(),
            SharedDevices::new(),
            Box::new(hub.driver()),
            AxisEncoding::Symmetric,
        );
        let button = registry
            .virtual_button(VirtualSlot(0), 0, true)
            .unwrap()
            .control;
        Rig {
            hub,
            registry,
            timers: PulseTimers::default(),
            button,
        }
    }

    impl Rig {
        fn request(&mut self, switch: &mut FeedbackSwitch, target: Option<bool>) -> Option<Correction> {
            let button = self
                .registry
                .control_mut(self.button)
                .and_then(|c| c.as_output_button_mut())
                .unwrap();
            switch.switch(target, button, &mut self.timers).unwrap()
        }

        fn sample(&mut self, switch: &mut FeedbackSwitch, state: bool) -> Option<Correction> {
            let button = self
                .registry
                .control_mut(self.button)
                .and_then(|c| c.as_output_button_mut())
                .unwrap();
            switch.on_observed(state, button, &mut self.timers).unwrap()
        }

        fn hold(&mut self, level: bool) {
            let button = self
                .registry
                .control_mut(self.button)
                .and_then(|c| c.as_output_button_mut())
                .unwrap();
            button.switch(Some(level), &mut self.timers).unwrap();
        }

        fn presses(&self) -> usize {
            self.hub
                .writes()
                .iter()
                .filter(|w| matches!(w, RecordedWrite::Button { pressed: true, .. }))
                .count()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn toggle_only_pulses_once_per_mismatch() {
        let mut rig = rig();
        let mut switch = FeedbackSwitch::new("gear", rig.button, "gear_down", BindingMode::ToggleOnly);
        assert_eq!(switch.phase(), SwitchPhase::Unset);

        assert_eq!(rig.request(&mut switch, Some(true)), None);
        assert_eq!(switch.phase(), SwitchPhase::Converging);

        assert_eq!(rig.sample(&mut switch, false), Some(Correction::Pulse));
        assert_eq!(rig.sample(&mut switch, false), None);
        assert_eq!(rig.sample(&mut switch, true), None);

        assert_eq!(switch.phase(), SwitchPhase::Converged);
        assert_eq!(rig.presses(), 1);
        assert_eq!(rig.timers.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hold_capable_re_edges_an_already_held_output() {
        let mut rig = rig();
        rig.hold(true);
        let mut switch = FeedbackSwitch::new("lights", rig.button, "lights_on", BindingMode::HoldCapable);

        rig.request(&mut switch, Some(true));
        assert_eq!(rig.sample(&mut switch, false), Some(Correction::Pulse));
        assert_eq!(rig.sample(&mut switch, true), None);
        assert_eq!(rig.sample(&mut switch, true), None);
        assert_eq!(switch.phase(), SwitchPhase::Converged);
    }

    #[tokio::test(start_paused = true)]
    async fn hold_capable_switches_a_released_output() {
        let mut rig = rig();
        let mut switch = FeedbackSwitch::new("lights", rig.button, "lights_on", BindingMode::HoldCapable);
        assert_eq!(rig.sample(&mut switch, false), None);
        assert_eq!(rig.request(&mut switch, Some(true)), Some(Correction::Hold(true)));
        assert!(rig.timers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn toggle_resolves_against_the_observed_flag() {
        let mut rig = rig();
        let mut switch = FeedbackSwitch::new("scoop", rig.button, "cargo_scoop", BindingMode::ToggleOnly);
        rig.sample(&mut switch, true);
        assert_eq!(rig.request(&mut switch, None), Some(Correction::Pulse));
        assert_eq!(switch.requested(), Some(false));

        // The app toggled on its own, back to the requested state.
        rig.sample(&mut switch, false);
        assert_eq!(switch.phase(), SwitchPhase::Converged);
        assert_eq!(rig.request(&mut switch, Some(false)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn external_change_after_convergence_is_corrected() {
        let mut rig = rig();
        let mut switch = FeedbackSwitch::new("gear", rig.button, "gear_down", BindingMode::ToggleOnly);
        rig.sample(&mut switch, false);
        rig.request(&mut switch, Some(false));
        assert_eq!(switch.phase(), SwitchPhase::Converged);
        assert_eq!(rig.sample(&mut switch, true), Some(Correction::Pulse));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_write_keeps_the_request_and_retries_on_next_sample() {
        let mut rig = rig();
        let mut switch = FeedbackSwitch::new("gear", rig.button, "gear_down", BindingMode::ToggleOnly);
        rig.request(&mut switch, Some(true));

        rig.hub.reject_writes(true);
        let button = rig
            .registry
            .control_mut(rig.button)
            .and_then(|c| c.as_output_button_mut())
            .unwrap();
        let result = switch.on_observed(false, button, &mut rig.timers);
        assert!(matches!(result, Err(EngineError::OutputWrite { .. })));
        assert_eq!(switch.requested(), Some(true));

        rig.hub.reject_writes(false);
        assert_eq!(rig.sample(&mut switch, false), Some(Correction::Pulse));
    }
}
