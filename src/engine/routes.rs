//! Subscribers of control notifications.

use crate::devices::channel::{ChannelKind, ControlId};
use crate::devices::controls::{ControlEvent, Notification};
use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Index of a feedback switch inside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SwitchId(pub usize);

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Pressed,
    Released,
    Switched,
    Moved,
}

impl Trigger {
    pub fn matches(self, notification: &Notification) -> bool {
        matches!(
            (self, notification),
            (Trigger::Pressed, Notification::Pressed)
                | (Trigger::Released, Notification::Released)
                | (Trigger::Switched, Notification::Switched(_))
                | (Trigger::Moved, Notification::Moved(_))
        )
    }

    /// Kind of channel able to publish this trigger.
    pub fn source_kind(self) -> ChannelKind {
        match self {
            Trigger::Moved => ChannelKind::Axis,
            _ => ChannelKind::Button,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    SwitchOn,
    SwitchOff,
    Toggle,
    /// Hold the level carried by the notification.
    Follow,
    Pulse,
    PulseOnOff,
    PulseOffOn,
    /// Axis passthrough.
    Move,
}

/// Write resolved from a command and the notification that triggered it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Action {
    Switch(Option<bool>),
    Pulse(Option<bool>),
    Move(f64),
}

impl Command {
    pub fn is_pulse(self) -> bool {
        matches!(self, Command::Pulse | Command::PulseOnOff | Command::PulseOffOn)
    }

    pub fn action(self, notification: &Notification) -> Option<Action> {
        match (self, *notification) {
            (Command::SwitchOn, _) => Some(Action::Switch(Some(true))),
            (Command::SwitchOff, _) => Some(Action::Switch(Some(false))),
            (Command::Toggle, _) => Some(Action::Switch(None)),
            (Command::Follow, Notification::Pressed) => Some(Action::Switch(Some(true))),
            (Command::Follow, Notification::Released) => Some(Action::Switch(Some(false))),
            (Command::Follow, Notification::Switched(state)) => Some(Action::Switch(Some(state))),
            (Command::Follow, Notification::Moved(_)) => None,
            (Command::Pulse, _) => Some(Action::Pulse(None)),
            (Command::PulseOnOff, _) => Some(Action::Pulse(Some(true))),
            (Command::PulseOffOn, _) => Some(Action::Pulse(Some(false))),
            (Command::Move, Notification::Moved(value)) => Some(Action::Move(value)),
            (Command::Move, _) => None,
        }
    }
}

/// Logical output a route writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Axis(ControlId),
    Button(ControlId),
    Switch(SwitchId),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Route {
    pub trigger: Trigger,
    pub command: Command,
    pub target: Target,
}

impl Route {
    /// Reject trigger, command and target combinations that can never write anything.
    pub fn new(trigger: Trigger, command: Command, target: Target) -> Result<Self, EngineError> {
        match (trigger, command, target) {
            (Trigger::Moved, Command::Move, Target::Axis(_)) => {}
            (Trigger::Moved, _, _) | (_, Command::Move, _) => {
                return Err(EngineError::Binding(format!(
                    "{:?} cannot drive {:?}, axis moves only pass through to output axes",
                    trigger, command
                )))
            }
            (_, _, Target::Axis(_)) => {
                return Err(EngineError::Binding(format!(
                    "{:?} needs a button target, not an axis",
                    command
                )))
            }
            (_, command, Target::Switch(_)) if command.is_pulse() => {
                return Err(EngineError::Binding(format!(
                    "{:?} on a feedback switch would bypass reconciliation",
                    command
                )))
            }
            _ => {}
        }
        Ok(Self {
            trigger,
            command,
            target,
        })
    }

    pub fn action(&self, notification: &Notification) -> Option<Action> {
        if self.trigger.matches(notification) {
            self.command.action(notification)
        } else {
            None
        }
    }
}

pub enum Subscriber {
    Route(Route),
    Channel(mpsc::UnboundedSender<ControlEvent>),
}
