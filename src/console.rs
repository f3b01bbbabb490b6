//! Line commands on stdin
//!
//! Stands in for the telemetry reader and, with the loopback backend, for physical
//! devices:
//!
//! ```text
//! flag <name> on|off
//! flags <hex status word>
//! press <device> <idx>
//! release <device> <idx>
//! axis <device> <idx> <value>
//! ```
//!
//! Device names may contain spaces, the numeric arguments are always the last ones.

use crate::feedback::{FlagBank, FlagSample, TelemetrySender};
use crate::platform::loopback::Injector;
use std::io::BufRead;
use std::str::FromStr;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConsoleError {
    #[error("Unknown command '{0}'")]
    Unknown(String),

    #[error("Usage: {0}")]
    Usage(&'static str),

    #[error("Invalid number '{0}'")]
    InvalidNumber(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Flag { name: String, state: bool },
    Flags(u64),
    Press { device: String, index: u8 },
    Release { device: String, index: u8 },
    Axis { device: String, index: u8, value: f64 },
}

fn number<T: FromStr>(token: &str) -> Result<T, ConsoleError> {
    token
        .parse()
        .map_err(|_| ConsoleError::InvalidNumber(token.to_string()))
}

impl FromStr for ConsoleCommand {
    type Err = ConsoleError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some((&command, args)) = tokens.split_first() else {
            return Err(ConsoleError::Usage("flag|flags|press|release|axis ..."));
        };
        match command {
            "flag" => match args {
                [name, "on"] => Ok(ConsoleCommand::Flag {
                    name: name.to_string(),
                    state: true,
                }),
                [name, "off"] => Ok(ConsoleCommand::Flag {
                    name: name.to_string(),
                    state: false,
                }),
                _ => Err(ConsoleError::Usage("flag <name> on|off")),
            },
            "flags" => match args {
                [word] => {
                    let digits = word.trim_start_matches("0x").trim_start_matches("0X");
                    u64::from_str_radix(digits, 16)
                        .map(ConsoleCommand::Flags)
                        .map_err(|_| ConsoleError::InvalidNumber(word.to_string()))
                }
                _ => Err(ConsoleError::Usage("flags <hex>")),
            },
            "press" | "release" => match args {
                [device @ .., index] if !device.is_empty() => {
                    let device = device.join(" ");
                    let index = number(index)?;
                    Ok(if command == "press" {
                        ConsoleCommand::Press { device, index }
                    } else {
                        ConsoleCommand::Release { device, index }
                    })
                }
                _ => Err(ConsoleError::Usage("press|release <device> <idx>")),
            },
            "axis" => match args {
                [device @ .., index, value] if !device.is_empty() => Ok(ConsoleCommand::Axis {
                    device: device.join(" "),
                    index: number(index)?,
                    value: number(value)?,
                }),
                _ => Err(ConsoleError::Usage("axis <device> <idx> <value>")),
            },
            other => Err(ConsoleError::Unknown(other.to_string())),
        }
    }
}

pub struct Console {
    flags: FlagBank,
    telemetry: TelemetrySender,
    injector: Injector,
}

impl Console {
    pub fn new(flags: FlagBank, telemetry: TelemetrySender, injector: Injector) -> Self {
        Self {
            flags,
            telemetry,
            injector,
        }
    }

    /// Turn a command into telemetry samples. Injections are performed right away.
    pub fn execute(&mut self, command: ConsoleCommand) -> Vec<FlagSample> {
        match command {
            ConsoleCommand::Flag { name, state } => {
                self.flags.set(&name, state).into_iter().collect()
            }
            ConsoleCommand::Flags(word) => self.flags.apply(word),
            ConsoleCommand::Press { device, index } => {
                self.injector.button(&device, index, true);
                Vec::new()
            }
            ConsoleCommand::Release { device, index } => {
                self.injector.button(&device, index, false);
                Vec::new()
            }
            ConsoleCommand::Axis {
                device,
                index,
                value,
            } => {
                self.injector.axis(&device, index, value);
                Vec::new()
            }
        }
    }

    /// Read stdin until it closes or a shutdown is requested.
    ///
    /// Lines are read on a detached thread, a blocked read must not hold up the runtime
    /// on exit.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Console ready, type 'flag <name> on|off' or 'press <device> <idx>'");
        let (line_tx, mut lines) = mpsc::channel(16);
        let reader = std::thread::Builder::new()
            .name("console".into())
            .spawn(move || {
                for line in std::io::stdin().lock().lines() {
                    match line {
                        Ok(line) => {
                            if line_tx.blocking_send(line).is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            warn!("Failed to read console input: {}", e);
                            return;
                        }
                    }
                }
                debug!("Console input closed");
            });
        if let Err(e) = reader {
            warn!("Failed to spawn console reader: {}", e);
            return;
        }

        loop {
            let line = tokio::select! {
                line = lines.recv() => line,
                _ = shutdown.changed() => break,
            };
            let Some(line) = line else {
                break;
            };
            if line.trim().is_empty() {
                continue;
            }
            match line.parse::<ConsoleCommand>() {
                Ok(command) => {
                    for sample in self.execute(command) {
                        if !self.telemetry.send(sample).await {
                            return;
                        }
                    }
                }
                Err(e) => warn!("{}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::loopback::{LoopbackHub, LoopbackLayout};
    use std::collections::BTreeMap;

    #[test]
    fn commands_parse_with_spaced_device_names() {
        assert_eq!(
            "press LEFT VPC Stick 4".parse::<ConsoleCommand>(),
            Ok(ConsoleCommand::Press {
                device: "LEFT VPC Stick".into(),
                index: 4
            })
        );
        assert_eq!(
            "axis Throttle 1 -0.5".parse::<ConsoleCommand>(),
            Ok(ConsoleCommand::Axis {
                device: "Throttle".into(),
                index: 1,
                value: -0.5
            })
        );
        assert_eq!(
            "flag lights_on off".parse::<ConsoleCommand>(),
            Ok(ConsoleCommand::Flag {
                name: "lights_on".into(),
                state: false
            })
        );
        assert_eq!("flags 0x104".parse::<ConsoleCommand>(), Ok(ConsoleCommand::Flags(0x104)));
    }

    #[test]
    fn malformed_commands_are_reported() {
        assert_eq!(
            "warp 9".parse::<ConsoleCommand>(),
            Err(ConsoleError::Unknown("warp".into()))
        );
        assert!(matches!(
            "press 4".parse::<ConsoleCommand>(),
            Err(ConsoleError::Usage(_))
        ));
        assert_eq!(
            "release Stick x".parse::<ConsoleCommand>(),
            Err(ConsoleError::InvalidNumber("x".into()))
        );
        assert!("flag lights_on maybe".parse::<ConsoleCommand>().is_err());
    }

    #[test]
    fn flag_commands_produce_changes_only() {
        let mut bits = BTreeMap::new();
        bits.insert("lights_on".to_string(), 8);
        let hub = LoopbackHub::new(&LoopbackLayout::default());
        let (telemetry, _rx) = TelemetrySender::channel(4);
        let mut console = Console::new(FlagBank::new(&bits), telemetry, hub.injector());

        let on = ConsoleCommand::Flag {
            name: "lights_on".into(),
            state: true,
        };
        assert_eq!(console.execute(on.clone()).len(), 1);
        assert!(console.execute(on).is_empty());
        assert_eq!(console.execute(ConsoleCommand::Flags(0)).len(), 1);
    }
}
