//! # Instant Commands
//!
//! Names accepted by [`UpsDriver::instcmd`](super::UpsDriver::instcmd), the
//! device state each one is accepted in, and the frames it sends.

use crate::riello::encoder::{GpserCommand, SentryCommand};
use crate::riello::protocol::{ChecksumMode, CommandFrame, ProtocolFamily};

/// Result of an instant command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstcmdStatus {
    Handled,
    Failed,
    Unknown,
}

/// Delays used by the delayed variants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandDelays {
    /// Seconds before the output turns off
    pub shutdown: u16,
    /// Minutes before the output comes back
    pub reboot: u16,
}

impl Default for CommandDelays {
    fn default() -> Self {
        Self {
            shutdown: 20,
            reboot: 0,
        }
    }
}

/// Supported instant commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstantCommand {
    LoadOff,
    LoadOffDelay,
    LoadOn,
    LoadOnDelay,
    ShutdownReturn,
    ShutdownStop,
    TestPanelStart,
    TestBatteryStart,
}

impl InstantCommand {
    pub const ALL: [InstantCommand; 8] = [
        InstantCommand::LoadOff,
        InstantCommand::LoadOn,
        InstantCommand::LoadOffDelay,
        InstantCommand::LoadOnDelay,
        InstantCommand::ShutdownReturn,
        InstantCommand::ShutdownStop,
        InstantCommand::TestBatteryStart,
        InstantCommand::TestPanelStart,
    ];

    /// Case-insensitive lookup
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|cmd| cmd.name().eq_ignore_ascii_case(name))
    }

    pub fn name(self) -> &'static str {
        match self {
            InstantCommand::LoadOff => "load.off",
            InstantCommand::LoadOffDelay => "load.off.delay",
            InstantCommand::LoadOn => "load.on",
            InstantCommand::LoadOnDelay => "load.on.delay",
            InstantCommand::ShutdownReturn => "shutdown.return",
            InstantCommand::ShutdownStop => "shutdown.stop",
            InstantCommand::TestPanelStart => "test.panel.start",
            InstantCommand::TestBatteryStart => "test.battery.start",
        }
    }

    /// Whether the family implements the command at all
    pub fn supported_by(self, family: ProtocolFamily) -> bool {
        !(self == InstantCommand::TestPanelStart && family == ProtocolFamily::Sentry)
    }

    /// Whether the command is accepted in the current power state
    ///
    /// Output switching is only offered on line; a shutdown with return only
    /// on battery.
    pub fn allowed(self, on_battery: bool) -> bool {
        match self {
            InstantCommand::LoadOff
            | InstantCommand::LoadOffDelay
            | InstantCommand::LoadOn
            | InstantCommand::LoadOnDelay => !on_battery,
            InstantCommand::ShutdownReturn => on_battery,
            InstantCommand::ShutdownStop
            | InstantCommand::TestPanelStart
            | InstantCommand::TestBatteryStart => true,
        }
    }

    /// Frames to send, in order
    ///
    /// Empty when the family does not implement the command.
    pub fn frames(
        self,
        family: ProtocolFamily,
        mode: ChecksumMode,
        delays: CommandDelays,
    ) -> Vec<CommandFrame> {
        match family {
            ProtocolFamily::Gpser => {
                let command = match self {
                    InstantCommand::LoadOff => GpserCommand::Shutdown { delay: 0 },
                    InstantCommand::LoadOffDelay | InstantCommand::ShutdownReturn => {
                        GpserCommand::Shutdown {
                            delay: delays.shutdown,
                        }
                    }
                    InstantCommand::LoadOn => GpserCommand::Restart { delay: 0 },
                    InstantCommand::LoadOnDelay => GpserCommand::Restart {
                        delay: delays.reboot,
                    },
                    InstantCommand::ShutdownStop => GpserCommand::CancelShutdown,
                    InstantCommand::TestPanelStart => GpserCommand::PanelTest,
                    InstantCommand::TestBatteryStart => GpserCommand::BatteryTest,
                };
                vec![command.encode(mode)]
            }
            ProtocolFamily::Sentry => {
                let commands = match self {
                    InstantCommand::LoadOff => vec![SentryCommand::Shutdown { delay: 0 }],
                    InstantCommand::LoadOffDelay | InstantCommand::ShutdownReturn => {
                        vec![SentryCommand::Shutdown {
                            delay: delays.shutdown,
                        }]
                    }
                    InstantCommand::LoadOn => vec![
                        SentryCommand::SetReboot { delay: 0 },
                        SentryCommand::Reboot { delay: 0 },
                    ],
                    InstantCommand::LoadOnDelay => vec![
                        SentryCommand::SetReboot {
                            delay: delays.reboot,
                        },
                        SentryCommand::Reboot {
                            delay: delays.reboot,
                        },
                    ],
                    InstantCommand::ShutdownStop => vec![SentryCommand::Cancel],
                    InstantCommand::TestBatteryStart => vec![SentryCommand::BatteryTest],
                    InstantCommand::TestPanelStart => Vec::new(),
                };
                commands.iter().map(SentryCommand::encode).collect()
            }
        }
    }
}
