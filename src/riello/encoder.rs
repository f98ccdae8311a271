//! # Riello Command Encoder
//!
//! Builds outgoing GPSER and SENTRY command frames.
//!
//! GPSER layout:
//! ```text
//! 02 20 22 | opcode (2 ASCII) | param length (2 ASCII digits) | params | checksum (4 nibbles) | 03
//! ```
//!
//! SENTRY control layout:
//! ```text
//! B0 | sub-opcode | param lo | param hi | sum of the previous four bytes
//! ```

use super::crc::append_checksum;
use super::protocol::*;

/// Longest command any builder produces
pub const MAX_COMMAND_LEN: usize = 24;

/// Fixed parameter of the battery test ("005")
const BATTERY_TEST_PARAMS: &[u8] = b"005";

/// Sub-opcode of the EXT176 telemetry poll
const EXT176_REQUEST_SUB: u8 = 103;

/// GPSER operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpserCommand {
    /// "GI" identification block
    Identify,
    /// "GN" nominal ratings
    ReadNominal,
    /// "RS" status
    ReadStatus,
    /// "RE" extended per-phase status
    ReadExtended,
    /// "RC" status-code table
    ReadStatusCodes,
    /// "CS" shut the output off after `delay` seconds
    Shutdown { delay: u16 },
    /// "CR" restore the output after `delay` minutes
    Restart { delay: u16 },
    /// "CD" cancel a pending shutdown
    CancelShutdown,
    /// "TP" front panel test
    PanelTest,
    /// "TB" battery test
    BatteryTest,
}

impl GpserCommand {
    /// Two-letter ASCII opcode
    pub fn opcode(&self) -> [u8; 2] {
        match self {
            GpserCommand::Identify => *b"GI",
            GpserCommand::ReadNominal => *b"GN",
            GpserCommand::ReadStatus => *b"RS",
            GpserCommand::ReadExtended => *b"RE",
            GpserCommand::ReadStatusCodes => *b"RC",
            GpserCommand::Shutdown { .. } => *b"CS",
            GpserCommand::Restart { .. } => *b"CR",
            GpserCommand::CancelShutdown => *b"CD",
            GpserCommand::PanelTest => *b"TP",
            GpserCommand::BatteryTest => *b"TB",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            GpserCommand::Identify => "GI",
            GpserCommand::ReadNominal => "GN",
            GpserCommand::ReadStatus => "RS",
            GpserCommand::ReadExtended => "RE",
            GpserCommand::ReadStatusCodes => "RC",
            GpserCommand::Shutdown { .. } => "CS",
            GpserCommand::Restart { .. } => "CR",
            GpserCommand::CancelShutdown => "CD",
            GpserCommand::PanelTest => "TP",
            GpserCommand::BatteryTest => "TB",
        }
    }

    /// Parameter bytes that follow the length field
    pub fn params(&self) -> Vec<u8> {
        match *self {
            GpserCommand::Shutdown { delay } => encode_nibbles(delay).to_vec(),
            GpserCommand::Restart { delay } => {
                // Two delays: the first (always zero) is the shutdown delay
                let mut params = encode_nibbles(0).to_vec();
                params.extend_from_slice(&encode_nibbles(delay));
                params
            }
            GpserCommand::BatteryTest => BATTERY_TEST_PARAMS.to_vec(),
            _ => Vec::new(),
        }
    }

    /// Declared length of the device reply
    pub fn reply_len(&self, layout: PhaseLayout) -> usize {
        match self {
            GpserCommand::Identify => LENGTH_GI,
            GpserCommand::ReadNominal => LENGTH_GN,
            GpserCommand::ReadStatus => layout.status_reply_len(),
            GpserCommand::ReadExtended => LENGTH_RE,
            GpserCommand::ReadStatusCodes => LENGTH_RC,
            _ => LENGTH_DEF,
        }
    }

    /// Error control actually used on the wire
    ///
    /// Identification always runs in sum mode since the device's mode is
    /// only known once its reply is decoded.
    pub fn effective_mode(&self, mode: ChecksumMode) -> ChecksumMode {
        match self {
            GpserCommand::Identify => ChecksumMode::Sum,
            _ => mode,
        }
    }

    /// Build the complete frame
    ///
    /// # Arguments
    ///
    /// * `mode` - Error control negotiated with the device
    ///
    /// # Returns
    ///
    /// * `CommandFrame` - Header, opcode, length, params, checksum and ETX
    ///
    /// # Examples
    ///
    /// ```
    /// use riello_ups::riello::encoder::GpserCommand;
    /// use riello_ups::riello::protocol::ChecksumMode;
    ///
    /// let frame = GpserCommand::ReadStatus.encode(ChecksumMode::Sum);
    /// assert_eq!(&frame.bytes[..7], b"\x02 \"RS00");
    /// assert_eq!(frame.bytes.len(), 12);
    /// ```
    pub fn encode(&self, mode: ChecksumMode) -> CommandFrame {
        let mode = self.effective_mode(mode);
        let params = self.params();

        let mut bytes = Vec::with_capacity(MAX_COMMAND_LEN);
        bytes.extend_from_slice(&GPSER_HEADER);
        bytes.extend_from_slice(&self.opcode());
        bytes.push(b'0' + (params.len() / 10) as u8);
        bytes.push(b'0' + (params.len() % 10) as u8);
        bytes.extend_from_slice(&params);
        append_checksum(ProtocolFamily::Gpser, &mut bytes, mode);
        bytes.push(ETX);

        CommandFrame {
            name: self.name(),
            family: ProtocolFamily::Gpser,
            checksum: mode,
            bytes,
        }
    }
}

/// SENTRY control sub-opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentryCommand {
    /// Identification request (single `0xC0` byte, 103-byte reply)
    Identify,
    /// Telemetry poll for the negotiated layout
    Request(ExtensionLevel),
    /// Shut the output off after `delay` seconds
    Shutdown { delay: u16 },
    /// Cancel a pending shutdown
    Cancel,
    /// Arm the restart delay (minutes)
    SetReboot { delay: u16 },
    /// Restart the output
    Reboot { delay: u16 },
    /// Battery test
    BatteryTest,
}

impl SentryCommand {
    pub fn name(&self) -> &'static str {
        match self {
            SentryCommand::Identify => "identify",
            SentryCommand::Request(_) => "request",
            SentryCommand::Shutdown { .. } => "shutdown",
            SentryCommand::Cancel => "cancel",
            SentryCommand::SetReboot { .. } => "set-reboot",
            SentryCommand::Reboot { .. } => "reboot",
            SentryCommand::BatteryTest => "battery-test",
        }
    }

    pub fn encode(&self) -> CommandFrame {
        let bytes = match *self {
            SentryCommand::Identify => vec![ExtensionLevel::Only192.opcode()],
            SentryCommand::Request(ExtensionLevel::Ext176) => {
                sentry_command(SENTRY_COMMAND_OPCODE, EXT176_REQUEST_SUB, 1).to_vec()
            }
            SentryCommand::Request(level) => vec![level.opcode()],
            SentryCommand::Shutdown { delay } => {
                sentry_command(SENTRY_COMMAND_OPCODE, 6, delay).to_vec()
            }
            SentryCommand::Cancel => sentry_command(SENTRY_COMMAND_OPCODE, 5, 0).to_vec(),
            SentryCommand::SetReboot { delay } => {
                sentry_command(SENTRY_COMMAND_OPCODE, 2, delay).to_vec()
            }
            SentryCommand::Reboot { delay } => {
                sentry_command(SENTRY_COMMAND_OPCODE, 1, delay).to_vec()
            }
            SentryCommand::BatteryTest => sentry_command(SENTRY_COMMAND_OPCODE, 4, 0).to_vec(),
        };

        CommandFrame {
            name: self.name(),
            family: ProtocolFamily::Sentry,
            checksum: ChecksumMode::Sum,
            bytes,
        }
    }

    /// True for the telemetry requests (a full frame is always expected back)
    pub fn expects_telemetry(&self) -> bool {
        matches!(self, SentryCommand::Identify | SentryCommand::Request(_))
    }
}

/// Build a 5-byte SENTRY frame
///
/// # Arguments
///
/// * `opcode` - First byte (176 for every control command)
/// * `sub` - Sub-opcode
/// * `param` - 16-bit parameter, sent little-endian
///
/// # Returns
///
/// * `[u8; 5]` - Frame with the wrapping byte sum in the last position
pub fn sentry_command(opcode: u8, sub: u8, param: u16) -> [u8; 5] {
    let [lo, hi] = param.to_le_bytes();
    let sum = opcode.wrapping_add(sub).wrapping_add(lo).wrapping_add(hi);
    [opcode, sub, lo, hi, sum]
}
