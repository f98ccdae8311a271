//! # Riello Protocol Constants and Types
//!
//! Core definitions shared by the GPSER (ASCII, STX/ETX delimited) and
//! SENTRY (fixed-length binary) protocol families.

use bytes::Bytes;
use serde::Serialize;

/// GPSER frame start byte
pub const STX: u8 = 0x02;

/// GPSER frame end byte
pub const ETX: u8 = 0x03;

/// Value found at [`GPSER_NAK_OFFSET`] when the device rejects a command
pub const NAK: u8 = 0x15;

/// Offset of the NAK marker inside a GPSER reply (first opcode byte)
pub const GPSER_NAK_OFFSET: usize = 3;

/// Fixed 3-byte header of every GPSER command
pub const GPSER_HEADER: [u8; 3] = [STX, 0x20, 0x22];

/// Header of a GPSER reply (addresses swapped; the byte after STX is above 0x20)
pub const GPSER_REPLY_HEADER: [u8; 3] = [STX, 0x22, 0x20];

/// Offset added to a 4-bit value to form one nibble character
pub const NIBBLE_OFFSET: u8 = 0x30;

/// Size of the trailing checksum + ETX in a GPSER frame
pub const GPSER_TRAILER_LEN: usize = 5;

/// First payload byte of a GPSER reply (after header, opcode and length)
pub const GPSER_DATA_OFFSET: usize = 7;

/// Declared reply lengths of the GPSER commands
pub const LENGTH_GI: usize = 68;
pub const LENGTH_GN: usize = 34;
pub const LENGTH_RS_MM: usize = 42;
pub const LENGTH_RS_TM: usize = 48;
pub const LENGTH_RS_TT: usize = 64;
pub const LENGTH_RE: usize = 70;
pub const LENGTH_RC: usize = 56;
pub const LENGTH_DEF: usize = 12;

/// SENTRY reply lengths (second byte of the reply)
pub const SENTRY_SHORT_FRAME_LEN: u8 = 103;
pub const SENTRY_LONG_FRAME_LEN: u8 = 164;

/// SENTRY opcode for every control command (and the EXT176 poll)
pub const SENTRY_COMMAND_OPCODE: u8 = 176;

/// Upper bound on a reassembled frame
pub const MAX_FRAME_LEN: usize = 512;

/// Sentinel written by the device for an unknown battery runtime
pub const GPSER_RUNTIME_UNKNOWN: u16 = 0x0FFF;

/// Stale-value marker the decoder substitutes for [`GPSER_RUNTIME_UNKNOWN`]
pub const RUNTIME_UNKNOWN: u16 = 0xFFFF;

/// Number of packed status/alarm pairs in an "RC" reply
pub const STATUS_CODE_PAIRS: usize = 22;

/// Protocol family spoken by the attached UPS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProtocolFamily {
    /// ASCII frames, STX/ETX delimited, nibble-encoded checksum
    Gpser,
    /// Binary frames of 103 or 164 bytes, byte-sum checksum
    Sentry,
}

/// GPSER error control selected by the identification block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChecksumMode {
    /// Plain unsigned sum of every byte after STX
    #[default]
    Sum,
    /// Seeded nibble-mix CRC
    Crc,
}

impl ChecksumMode {
    /// Resolve the mode from identification byte 4 (`'0'` means sum)
    pub fn from_identification(byte: u8) -> Self {
        if byte.wrapping_sub(NIBBLE_OFFSET) != 0 {
            ChecksumMode::Crc
        } else {
            ChecksumMode::Sum
        }
    }
}

/// SENTRY telemetry layout negotiated from the identification reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ExtensionLevel {
    /// Basic 103-byte layout, percentages of nominal
    #[default]
    Only192,
    /// 103-byte layout with doubled bypass voltages
    Also240,
    /// 164-byte layout with absolute, pre-scaled measurements
    Ext176,
}

impl ExtensionLevel {
    /// Request byte that selects this layout
    pub fn opcode(self) -> u8 {
        match self {
            ExtensionLevel::Only192 => 192,
            ExtensionLevel::Also240 => 240,
            ExtensionLevel::Ext176 => SENTRY_COMMAND_OPCODE,
        }
    }

    /// Total reply length for this layout
    pub fn reply_len(self) -> usize {
        match self {
            ExtensionLevel::Ext176 => SENTRY_LONG_FRAME_LEN as usize,
            _ => SENTRY_SHORT_FRAME_LEN as usize,
        }
    }
}

/// Phase arrangement derived from identification byte 0
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PhaseLayout {
    pub input_monophase: bool,
    pub output_monophase: bool,
}

impl Default for PhaseLayout {
    fn default() -> Self {
        Self {
            input_monophase: true,
            output_monophase: true,
        }
    }
}

impl PhaseLayout {
    /// `'1'` mono/mono, `'2'` mono in, `'3'` mono out, anything else tri/tri
    pub fn from_identification(byte: u8) -> Self {
        Self {
            input_monophase: byte == b'1' || byte == b'2',
            output_monophase: byte == b'1' || byte == b'3',
        }
    }

    /// Declared length of the "RS" reply for this arrangement
    pub fn status_reply_len(&self) -> usize {
        if self.input_monophase {
            LENGTH_RS_MM
        } else if self.output_monophase {
            LENGTH_RS_TM
        } else {
            LENGTH_RS_TT
        }
    }
}

/// A completed frame as classified by the assembler
///
/// Both flags are reported independently; a frame may be a NAK and fail its
/// checksum at the same time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub family: ProtocolFamily,
    pub bytes: Bytes,
    pub nak: bool,
    pub bad_checksum: bool,
}

impl Frame {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

/// Outgoing command ready for the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    /// Operation name used in logs
    pub name: &'static str,
    /// Family of the reply the assembler should look for
    pub family: ProtocolFamily,
    /// Error control used to verify the reply
    pub checksum: ChecksumMode,
    pub bytes: Vec<u8>,
}

/// Test one bit of a little-endian bit array starting at `bytes[0]`
///
/// Out-of-range indices read as clear.
pub fn test_bit(bytes: &[u8], index: usize) -> bool {
    bytes
        .get(index / 8)
        .map(|byte| byte & (1 << (index % 8)) != 0)
        .unwrap_or(false)
}

/// Encode a 16-bit value as four nibble characters, high nibble first
///
/// Characters run from `'0'` to `'?'`; they are not clamped to decimal digits.
pub fn encode_nibbles(value: u16) -> [u8; 4] {
    [
        ((value >> 12) & 0x0F) as u8 + NIBBLE_OFFSET,
        ((value >> 8) & 0x0F) as u8 + NIBBLE_OFFSET,
        ((value >> 4) & 0x0F) as u8 + NIBBLE_OFFSET,
        (value & 0x0F) as u8 + NIBBLE_OFFSET,
    ]
}

/// Decode a run of nibble characters, high nibble first
pub fn decode_nibbles(chars: &[u8]) -> u32 {
    chars.iter().fold(0u32, |acc, &c| {
        (acc << 4) | u32::from(c.wrapping_sub(NIBBLE_OFFSET) & 0x0F)
    })
}

/// Status and identification data decoded from the UPS
///
/// Units follow the device: voltages in V, frequencies in 0.1 Hz, battery
/// voltage in 0.1 V, runtime in minutes, power in VA/W.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TelemetrySnapshot {
    pub sw_version: u16,
    pub model: u16,

    pub uinp1: u16,
    pub uinp2: u16,
    pub uinp3: u16,
    pub iinp1: u16,
    pub iinp2: u16,
    pub iinp3: u16,
    pub finp: u16,

    pub uout1: u16,
    pub uout2: u16,
    pub uout3: u16,
    pub iout1: u16,
    pub iout2: u16,
    pub iout3: u16,
    pub pout1: u16,
    pub pout2: u16,
    pub pout3: u16,
    pub ipout1: u16,
    pub ipout2: u16,
    pub ipout3: u16,
    pub fout: u16,

    pub bat_time: u16,
    pub bat_cap: u16,
    pub ubat: u16,
    pub ibat: u16,

    pub tsystem: u16,
    pub nom_bat_cap: u16,

    pub ubypass1: u16,
    pub ubypass2: u16,
    pub ubypass3: u16,
    pub fbypass: u16,
    pub lock_ups: bool,

    /// Raw 5-byte status bitmap ("RS" reply or synthesized for SENTRY)
    pub status_code: [u8; 5],
    /// Unpacked "RC" alarm/status pairs
    pub status_code_table: Vec<u8>,

    pub identification: String,
    pub model_name: String,
    pub version: String,
    #[serde(skip)]
    pub identif_bytes: [u8; 12],

    pub nom_power_va: u32,
    pub nom_power_w: u32,
    pub nom_ubat: u16,
    pub num_bat: u16,
    pub nominal_uout: u16,
    pub nom_fout: u16,

    pub boost: bool,
    pub buck: bool,

    pub pout1_va: u32,
    pub pout2_va: u32,
    pub pout3_va: u32,
    pub pout1_w: u32,
    pub pout2_w: u32,
    pub pout3_w: u32,
}

/// UPS conditions read from the status bitmap
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusFlags {
    pub on_battery: bool,
    pub low_battery: bool,
    pub standby: bool,
    pub bypass: bool,
    pub overload: bool,
    pub buck: bool,
    pub boost: bool,
    pub replace_battery: bool,
    pub charging: bool,
}

impl StatusFlags {
    /// Interpret a 5-byte status bitmap
    pub fn from_status_code(code: &[u8; 5]) -> Self {
        let on_battery = test_bit(&code[0..], 1);
        Self {
            on_battery,
            low_battery: on_battery && test_bit(&code[0..], 0),
            standby: !test_bit(&code[0..], 3),
            bypass: test_bit(&code[1..], 3),
            overload: test_bit(&code[4..], 2),
            buck: test_bit(&code[1..], 0),
            boost: test_bit(&code[1..], 1),
            replace_battery: test_bit(&code[2..], 0),
            charging: test_bit(&code[2..], 2),
        }
    }

    /// Status word tokens in publishing order
    pub fn tokens(&self) -> Vec<&'static str> {
        let mut tokens = Vec::with_capacity(4);
        tokens.push(if self.on_battery { "OB" } else { "OL" });
        if self.low_battery {
            tokens.push("LB");
        }
        if self.standby {
            tokens.push("OFF");
        }
        if self.bypass {
            tokens.push("BYPASS");
        }
        if self.overload {
            tokens.push("OVER");
        }
        if self.buck {
            tokens.push("TRIM");
        }
        if self.boost {
            tokens.push("BOOST");
        }
        if self.replace_battery {
            tokens.push("RB");
        }
        if self.charging {
            tokens.push("CHRG");
        }
        tokens
    }
}

impl TelemetrySnapshot {
    pub fn status_flags(&self) -> StatusFlags {
        StatusFlags::from_status_code(&self.status_code)
    }
}
