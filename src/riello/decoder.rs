//! # Riello Response Decoder
//!
//! Maps verified reply frames onto a [`TelemetrySnapshot`].
//!
//! GPSER replies carry nibble-encoded fields starting after the 7-byte
//! header/opcode/length prefix. SENTRY replies are binary with little-endian
//! words at fixed offsets, scaled according to the negotiated
//! [`ExtensionLevel`].
//!
//! Every decoder checks the frame length it needs before reading, so a short
//! frame yields [`RielloError::InsufficientData`] instead of a panic.

use super::protocol::*;
use crate::error::{RielloError, Result};

/// Sequential reader over nibble-encoded GPSER fields
struct NibbleFields<'a> {
    frame: &'a [u8],
    pos: usize,
}

impl<'a> NibbleFields<'a> {
    fn new(frame: &'a [u8], pos: usize) -> Self {
        Self { frame, pos }
    }

    fn take(&mut self, digits: usize) -> u32 {
        let value = decode_nibbles(&self.frame[self.pos..self.pos + digits]);
        self.pos += digits;
        value
    }

    fn take_u16(&mut self, digits: usize) -> u16 {
        saturate(self.take(digits))
    }

    fn skip(&mut self, count: usize) {
        self.pos += count;
    }
}

fn saturate(value: u32) -> u16 {
    value.min(u32::from(u16::MAX)) as u16
}

fn le_word(frame: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([frame[offset], frame[offset + 1]])
}

/// Text up to the first NUL, trailing blanks removed
fn ascii_field(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim_end().to_string()
}

/// Require the frame to extend past `data_end` by a full checksum trailer
fn check_gpser(frame: &[u8], data_end: usize) -> Result<()> {
    RielloError::check_len(frame, data_end + GPSER_TRAILER_LEN)
}

/// Decode the "GI" identification block
///
/// Fills serial (16 chars), model (15 chars), firmware (12 chars), the
/// 12-byte identification block and the battery count.
///
/// # Errors
///
/// Returns `InsufficientData` when the frame is shorter than a GI reply.
pub fn decode_identification(frame: &[u8], snap: &mut TelemetrySnapshot) -> Result<()> {
    check_gpser(frame, 63)?;

    snap.identification = ascii_field(&frame[7..23]);
    snap.model_name = ascii_field(&frame[23..38]);
    snap.version = ascii_field(&frame[39..51]);

    snap.identif_bytes.copy_from_slice(&frame[51..63]);
    snap.identif_bytes[11] = 0;
    snap.num_bat = u16::from(snap.identif_bytes[7].wrapping_sub(b'0'));

    Ok(())
}

/// Decode the "GN" nominal ratings
///
/// Power ratings are reported in hundredths unless the identification block
/// marks a mono/mono unit (`'1'`).
pub fn decode_nominal(frame: &[u8], snap: &mut TelemetrySnapshot) -> Result<()> {
    check_gpser(frame, GPSER_DATA_OFFSET + 22)?;

    let scaled = snap.identif_bytes[0] != b'1';
    let mut fields = NibbleFields::new(frame, GPSER_DATA_OFFSET);

    let mut va = fields.take(5);
    let mut w = fields.take(5);
    if scaled {
        va /= 100;
        w /= 100;
    }
    snap.nom_power_va = va;
    snap.nom_power_w = w;

    snap.nom_ubat = fields.take_u16(3);
    snap.nom_bat_cap = fields.take_u16(3);
    snap.nominal_uout = fields.take_u16(3);
    snap.nom_fout = fields.take_u16(3);

    Ok(())
}

/// Decode the "RS" status reply
///
/// # Arguments
///
/// * `frame` - Verified reply
/// * `declared_len` - Reply length expected for the phase layout (42, 48 or 64)
/// * `snap` - Snapshot to update
///
/// # Errors
///
/// Returns `InsufficientData` when the frame does not hold the fields the
/// declared length calls for.
pub fn decode_status(frame: &[u8], declared_len: usize, snap: &mut TelemetrySnapshot) -> Result<()> {
    const BASE_END: usize = GPSER_DATA_OFFSET + 36;
    const INPUT_PHASES_END: usize = BASE_END + 6;
    const OUTPUT_PHASES_END: usize = INPUT_PHASES_END + 16;

    let with_input_phases = declared_len > LENGTH_RS_MM;
    let with_output_phases = declared_len > LENGTH_RS_TM;

    let data_end = if with_output_phases {
        OUTPUT_PHASES_END
    } else if with_input_phases {
        INPUT_PHASES_END
    } else {
        BASE_END
    };
    check_gpser(frame, data_end)?;

    let mut fields = NibbleFields::new(frame, GPSER_DATA_OFFSET);

    snap.status_code.copy_from_slice(&frame[GPSER_DATA_OFFSET..GPSER_DATA_OFFSET + 5]);
    snap.boost = test_bit(&snap.status_code, 9);
    snap.buck = test_bit(&snap.status_code, 8);
    snap.lock_ups = test_bit(&snap.status_code, 2);
    fields.skip(5);

    snap.finp = fields.take_u16(3);
    snap.uinp1 = fields.take_u16(3);
    let fout = fields.take_u16(3);
    snap.fout = if test_bit(&snap.status_code, 3) { fout } else { 0 };
    snap.uout1 = fields.take_u16(3);
    snap.pout1 = fields.take_u16(2);
    snap.fbypass = fields.take_u16(3);
    snap.ubypass1 = fields.take_u16(3);
    snap.ubat = fields.take_u16(4);
    snap.bat_cap = fields.take_u16(2);
    snap.bat_time = match fields.take_u16(3) {
        GPSER_RUNTIME_UNKNOWN => RUNTIME_UNKNOWN,
        minutes => minutes,
    };
    snap.tsystem = fields.take_u16(2);

    if with_input_phases {
        snap.uinp2 = fields.take_u16(3);
        snap.uinp3 = fields.take_u16(3);
    } else {
        snap.uinp2 = 0;
        snap.uinp3 = 0;
    }

    if with_output_phases {
        snap.uout2 = fields.take_u16(3);
        snap.pout2 = fields.take_u16(2);
        snap.ubypass2 = fields.take_u16(3);
        snap.uout3 = fields.take_u16(3);
        snap.pout3 = fields.take_u16(2);
        snap.ubypass3 = fields.take_u16(3);
    } else {
        snap.uout2 = 0;
        snap.pout2 = 0;
        snap.ubypass2 = 0;
        snap.uout3 = 0;
        snap.pout3 = 0;
        snap.ubypass3 = 0;
    }

    Ok(())
}

/// Decode the "RE" extended status reply
///
/// Always three phases wide. Input currents are not reported by this layout
/// and are marked unknown.
pub fn decode_extended(frame: &[u8], snap: &mut TelemetrySnapshot) -> Result<()> {
    const DATA_START: usize = 23;
    check_gpser(frame, DATA_START + 42)?;

    snap.iinp1 = RUNTIME_UNKNOWN;
    snap.iinp2 = RUNTIME_UNKNOWN;
    snap.iinp3 = RUNTIME_UNKNOWN;

    let mut fields = NibbleFields::new(frame, DATA_START);
    snap.iout1 = fields.take_u16(4);
    snap.iout2 = fields.take_u16(4);
    snap.iout3 = fields.take_u16(4);

    snap.pout1_w = fields.take(5);
    snap.pout2_w = fields.take(5);
    snap.pout3_w = fields.take(5);
    snap.pout1_va = fields.take(5);
    snap.pout2_va = fields.take(5);
    snap.pout3_va = fields.take(5);

    Ok(())
}

/// Decode the "RC" status-code table (22 packed pairs)
pub fn decode_status_codes(frame: &[u8], snap: &mut TelemetrySnapshot) -> Result<()> {
    check_gpser(frame, GPSER_DATA_OFFSET + STATUS_CODE_PAIRS * 2)?;

    snap.status_code_table = frame[GPSER_DATA_OFFSET..GPSER_DATA_OFFSET + STATUS_CODE_PAIRS * 2]
        .chunks_exact(2)
        .map(|pair| (pair[0].wrapping_sub(NIBBLE_OFFSET) << 4) | pair[1].wrapping_sub(NIBBLE_OFFSET))
        .collect();

    Ok(())
}

/// Model code with the three-phase offset removed
fn sentry_model_base(model: u16) -> u16 {
    if model < 3000 {
        model
    } else {
        model - 3000
    }
}

/// Choose the telemetry layout from a SENTRY identification reply
///
/// Models whose last digit is 4 or above support the extended layouts; bit 0
/// of byte 100 then selects EXT176 over ALSO240.
pub fn resolve_extension_level(frame: &[u8]) -> Result<ExtensionLevel> {
    RielloError::check_len(frame, SENTRY_SHORT_FRAME_LEN as usize)?;

    let model = sentry_model_base(le_word(frame, 2));
    let level = if model % 10 >= 4 {
        if frame[100] & 0x01 != 0 {
            ExtensionLevel::Ext176
        } else {
            ExtensionLevel::Also240
        }
    } else {
        ExtensionLevel::Only192
    };

    Ok(level)
}

/// Decode a SENTRY telemetry frame laid out per `level`
///
/// Besides measurements this fills the nominal power, a synthetic
/// identification block (so the phase layout can be derived the same way as
/// for GPSER) and a synthesized 5-byte status bitmap.
///
/// # Errors
///
/// Returns `InsufficientData` when the frame is shorter than `level` requires.
pub fn decode_sentry(
    frame: &[u8],
    level: ExtensionLevel,
    snap: &mut TelemetrySnapshot,
) -> Result<()> {
    RielloError::check_len(frame, level.reply_len())?;

    let b = |i: usize| u32::from(frame[i]);
    let tenths = |i: usize| le_word(frame, i) / 10;

    snap.model = le_word(frame, 2);
    let three_phase = snap.model >= 3000;
    let model_base = u32::from(sentry_model_base(snap.model));
    snap.model_name = snap.model.to_string();

    let kva = model_base / 10;
    let kw = if frame[76] & 0x08 != 0 {
        kva * 1000 * 9 / 10 / 1000
    } else {
        kva * 1000 * 8 / 10 / 1000
    };
    snap.nom_power_va = kva * 1000;
    snap.nom_power_w = kw * 1000;

    snap.identif_bytes = [0; 12];
    snap.identif_bytes[0] = if three_phase { b'4' } else { b'3' };
    snap.identif_bytes[1] = b'3';
    snap.identif_bytes[6] = b'2';

    snap.sw_version = le_word(frame, 4);
    let v = snap.sw_version;
    snap.version = format!(
        "{}{}.{}{}",
        (v / 1000) % 10,
        (v / 100) % 10,
        (v / 10) % 10,
        v % 10
    );

    let pom = model_base * 100;
    snap.finp = le_word(frame, 41);

    if level == ExtensionLevel::Ext176 {
        snap.uinp1 = tenths(117);
        snap.uinp2 = tenths(119);
        snap.uinp3 = tenths(121);
        snap.iinp1 = tenths(123);
        snap.iinp2 = tenths(125);
        snap.iinp3 = tenths(127);

        snap.uout1 = tenths(135);
        snap.uout2 = tenths(137);
        snap.uout3 = tenths(139);
        snap.iout1 = tenths(141);
        snap.iout2 = tenths(143);
        snap.iout3 = tenths(145);
    } else {
        snap.uinp1 = saturate(b(35) * 230 / 100);
        snap.uinp2 = saturate(b(36) * 230 / 100);
        snap.uinp3 = saturate(b(37) * 230 / 100);
        snap.iinp1 = saturate(pom / 690 * b(38) / 100);
        snap.iinp2 = saturate(pom / 690 * b(39) / 100);
        snap.iinp3 = saturate(pom / 690 * b(40) / 100);

        let scale = if frame[79] & 0x80 != 0 { 2 } else { 1 };
        snap.uout1 = saturate(b(59) * scale);
        snap.uout2 = saturate(b(60) * scale);
        snap.uout3 = saturate(b(61) * scale);

        let divisor = b(73);
        if divisor != 0 {
            let per_unit = pom / divisor;
            let iout1 = per_unit * b(62) / 100;
            snap.iout1 = saturate(if three_phase { iout1 / 3 } else { iout1 });
            snap.iout2 = saturate(per_unit * b(63) / 100 / 3);
            snap.iout3 = saturate(per_unit * b(64) / 100 / 3);
        } else {
            snap.iout1 = 0;
            snap.iout2 = 0;
            snap.iout3 = 0;
        }

        if snap.model & 0x0007 < 4 {
            snap.iout1 = saturate(u32::from(snap.iout1) * 9 / 10);
            snap.iout2 = saturate(u32::from(snap.iout2) * 9 / 10);
            snap.iout3 = saturate(u32::from(snap.iout3) * 9 / 10);
        }
    }

    snap.pout1 = u16::from(frame[62]);
    snap.pout2 = u16::from(frame[63]);
    snap.pout3 = u16::from(frame[64]);
    snap.ipout1 = u16::from(frame[65]) * 3;
    if three_phase {
        snap.ipout2 = u16::from(frame[66]) * 3;
        snap.ipout3 = u16::from(frame[67]) * 3;
    } else {
        snap.ipout2 = 0;
        snap.ipout3 = 0;
    }

    snap.fout = le_word(frame, 68);
    snap.bat_time = le_word(frame, 6);
    snap.bat_cap = u16::from(frame[8]);

    let ubat = match level {
        ExtensionLevel::Also240 | ExtensionLevel::Ext176 if frame[100] & 0x80 == 0 => {
            u16::from(frame[43].min(frame[44])) * 2
        }
        _ => le_word(frame, 43),
    };
    snap.ubat = ubat.saturating_mul(10);

    let ibat = le_word(frame, 45);
    snap.ibat = if frame[47] == 0 {
        ibat.saturating_mul(10)
    } else {
        ibat
    };

    snap.tsystem = u16::from(frame[48]);
    snap.nom_bat_cap = le_word(frame, 74);

    match level {
        ExtensionLevel::Ext176 => {
            snap.ubypass1 = tenths(129);
            snap.ubypass2 = tenths(131);
            snap.ubypass3 = tenths(133);
        }
        ExtensionLevel::Also240 => {
            snap.ubypass1 = u16::from(frame[51]) * 2;
            snap.ubypass2 = u16::from(frame[53]) * 2;
            snap.ubypass3 = u16::from(frame[55]) * 2;
        }
        ExtensionLevel::Only192 => {
            snap.ubypass1 = le_word(frame, 51);
            snap.ubypass2 = le_word(frame, 53);
            snap.ubypass3 = le_word(frame, 55);
        }
    }
    snap.fbypass = le_word(frame, 57);

    snap.status_code = sentry_status_code(frame);

    Ok(())
}

/// Build a GPSER-style status bitmap from scattered SENTRY flags
fn sentry_status_code(frame: &[u8]) -> [u8; 5] {
    let alarms = frame[31];
    let mut code = [0x08, 0x00, 0x00, 0x00, 0x00];

    if alarms & 0x80 != 0 {
        code[4] |= 0x04;
    }

    let bypass_requested = alarms & 0x02 != 0
        || [0, 12, 13, 14].iter().any(|&bit| test_bit(&frame[32..], bit));
    if bypass_requested && frame[34] & 0x08 == 0 {
        code[1] |= 0x08;
    }

    if alarms & 0x08 != 0 {
        code[0] |= 0x02;
        if alarms & 0x10 != 0 {
            code[0] |= 0x01;
        }
    }

    if frame[22] & 0x02 != 0 || frame[34] & 0x0C != 0 {
        code[0] &= 0xF7;
    }

    if alarms & 0x40 != 0 {
        code[2] |= 0x01;
    }

    code
}
