//! # Riello Checksum Implementation
//!
//! Error control for both protocol families.
//!
//! **SENTRY**: 16-bit unsigned byte sum, little-endian at the frame tail.
//! **GPSER CRC**: seeded with `0x554D`, nibble-mix per byte after STX.
//! **GPSER sum**: 16-bit unsigned sum of every byte after STX.
//!
//! GPSER values are carried as four nibble characters before the ETX.

use super::protocol::{
    decode_nibbles, encode_nibbles, ChecksumMode, ProtocolFamily, GPSER_TRAILER_LEN,
};

/// Initial accumulator of the GPSER CRC
const GPSER_CRC_SEED: u16 = 0x554D;

/// A 101-byte SENTRY span only sums its first 100 bytes
const SENTRY_SHORT_SPAN: usize = 101;
const SENTRY_SHORT_SUMMED: usize = 100;

/// Calculate the checksum word over `bytes`
///
/// For GPSER the first byte (STX) is never included.
///
/// # Examples
///
/// ```
/// use riello_ups::riello::crc::checksum;
/// use riello_ups::riello::protocol::{ChecksumMode, ProtocolFamily};
///
/// let word = checksum(ProtocolFamily::Gpser, b"\x02 \"GI00", ChecksumMode::Sum);
/// assert_eq!(word, 0x20 + 0x22 + u16::from(b'G') + u16::from(b'I') + 2 * u16::from(b'0'));
/// ```
pub fn checksum(family: ProtocolFamily, bytes: &[u8], mode: ChecksumMode) -> u16 {
    match family {
        ProtocolFamily::Sentry => {
            let span = if bytes.len() == SENTRY_SHORT_SPAN {
                &bytes[..SENTRY_SHORT_SUMMED]
            } else {
                bytes
            };
            byte_sum(span)
        }
        ProtocolFamily::Gpser => {
            let body = bytes.get(1..).unwrap_or(&[]);
            match mode {
                ChecksumMode::Crc => gpser_crc(body),
                ChecksumMode::Sum => byte_sum(body),
            }
        }
    }
}

/// GPSER CRC over the bytes following STX
fn gpser_crc(body: &[u8]) -> u16 {
    body.iter().fold(GPSER_CRC_SEED, |crc, &byte| {
        let mut mix = (crc ^ u16::from(byte)) & 0x00FF;
        mix = (mix ^ (mix << 4)) & 0x00FF;
        mix <<= 8;
        mix ^= mix << 3;
        mix ^= mix >> 4;
        (crc >> 8) ^ mix
    })
}

fn byte_sum(bytes: &[u8]) -> u16 {
    bytes
        .iter()
        .fold(0u16, |sum, &byte| sum.wrapping_add(u16::from(byte)))
}

/// Append the checksum of `frame` to its end
///
/// GPSER gets four nibble characters (the caller appends ETX), SENTRY gets a
/// little-endian word.
pub fn append_checksum(family: ProtocolFamily, frame: &mut Vec<u8>, mode: ChecksumMode) {
    let word = checksum(family, frame, mode);
    match family {
        ProtocolFamily::Gpser => frame.extend_from_slice(&encode_nibbles(word)),
        ProtocolFamily::Sentry => frame.extend_from_slice(&word.to_le_bytes()),
    }
}

/// Verify the checksum embedded at the tail of a complete frame
///
/// GPSER frames end in four checksum characters and ETX; SENTRY frames end in
/// a little-endian word. Frames too short to carry a checksum never verify.
pub fn verify_checksum(family: ProtocolFamily, frame: &[u8], mode: ChecksumMode) -> bool {
    match family {
        ProtocolFamily::Gpser => {
            if frame.len() < GPSER_TRAILER_LEN {
                return false;
            }
            let split = frame.len() - GPSER_TRAILER_LEN;
            let expected = checksum(family, &frame[..split], mode);
            let received = decode_nibbles(&frame[split..split + 4]) as u16;
            expected == received
        }
        ProtocolFamily::Sentry => {
            if frame.len() < 2 {
                return false;
            }
            let split = frame.len() - 2;
            let expected = checksum(family, &frame[..split], mode);
            let received = u16::from_le_bytes([frame[split], frame[split + 1]]);
            expected == received
        }
    }
}
