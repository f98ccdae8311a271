//! # Riello Frame Assembler
//!
//! Byte-at-a-time reassembly of GPSER and SENTRY frames.
//!
//! The assembler keeps a 6-byte trailing window of everything it has seen.
//! A start pattern in the window begins accumulation; ETX (GPSER) or the
//! declared byte count (SENTRY) completes it. A completed frame is checked for
//! NAK and checksum independently. The assembler has no timeout of its own:
//! the caller bounds how many bytes it feeds.

use bytes::BytesMut;
use tracing::debug;

use super::crc::verify_checksum;
use super::protocol::*;

const WINDOW_LEN: usize = 6;

/// Assembler state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblerState {
    /// Waiting for a start pattern
    Idle,
    /// Start seen, collecting bytes
    Accumulating,
    /// Terminating condition observed; flags are valid
    Complete,
}

/// Reassembles one frame from a raw byte stream
#[derive(Debug)]
pub struct FrameAssembler {
    family: ProtocolFamily,
    mode: ChecksumMode,
    window: [u8; WINDOW_LEN],
    buffer: BytesMut,
    expected_len: usize,
    state: AssemblerState,
    nak: bool,
    bad_checksum: bool,
}

impl FrameAssembler {
    pub fn new(family: ProtocolFamily, mode: ChecksumMode) -> Self {
        Self {
            family,
            mode,
            window: [0; WINDOW_LEN],
            buffer: BytesMut::with_capacity(MAX_FRAME_LEN),
            expected_len: 0,
            state: AssemblerState::Idle,
            nak: false,
            bad_checksum: false,
        }
    }

    /// Switch family and error control, then reset
    pub fn configure(&mut self, family: ProtocolFamily, mode: ChecksumMode) {
        self.family = family;
        self.mode = mode;
        self.reset();
    }

    /// Clear window, buffer and both flags; back to `Idle`
    pub fn reset(&mut self) {
        self.window = [0; WINDOW_LEN];
        self.buffer.clear();
        self.expected_len = 0;
        self.state = AssemblerState::Idle;
        self.nak = false;
        self.bad_checksum = false;
    }

    /// Consume one byte from the transport
    pub fn feed(&mut self, byte: u8) -> AssemblerState {
        if self.state == AssemblerState::Complete {
            return self.state;
        }

        self.window.copy_within(1.., 0);
        self.window[WINDOW_LEN - 1] = byte;

        if self.state == AssemblerState::Idle {
            if let Some(expected_len) = self.match_start() {
                debug!(
                    "Header detected: window {:02X?} ({:?})",
                    self.window, self.family
                );
                self.state = AssemblerState::Accumulating;
                self.expected_len = expected_len;
                self.buffer.clear();
                self.buffer.extend_from_slice(&[self.window[WINDOW_LEN - 2]]);
            }
        }

        if self.state == AssemblerState::Accumulating {
            if self.buffer.len() < MAX_FRAME_LEN {
                self.buffer.extend_from_slice(&[byte]);
            }

            if self.match_end(byte) {
                self.complete();
            }
        }

        self.state
    }

    /// Feed a run of bytes, stopping early once a frame completes
    pub fn feed_all(&mut self, bytes: &[u8]) -> AssemblerState {
        for &byte in bytes {
            if self.feed(byte) == AssemblerState::Complete {
                break;
            }
        }
        self.state
    }

    /// Start pattern check; returns the expected total length (0 = ETX bound)
    fn match_start(&self) -> Option<usize> {
        let previous = self.window[WINDOW_LEN - 2];
        let current = self.window[WINDOW_LEN - 1];

        match self.family {
            ProtocolFamily::Sentry => {
                if (previous >= 192 && current == SENTRY_SHORT_FRAME_LEN)
                    || (previous == SENTRY_COMMAND_OPCODE && current == SENTRY_LONG_FRAME_LEN)
                {
                    Some(current as usize)
                } else {
                    None
                }
            }
            ProtocolFamily::Gpser => {
                if self.buffer.is_empty() && current > 0x20 && previous == STX {
                    Some(0)
                } else {
                    None
                }
            }
        }
    }

    fn match_end(&self, byte: u8) -> bool {
        match self.family {
            ProtocolFamily::Sentry => self.buffer.len() >= self.expected_len,
            ProtocolFamily::Gpser => byte == ETX,
        }
    }

    fn complete(&mut self) {
        debug!("End detected: {} bytes", self.buffer.len());

        self.state = AssemblerState::Complete;
        self.window = [0; WINDOW_LEN];

        self.nak = self.family == ProtocolFamily::Gpser
            && self.buffer.get(GPSER_NAK_OFFSET) == Some(&NAK);
        self.bad_checksum = !verify_checksum(self.family, &self.buffer, self.mode);
    }

    pub fn state(&self) -> AssemblerState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == AssemblerState::Complete
    }

    /// Accumulating with no room left for the terminator
    pub fn is_full(&self) -> bool {
        self.state == AssemblerState::Accumulating && self.buffer.len() >= MAX_FRAME_LEN
    }

    pub fn is_nak(&self) -> bool {
        self.nak
    }

    pub fn has_bad_checksum(&self) -> bool {
        self.bad_checksum
    }

    /// Bytes collected so far
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    pub fn family(&self) -> ProtocolFamily {
        self.family
    }

    /// Hand over the completed frame, leaving the assembler reset
    pub fn take_frame(&mut self) -> Option<Frame> {
        if self.state != AssemblerState::Complete {
            return None;
        }
        let frame = Frame {
            family: self.family,
            bytes: self.buffer.split().freeze(),
            nak: self.nak,
            bad_checksum: self.bad_checksum,
        };
        self.reset();
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::riello::crc::append_checksum;

    fn gpser_reply(payload: &[u8], mode: ChecksumMode) -> Vec<u8> {
        let mut frame = GPSER_REPLY_HEADER.to_vec();
        frame.extend_from_slice(payload);
        append_checksum(ProtocolFamily::Gpser, &mut frame, mode);
        frame.push(ETX);
        frame
    }

    fn sentry_reply(len: u8, opcode: u8) -> Vec<u8> {
        let mut frame = vec![0u8; len as usize - 2];
        frame[0] = opcode;
        frame[1] = len;
        for (i, byte) in frame.iter_mut().enumerate().skip(2) {
            *byte = (i % 200) as u8 + 1;
        }
        append_checksum(ProtocolFamily::Sentry, &mut frame, ChecksumMode::Sum);
        frame
    }

    #[test]
    fn test_new_assembler_is_idle() {
        let asm = FrameAssembler::new(ProtocolFamily::Gpser, ChecksumMode::Sum);
        assert_eq!(asm.state(), AssemblerState::Idle);
        assert!(!asm.is_nak());
        assert!(!asm.has_bad_checksum());
    }

    #[test]
    fn test_gpser_frame_between_noise() {
        let frame = gpser_reply(b"RS001234", ChecksumMode::Sum);
        let mut stream = vec![0x00, 0x41, 0x20, 0x02, 0x10, 0xFF];
        stream.extend_from_slice(&frame);
        stream.extend_from_slice(&[0x02, 0x41, 0x03, 0x00]);

        let mut asm = FrameAssembler::new(ProtocolFamily::Gpser, ChecksumMode::Sum);
        for &byte in &stream {
            asm.feed(byte);
        }

        assert!(asm.is_complete());
        assert_eq!(asm.buffered(), frame.as_slice());
        assert!(!asm.has_bad_checksum());
        assert!(!asm.is_nak());
    }

    #[test]
    fn test_gpser_stx_followed_by_control_byte_does_not_start() {
        let mut asm = FrameAssembler::new(ProtocolFamily::Gpser, ChecksumMode::Sum);
        asm.feed(STX);
        assert_eq!(asm.feed(0x20), AssemblerState::Idle);
        assert_eq!(asm.feed(0x03), AssemblerState::Idle);
    }

    #[test]
    fn test_gpser_nak_with_good_checksum() {
        let mut payload = vec![NAK];
        payload.extend_from_slice(b"S00");
        let frame = gpser_reply(&payload, ChecksumMode::Crc);

        let mut asm = FrameAssembler::new(ProtocolFamily::Gpser, ChecksumMode::Crc);
        asm.feed_all(&frame);

        assert!(asm.is_complete());
        assert!(asm.is_nak());
        assert!(!asm.has_bad_checksum());
    }

    #[test]
    fn test_gpser_bad_checksum_without_nak() {
        let mut frame = gpser_reply(b"RS00", ChecksumMode::Crc);
        let tail = frame.len() - 2;
        frame[tail] = if frame[tail] == b'0' { b'1' } else { b'0' };

        let mut asm = FrameAssembler::new(ProtocolFamily::Gpser, ChecksumMode::Crc);
        asm.feed_all(&frame);

        assert!(asm.is_complete());
        assert!(!asm.is_nak());
        assert!(asm.has_bad_checksum());
    }

    #[test]
    fn test_gpser_nak_and_bad_checksum_both_reported() {
        // Short NAK reply shaped like the device sends it, no valid checksum
        let frame = [STX, 0x22, 0x20, NAK, ETX];

        let mut asm = FrameAssembler::new(ProtocolFamily::Gpser, ChecksumMode::Sum);
        asm.feed_all(&frame);

        assert!(asm.is_complete());
        assert!(asm.is_nak());
        assert!(asm.has_bad_checksum());
    }

    #[test]
    fn test_complete_ignores_further_bytes_until_reset() {
        let frame = gpser_reply(b"GN00", ChecksumMode::Sum);
        let mut asm = FrameAssembler::new(ProtocolFamily::Gpser, ChecksumMode::Sum);
        asm.feed_all(&frame);
        assert!(asm.is_complete());

        assert_eq!(asm.feed(STX), AssemblerState::Complete);
        assert_eq!(asm.feed(0x41), AssemblerState::Complete);
        assert_eq!(asm.buffered(), frame.as_slice());

        asm.reset();
        assert_eq!(asm.state(), AssemblerState::Idle);
        assert!(asm.buffered().is_empty());
    }

    #[test]
    fn test_reset_clears_flags() {
        let frame = [STX, 0x22, 0x20, NAK, ETX];
        let mut asm = FrameAssembler::new(ProtocolFamily::Gpser, ChecksumMode::Sum);
        asm.feed_all(&frame);
        assert!(asm.is_nak());

        asm.reset();
        assert!(!asm.is_nak());
        assert!(!asm.has_bad_checksum());
    }

    #[test]
    fn test_sentry_short_frame() {
        let frame = sentry_reply(103, 192);
        let mut stream = vec![0x00, 0x55];
        stream.extend_from_slice(&frame);

        let mut asm = FrameAssembler::new(ProtocolFamily::Sentry, ChecksumMode::Sum);
        asm.feed_all(&stream);

        assert!(asm.is_complete());
        assert_eq!(asm.buffered().len(), 103);
        assert_eq!(asm.buffered(), frame.as_slice());
        assert!(!asm.has_bad_checksum());
        assert!(!asm.is_nak());
    }

    #[test]
    fn test_sentry_long_frame() {
        let frame = sentry_reply(164, 176);
        let mut asm = FrameAssembler::new(ProtocolFamily::Sentry, ChecksumMode::Sum);
        asm.feed_all(&frame);

        assert!(asm.is_complete());
        assert_eq!(asm.buffered().len(), 164);
        assert!(!asm.has_bad_checksum());
    }

    #[test]
    fn test_sentry_requires_marker_pair() {
        let mut asm = FrameAssembler::new(ProtocolFamily::Sentry, ChecksumMode::Sum);
        // 176 followed by 103 is not a start pattern (176 < 192)
        asm.feed(176);
        assert_eq!(asm.feed(103), AssemblerState::Idle);
        // 192 followed by 164 is not one either
        asm.feed(192);
        assert_eq!(asm.feed(164), AssemblerState::Idle);
    }

    #[test]
    fn test_take_frame() {
        let frame = gpser_reply(b"RC00", ChecksumMode::Sum);
        let mut asm = FrameAssembler::new(ProtocolFamily::Gpser, ChecksumMode::Sum);
        assert!(asm.take_frame().is_none());

        asm.feed_all(&frame);
        let taken = asm.take_frame().unwrap();
        assert_eq!(taken.as_slice(), frame.as_slice());
        assert_eq!(taken.family, ProtocolFamily::Gpser);
        assert!(!taken.nak);
        assert!(!taken.bad_checksum);
        assert_eq!(asm.state(), AssemblerState::Idle);
    }

    #[test]
    fn test_unterminated_gpser_fills_buffer() {
        let mut asm = FrameAssembler::new(ProtocolFamily::Gpser, ChecksumMode::Sum);
        asm.feed(STX);
        asm.feed(0x41);
        for _ in 0..MAX_FRAME_LEN {
            asm.feed(0x41);
        }
        assert!(asm.is_full());
        assert!(!asm.is_complete());
        assert_eq!(asm.buffered().len(), MAX_FRAME_LEN);
    }
}
