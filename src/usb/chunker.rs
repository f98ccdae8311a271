//! # USB Chunk Transport
//!
//! Maps logical frames onto the 8-byte reports of the Cypress USB-serial
//! bridge used by Riello units.
//!
//! Report layout (both directions):
//! ```text
//! [count] [payload 0..7]
//! ```
//! The low three bits of `count` give the number of valid payload bytes.
//! Outgoing full reports use `0x37`; the final partial report uses
//! `0x30 + remaining` and pads with `'0'`.

use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

use super::port_trait::UsbPort;
use super::recovery::UsbErrorKind;
use crate::error::{RielloError, Result};
use crate::riello::assembler::{AssemblerState, FrameAssembler};
use crate::riello::protocol::Frame;

/// Size of one USB report
pub const REPORT_LEN: usize = 8;

/// Payload bytes carried by one report
pub const REPORT_PAYLOAD: usize = 7;

/// Bulk OUT endpoint
pub const ENDPOINT_OUT: u8 = 0x02;

/// Bulk IN endpoint
pub const ENDPOINT_IN: u8 = 0x81;

const COUNT_BASE: u8 = 0x30;
const COUNT_MASK: u8 = 0x07;
const PAD: u8 = b'0';

/// Split `bytes` into 8-byte reports
///
/// # Examples
///
/// ```
/// use riello_ups::usb::chunker::chunk_reports;
///
/// let reports = chunk_reports(b"ABCDEFGHI");
/// assert_eq!(reports.len(), 2);
/// assert_eq!(&reports[0], b"7ABCDEFG");
/// assert_eq!(&reports[1], b"2HI00000");
/// ```
pub fn chunk_reports(bytes: &[u8]) -> Vec<[u8; REPORT_LEN]> {
    bytes
        .chunks(REPORT_PAYLOAD)
        .map(|chunk| {
            let mut report = [PAD; REPORT_LEN];
            report[0] = COUNT_BASE + chunk.len() as u8;
            report[1..=chunk.len()].copy_from_slice(chunk);
            report
        })
        .collect()
}

/// Valid payload of an incoming report
///
/// The count is clamped to the bytes actually present.
pub fn report_payload(report: &[u8]) -> &[u8] {
    match report.split_first() {
        Some((&count, payload)) => {
            let count = usize::from(count & COUNT_MASK).min(payload.len());
            &payload[..count]
        }
        None => &[],
    }
}

/// Pause between outgoing reports for a configured write delay
///
/// A delay of 1 means 400 µs; larger values are milliseconds. Zero is raised
/// to the 400 µs minimum.
pub fn inter_report_delay(write_delay: u32) -> Duration {
    if write_delay <= 1 {
        Duration::from_micros(400)
    } else {
        Duration::from_millis(u64::from(write_delay))
    }
}

/// Timing and budget of the chunk transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkerSettings {
    /// Per-transfer timeout
    pub timeout: Duration,
    /// Pause after every outgoing report
    pub write_delay: Duration,
    /// Pause between incoming reports
    pub read_interval: Duration,
    /// Reports read before a reply is declared lost
    pub max_reports: usize,
}

impl Default for ChunkerSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(1000),
            write_delay: inter_report_delay(200),
            read_interval: Duration::from_millis(10),
            max_reports: 300,
        }
    }
}

/// Moves frames across the report boundary; performs no retries
#[derive(Debug, Clone, Default)]
pub struct TransportChunker {
    settings: ChunkerSettings,
}

impl TransportChunker {
    pub fn new(settings: ChunkerSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ChunkerSettings {
        &self.settings
    }

    /// Send a logical frame as consecutive reports
    ///
    /// # Errors
    ///
    /// An empty frame is rejected; transfer errors are returned unchanged.
    pub async fn send(&self, port: &mut dyn UsbPort, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Err(RielloError::usb(UsbErrorKind::InvalidInput, "empty frame"));
        }

        for report in chunk_reports(bytes) {
            port.bulk_write(ENDPOINT_OUT, &report, self.settings.timeout).await?;
            sleep(self.settings.write_delay).await;
        }

        debug!("Sent {} bytes", bytes.len());
        Ok(())
    }

    /// Read reports into `assembler` until a frame completes
    ///
    /// # Errors
    ///
    /// Returns `Timeout` once the report budget is spent or the assembler
    /// buffer fills without a terminator; transfer errors are returned
    /// unchanged.
    pub async fn receive_into(
        &self,
        port: &mut dyn UsbPort,
        assembler: &mut FrameAssembler,
    ) -> Result<Frame> {
        for reports in 1..=self.settings.max_reports {
            let report = port
                .bulk_read(ENDPOINT_IN, REPORT_LEN, self.settings.timeout)
                .await?;
            debug!("read: {:02X?}", report);

            if assembler.feed_all(report_payload(&report)) == AssemblerState::Complete {
                debug!("Frame complete after {} reports", reports);
                return assembler.take_frame().ok_or_else(|| {
                    RielloError::Protocol("assembler complete without a frame".to_string())
                });
            }

            if assembler.is_full() {
                break;
            }

            sleep(self.settings.read_interval).await;
        }

        debug!("No frame, {} bytes buffered", assembler.buffered().len());
        Err(RielloError::Timeout(self.settings.max_reports))
    }
}
