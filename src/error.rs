//! # Error Types
//!
//! Custom error types for the Riello UPS driver using `thiserror`.

use thiserror::Error;

use crate::usb::recovery::UsbErrorKind;

/// Main error type for the Riello UPS driver
#[derive(Debug, Error)]
pub enum RielloError {
    /// Low-level USB transfer failure
    #[error("USB error ({kind:?}): {message}")]
    Usb { kind: UsbErrorKind, message: String },

    /// Report budget exhausted before a frame completed
    #[error("No complete frame after {0} reports")]
    Timeout(usize),

    /// Device rejected the command
    #[error("Command rejected by UPS (NAK)")]
    Nak,

    /// Reply failed checksum verification
    #[error("Bad checksum in reply")]
    BadChecksum,

    /// Reply too short for the requested layout
    #[error("Insufficient data: expected {expected} bytes, got {actual}")]
    InsufficientData { expected: usize, actual: usize },

    /// Unexpected protocol state or reply shape
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No device matched, or nothing answered detection
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Unrecoverable condition; the process should stop
    #[error("Fatal error: {0}")]
    Fatal(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Telemetry serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RielloError {
    /// Build a USB error of the given kind
    pub fn usb(kind: UsbErrorKind, message: impl Into<String>) -> Self {
        RielloError::Usb {
            kind,
            message: message.into(),
        }
    }

    /// Fail with `InsufficientData` unless `frame` holds at least `expected` bytes
    pub fn check_len(frame: &[u8], expected: usize) -> Result<()> {
        if frame.len() < expected {
            Err(RielloError::InsufficientData {
                expected,
                actual: frame.len(),
            })
        } else {
            Ok(())
        }
    }
}

/// Result type alias for the Riello UPS driver
pub type Result<T> = std::result::Result<T, RielloError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_len() {
        assert!(RielloError::check_len(&[0; 10], 10).is_ok());
        match RielloError::check_len(&[0; 4], 10) {
            Err(RielloError::InsufficientData { expected, actual }) => {
                assert_eq!(expected, 10);
                assert_eq!(actual, 4);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_display() {
        let err = RielloError::usb(UsbErrorKind::Stall, "endpoint halted");
        assert_eq!(err.to_string(), "USB error (Stall): endpoint halted");
        assert_eq!(RielloError::Timeout(300).to_string(), "No complete frame after 300 reports");
    }
}
