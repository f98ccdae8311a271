//! # Transport Error Classification
//!
//! Maps low-level USB failures onto a closed set of kinds, and each kind onto
//! the recovery action the link should take.

use std::io;

use nusb::transfer::TransferError;

use crate::error::RielloError;

// Linux errno values seen from usbfs
const EPERM: i32 = 1;
const ENOENT: i32 = 2;
const EIO: i32 = 5;
const ENXIO: i32 = 6;
const EACCES: i32 = 13;
const EBUSY: i32 = 16;
const ENODEV: i32 = 19;
const EPIPE: i32 = 32;
const ETIME: i32 = 62;
const EPROTO: i32 = 71;
const EOVERFLOW: i32 = 75;
const ETIMEDOUT: i32 = 110;

/// Kind of USB failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbErrorKind {
    /// Device claimed by another driver
    Busy,
    /// Operation not permitted
    PermissionDenied,
    /// Endpoint halted (broken pipe)
    Stall,
    /// Kernel timer expired mid-transfer
    TimerExpired,
    /// Device gone
    NoDevice,
    /// Access to the device node denied
    AccessDenied,
    /// Generic I/O failure
    Io,
    /// Device address no longer valid
    NoSuchAddress,
    /// Device node or interface not found
    NotFound,
    /// Transfer did not complete within the per-call timeout
    TimedOut,
    /// Device returned more data than requested
    Overflow,
    /// Protocol-level transfer error
    Protocol,
    /// Transfer cancelled
    Cancelled,
    /// Empty or otherwise invalid request
    InvalidInput,
}

/// Action the link takes after a failed exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Abort; automatic retry is not safe
    Fatal,
    /// Clear the endpoint halt and retry once
    ClearAndRetry,
    /// Reset the device, then close and reopen on the next call
    ResetAndReconnect,
    /// Close the handle and reopen on the next call
    Reconnect,
    /// Report failure, keep the handle
    SoftFail,
}

/// Decide how to recover from `kind`
pub fn classify(kind: UsbErrorKind) -> Recovery {
    match kind {
        UsbErrorKind::Busy | UsbErrorKind::PermissionDenied => Recovery::Fatal,
        UsbErrorKind::Stall => Recovery::ClearAndRetry,
        UsbErrorKind::TimerExpired => Recovery::ResetAndReconnect,
        UsbErrorKind::NoDevice
        | UsbErrorKind::AccessDenied
        | UsbErrorKind::Io
        | UsbErrorKind::NoSuchAddress
        | UsbErrorKind::NotFound => Recovery::Reconnect,
        UsbErrorKind::TimedOut
        | UsbErrorKind::Overflow
        | UsbErrorKind::Protocol
        | UsbErrorKind::Cancelled
        | UsbErrorKind::InvalidInput => Recovery::SoftFail,
    }
}

/// Recovery for any crate error; only USB failures touch the handle
pub fn classify_error(err: &RielloError) -> Recovery {
    match err {
        RielloError::Usb { kind, .. } => classify(*kind),
        RielloError::Fatal(_) => Recovery::Fatal,
        _ => Recovery::SoftFail,
    }
}

/// Kind of a failed nusb transfer
pub fn kind_from_transfer(err: &TransferError) -> UsbErrorKind {
    match err {
        TransferError::Stall => UsbErrorKind::Stall,
        TransferError::Disconnected => UsbErrorKind::NoDevice,
        TransferError::Cancelled => UsbErrorKind::Cancelled,
        TransferError::Fault => UsbErrorKind::Io,
        TransferError::Unknown => UsbErrorKind::Io,
    }
}

/// Kind of a failed open/claim/control call
pub fn kind_from_io(err: &io::Error) -> UsbErrorKind {
    if let Some(code) = err.raw_os_error() {
        return match code {
            EBUSY => UsbErrorKind::Busy,
            EPERM => UsbErrorKind::PermissionDenied,
            EPIPE => UsbErrorKind::Stall,
            ETIME => UsbErrorKind::TimerExpired,
            ENODEV => UsbErrorKind::NoDevice,
            EACCES => UsbErrorKind::AccessDenied,
            EIO => UsbErrorKind::Io,
            ENXIO => UsbErrorKind::NoSuchAddress,
            ENOENT => UsbErrorKind::NotFound,
            ETIMEDOUT => UsbErrorKind::TimedOut,
            EOVERFLOW => UsbErrorKind::Overflow,
            EPROTO => UsbErrorKind::Protocol,
            _ => UsbErrorKind::Io,
        };
    }

    match err.kind() {
        io::ErrorKind::PermissionDenied => UsbErrorKind::PermissionDenied,
        io::ErrorKind::NotFound => UsbErrorKind::NotFound,
        io::ErrorKind::TimedOut => UsbErrorKind::TimedOut,
        io::ErrorKind::BrokenPipe => UsbErrorKind::Stall,
        io::ErrorKind::InvalidInput => UsbErrorKind::InvalidInput,
        _ => UsbErrorKind::Io,
    }
}

impl From<TransferError> for RielloError {
    fn from(err: TransferError) -> Self {
        RielloError::usb(kind_from_transfer(&err), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_kinds() {
        assert_eq!(classify(UsbErrorKind::Busy), Recovery::Fatal);
        assert_eq!(classify(UsbErrorKind::PermissionDenied), Recovery::Fatal);
    }

    #[test]
    fn test_stall_clears_halt() {
        assert_eq!(classify(UsbErrorKind::Stall), Recovery::ClearAndRetry);
    }

    #[test]
    fn test_reconnect_kinds() {
        for kind in [
            UsbErrorKind::NoDevice,
            UsbErrorKind::AccessDenied,
            UsbErrorKind::Io,
            UsbErrorKind::NoSuchAddress,
            UsbErrorKind::NotFound,
        ] {
            assert_eq!(classify(kind), Recovery::Reconnect, "{:?}", kind);
        }
        assert_eq!(classify(UsbErrorKind::TimerExpired), Recovery::ResetAndReconnect);
    }

    #[test]
    fn test_soft_kinds() {
        for kind in [
            UsbErrorKind::TimedOut,
            UsbErrorKind::Overflow,
            UsbErrorKind::Protocol,
            UsbErrorKind::Cancelled,
        ] {
            assert_eq!(classify(kind), Recovery::SoftFail, "{:?}", kind);
        }
    }

    #[test]
    fn test_kind_from_errno() {
        assert_eq!(kind_from_io(&io::Error::from_raw_os_error(EBUSY)), UsbErrorKind::Busy);
        assert_eq!(kind_from_io(&io::Error::from_raw_os_error(EPERM)), UsbErrorKind::PermissionDenied);
        assert_eq!(kind_from_io(&io::Error::from_raw_os_error(EACCES)), UsbErrorKind::AccessDenied);
        assert_eq!(kind_from_io(&io::Error::from_raw_os_error(ENODEV)), UsbErrorKind::NoDevice);
        assert_eq!(kind_from_io(&io::Error::from_raw_os_error(ETIMEDOUT)), UsbErrorKind::TimedOut);
    }

    #[test]
    fn test_kind_from_error_kind() {
        let err = io::Error::new(io::ErrorKind::NotFound, "no interface");
        assert_eq!(kind_from_io(&err), UsbErrorKind::NotFound);
        let err = io::Error::new(io::ErrorKind::Other, "unknown");
        assert_eq!(kind_from_io(&err), UsbErrorKind::Io);
    }

    #[test]
    fn test_kind_from_transfer() {
        assert_eq!(kind_from_transfer(&TransferError::Stall), UsbErrorKind::Stall);
        assert_eq!(kind_from_transfer(&TransferError::Disconnected), UsbErrorKind::NoDevice);
        assert_eq!(kind_from_transfer(&TransferError::Fault), UsbErrorKind::Io);
    }

    #[test]
    fn test_classify_error() {
        assert_eq!(classify_error(&RielloError::Nak), Recovery::SoftFail);
        assert_eq!(classify_error(&RielloError::Timeout(300)), Recovery::SoftFail);
        assert_eq!(
            classify_error(&RielloError::usb(UsbErrorKind::NoDevice, "gone")),
            Recovery::Reconnect
        );
    }
}
