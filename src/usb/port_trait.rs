//! Trait abstraction for USB port operations to enable testing

use std::time::Duration;

use async_trait::async_trait;
use nusb::transfer::{ControlOut, ControlType, Recipient, RequestBuffer};
use tokio::time::timeout;
use tracing::{debug, info};

use super::recovery::{kind_from_io, UsbErrorKind};
use crate::error::{RielloError, Result};

/// Trait for the USB operations the link needs
#[async_trait]
pub trait UsbPort: Send {
    /// Write one bulk transfer, returning the number of bytes sent
    async fn bulk_write(&mut self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize>;

    /// Read one bulk transfer of at most `len` bytes
    async fn bulk_read(&mut self, endpoint: u8, len: usize, timeout: Duration) -> Result<Vec<u8>>;

    /// Class/interface SET_REPORT control transfer
    async fn control_write(
        &mut self,
        request: u8,
        value: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<()>;

    /// Clear a halt condition on `endpoint`
    async fn clear_halt(&mut self, endpoint: u8) -> Result<()>;

    /// Reset the device
    async fn reset(&mut self) -> Result<()>;
}

/// Filters used to pick the UPS among attached USB devices
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMatcher {
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial: Option<String>,
    pub bus: Option<u8>,
}

impl DeviceMatcher {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
            serial: None,
            bus: None,
        }
    }

    /// Check a device's identity against every configured filter
    pub fn matches(&self, vendor_id: u16, product_id: u16, serial: Option<&str>, bus: u8) -> bool {
        if vendor_id != self.vendor_id || product_id != self.product_id {
            return false;
        }
        if let Some(wanted) = &self.serial {
            if serial != Some(wanted.as_str()) {
                return false;
            }
        }
        if let Some(wanted) = self.bus {
            if bus != wanted {
                return false;
            }
        }
        true
    }

    /// Narrow the matcher to one physical unit
    pub fn pin(&mut self, serial: Option<String>, bus: u8) {
        if serial.is_some() {
            self.serial = serial;
        }
        self.bus = Some(bus);
    }
}

/// An opened, claimed device plus the identity used for reopen pinning
pub struct OpenedDevice {
    pub port: Box<dyn UsbPort>,
    pub serial: Option<String>,
    pub bus: u8,
}

impl std::fmt::Debug for OpenedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedDevice")
            .field("serial", &self.serial)
            .field("bus", &self.bus)
            .finish_non_exhaustive()
    }
}

/// Opens devices for the link
#[cfg_attr(test, mockall::automock)]
pub trait UsbConnector: Send {
    fn open(&mut self, matcher: &DeviceMatcher) -> Result<OpenedDevice>;
}

/// Connector backed by `nusb`
#[derive(Debug, Default)]
pub struct NusbConnector;

impl UsbConnector for NusbConnector {
    fn open(&mut self, matcher: &DeviceMatcher) -> Result<OpenedDevice> {
        let io_error = |e: std::io::Error| RielloError::usb(kind_from_io(&e), e.to_string());

        let device_info = nusb::list_devices()
            .map_err(io_error)?
            .find(|d| {
                matcher.matches(d.vendor_id(), d.product_id(), d.serial_number(), d.bus_number())
            })
            .ok_or_else(|| {
                RielloError::DeviceNotFound(format!(
                    "{:04x}:{:04x}",
                    matcher.vendor_id, matcher.product_id
                ))
            })?;

        info!(
            "Found UPS on bus {} addr {}",
            device_info.bus_number(),
            device_info.device_address()
        );

        let device = device_info.open().map_err(io_error)?;
        let interface = device.detach_and_claim_interface(0).map_err(io_error)?;
        debug!("Interface claimed");

        Ok(OpenedDevice {
            port: Box::new(NusbPort { device, interface }),
            serial: device_info.serial_number().map(str::to_string),
            bus: device_info.bus_number(),
        })
    }
}

/// Wrapper around an `nusb` device and its claimed interface
pub struct NusbPort {
    device: nusb::Device,
    interface: nusb::Interface,
}

fn timed_out(what: &str) -> RielloError {
    RielloError::usb(UsbErrorKind::TimedOut, format!("{} timed out", what))
}

#[async_trait]
impl UsbPort for NusbPort {
    async fn bulk_write(&mut self, endpoint: u8, data: &[u8], limit: Duration) -> Result<usize> {
        let transfer = self.interface.bulk_out(endpoint, data.to_vec());
        let completion = timeout(limit, transfer)
            .await
            .map_err(|_| timed_out("bulk write"))?;
        let sent = completion.into_result()?;
        Ok(sent.actual_length())
    }

    async fn bulk_read(&mut self, endpoint: u8, len: usize, limit: Duration) -> Result<Vec<u8>> {
        let transfer = self.interface.bulk_in(endpoint, RequestBuffer::new(len));
        let completion = timeout(limit, transfer)
            .await
            .map_err(|_| timed_out("bulk read"))?;
        Ok(completion.into_result()?)
    }

    async fn control_write(
        &mut self,
        request: u8,
        value: u16,
        data: &[u8],
        limit: Duration,
    ) -> Result<()> {
        let transfer = self.interface.control_out(ControlOut {
            control_type: ControlType::Class,
            recipient: Recipient::Interface,
            request,
            value,
            index: 0,
            data,
        });
        let completion = timeout(limit, transfer)
            .await
            .map_err(|_| timed_out("control write"))?;
        completion.into_result()?;
        Ok(())
    }

    async fn clear_halt(&mut self, endpoint: u8) -> Result<()> {
        self.interface
            .clear_halt(endpoint)
            .map_err(|e| RielloError::usb(kind_from_io(&e), e.to_string()))
    }

    async fn reset(&mut self) -> Result<()> {
        self.device
            .reset()
            .map_err(|e| RielloError::usb(kind_from_io(&e), e.to_string()))
    }
}

#[cfg(test)]
pub mod mocks {
    use super::*;
    use crate::usb::chunker::chunk_reports;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// One scripted response to a bulk read
    #[derive(Debug, Clone)]
    pub enum ReadStep {
        Report(Vec<u8>),
        Fail(UsbErrorKind),
    }

    #[derive(Debug, Default)]
    pub struct ScriptState {
        pub written: Vec<Vec<u8>>,
        pub control_writes: Vec<(u8, u16, Vec<u8>)>,
        pub reads: VecDeque<ReadStep>,
        pub write_errors: VecDeque<UsbErrorKind>,
        pub control_error: Option<UsbErrorKind>,
        pub clear_halt_error: Option<UsbErrorKind>,
        pub clear_halts: usize,
        pub resets: usize,
    }

    /// Scripted USB port for testing
    ///
    /// Reads pop from a queue; an exhausted queue returns an empty report
    /// (header byte with zero payload count), like an idle device.
    #[derive(Clone, Default)]
    pub struct ScriptedPort {
        pub state: Arc<Mutex<ScriptState>>,
    }

    impl ScriptedPort {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue a device reply as incoming reports
        pub fn push_reply(&self, frame: &[u8]) {
            let mut state = self.state.lock().unwrap();
            for report in chunk_reports(frame) {
                state.reads.push_back(ReadStep::Report(report.to_vec()));
            }
        }

        pub fn push_report(&self, report: &[u8]) {
            self.state
                .lock()
                .unwrap()
                .reads
                .push_back(ReadStep::Report(report.to_vec()));
        }

        pub fn push_read_error(&self, kind: UsbErrorKind) {
            self.state.lock().unwrap().reads.push_back(ReadStep::Fail(kind));
        }

        pub fn push_write_error(&self, kind: UsbErrorKind) {
            self.state.lock().unwrap().write_errors.push_back(kind);
        }

        pub fn set_clear_halt_error(&self, kind: UsbErrorKind) {
            self.state.lock().unwrap().clear_halt_error = Some(kind);
        }

        pub fn set_control_error(&self, kind: UsbErrorKind) {
            self.state.lock().unwrap().control_error = Some(kind);
        }

        pub fn written(&self) -> Vec<Vec<u8>> {
            self.state.lock().unwrap().written.clone()
        }

        pub fn control_writes(&self) -> Vec<(u8, u16, Vec<u8>)> {
            self.state.lock().unwrap().control_writes.clone()
        }

        pub fn clear_halts(&self) -> usize {
            self.state.lock().unwrap().clear_halts
        }

        pub fn resets(&self) -> usize {
            self.state.lock().unwrap().resets
        }
    }

    #[async_trait]
    impl UsbPort for ScriptedPort {
        async fn bulk_write(&mut self, _endpoint: u8, data: &[u8], _timeout: Duration) -> Result<usize> {
            let mut state = self.state.lock().unwrap();
            if let Some(kind) = state.write_errors.pop_front() {
                return Err(RielloError::usb(kind, "scripted write error"));
            }
            state.written.push(data.to_vec());
            Ok(data.len())
        }

        async fn bulk_read(&mut self, _endpoint: u8, len: usize, _timeout: Duration) -> Result<Vec<u8>> {
            let step = self.state.lock().unwrap().reads.pop_front();
            match step {
                Some(ReadStep::Report(mut report)) => {
                    report.truncate(len);
                    Ok(report)
                }
                Some(ReadStep::Fail(kind)) => Err(RielloError::usb(kind, "scripted read error")),
                None => Ok(vec![0x30, 0, 0, 0, 0, 0, 0, 0]),
            }
        }

        async fn control_write(
            &mut self,
            request: u8,
            value: u16,
            data: &[u8],
            _timeout: Duration,
        ) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if let Some(kind) = state.control_error {
                return Err(RielloError::usb(kind, "scripted control error"));
            }
            state.control_writes.push((request, value, data.to_vec()));
            Ok(())
        }

        async fn clear_halt(&mut self, _endpoint: u8) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state.clear_halts += 1;
            match state.clear_halt_error {
                Some(kind) => Err(RielloError::usb(kind, "scripted clear halt error")),
                None => Ok(()),
            }
        }

        async fn reset(&mut self) -> Result<()> {
            self.state.lock().unwrap().resets += 1;
            Ok(())
        }
    }
}
