//! # USB Link
//!
//! Owns the device handle and the frame assembler, runs one command/reply
//! exchange at a time and applies the recovery policy from
//! [`classify_error`] when an exchange fails.

use tracing::{debug, error, info, warn};

use super::chunker::{ChunkerSettings, TransportChunker, ENDPOINT_IN};
use super::port_trait::{DeviceMatcher, UsbConnector, UsbPort};
use super::recovery::{classify_error, Recovery};
use crate::error::{RielloError, Result};
use crate::riello::assembler::FrameAssembler;
use crate::riello::protocol::{ChecksumMode, CommandFrame, Frame, ProtocolFamily};

/// HID SET_REPORT request
const HID_SET_REPORT: u8 = 0x09;

/// wValue selecting a feature report
const HID_FEATURE_REPORT: u16 = 0x0300;

/// Bridge configuration written once after every open
pub const FEATURE_REPORT: [u8; 5] = [0xB0, 0x04, 0x00, 0x00, 0x03];

/// Handle lifecycle
pub enum ConnectionState {
    /// Never opened
    Closed,
    /// Handle available
    Open(Box<dyn UsbPort>),
    /// Handle dropped after a failure; reopened on the next exchange
    Reconnecting,
}

impl std::fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Closed => write!(f, "Closed"),
            ConnectionState::Open(_) => write!(f, "Open"),
            ConnectionState::Reconnecting => write!(f, "Reconnecting"),
        }
    }
}

/// Reliability layer over the chunk transport
pub struct UsbLink {
    connector: Box<dyn UsbConnector>,
    matcher: DeviceMatcher,
    state: ConnectionState,
    chunker: TransportChunker,
    assembler: FrameAssembler,
    reopened: bool,
}

impl std::fmt::Debug for UsbLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsbLink")
            .field("matcher", &self.matcher)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl UsbLink {
    pub fn new(
        connector: Box<dyn UsbConnector>,
        matcher: DeviceMatcher,
        settings: ChunkerSettings,
    ) -> Self {
        Self {
            connector,
            matcher,
            state: ConnectionState::Closed,
            chunker: TransportChunker::new(settings),
            assembler: FrameAssembler::new(ProtocolFamily::Gpser, ChecksumMode::Sum),
            reopened: false,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, ConnectionState::Open(_))
    }

    /// Matcher used for the next open (pinned after the first success)
    pub fn matcher(&self) -> &DeviceMatcher {
        &self.matcher
    }

    /// True once after the handle was reopened following a failure
    pub fn take_reopened(&mut self) -> bool {
        std::mem::take(&mut self.reopened)
    }

    /// Open the device unless a handle is already held
    ///
    /// Writes the feature report after every successful open; a failure to
    /// do so is logged and ignored.
    ///
    /// # Errors
    ///
    /// Returns the connector's error and leaves the state unchanged.
    pub async fn ensure_open(&mut self) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }

        let reconnecting = matches!(self.state, ConnectionState::Reconnecting);
        let opened = self.connector.open(&self.matcher)?;
        self.matcher.pin(opened.serial.clone(), opened.bus);

        let mut port = opened.port;
        match port
            .control_write(
                HID_SET_REPORT,
                HID_FEATURE_REPORT,
                &FEATURE_REPORT,
                self.chunker.settings().timeout,
            )
            .await
        {
            Ok(()) => debug!("send: features report ok"),
            Err(e) => debug!("send: features report failed: {}", e),
        }

        self.state = ConnectionState::Open(port);
        if reconnecting {
            info!("USB device reopened");
            self.reopened = true;
        }
        Ok(())
    }

    /// Drop the handle
    pub fn close(&mut self) {
        if self.is_open() {
            debug!("Closing USB device");
        }
        self.state = ConnectionState::Closed;
    }

    /// Send `command` and return the reply frame with its NAK/checksum flags
    ///
    /// # Errors
    ///
    /// - `Fatal` when the device is busy or access is not permitted
    /// - the transport error after any other failure, once recovery ran
    /// - `Timeout` when no complete frame arrived
    pub async fn execute(&mut self, command: &CommandFrame) -> Result<Frame> {
        self.ensure_open().await?;
        debug!("Command {} ({} bytes)", command.name, command.bytes.len());

        let mut retried = false;
        loop {
            let err = match self.exchange(command).await {
                Ok(frame) => {
                    debug!("Command {} ok: {} bytes", command.name, frame.len());
                    return Ok(frame);
                }
                Err(err) => err,
            };
            debug!("Command {} err: {}", command.name, err);

            match classify_error(&err) {
                Recovery::Fatal => {
                    error!("Unrecoverable USB error: {}", err);
                    self.close();
                    return Err(RielloError::Fatal(err.to_string()));
                }
                Recovery::ClearAndRetry => {
                    if self.clear_halt().await {
                        if !retried {
                            retried = true;
                            continue;
                        }
                        return Err(err);
                    }
                    self.reset_device().await;
                    self.mark_lost();
                    return Err(err);
                }
                Recovery::ResetAndReconnect => {
                    self.reset_device().await;
                    self.mark_lost();
                    return Err(err);
                }
                Recovery::Reconnect => {
                    self.mark_lost();
                    return Err(err);
                }
                Recovery::SoftFail => return Err(err),
            }
        }
    }

    async fn exchange(&mut self, command: &CommandFrame) -> Result<Frame> {
        let port = match &mut self.state {
            ConnectionState::Open(port) => port.as_mut(),
            _ => return Err(RielloError::Protocol("USB device not open".to_string())),
        };

        self.assembler.configure(command.family, command.checksum);
        self.chunker.send(port, &command.bytes).await?;
        self.chunker.receive_into(port, &mut self.assembler).await
    }

    async fn clear_halt(&mut self) -> bool {
        let ConnectionState::Open(port) = &mut self.state else {
            return false;
        };
        match port.clear_halt(ENDPOINT_IN).await {
            Ok(()) => {
                debug!("Stall condition cleared");
                true
            }
            Err(e) => {
                debug!("Clear halt failed: {}", e);
                false
            }
        }
    }

    async fn reset_device(&mut self) {
        if let ConnectionState::Open(port) = &mut self.state {
            match port.reset().await {
                Ok(()) => debug!("Device reset handled"),
                Err(e) => debug!("Device reset failed: {}", e),
            }
        }
    }

    fn mark_lost(&mut self) {
        warn!("USB device lost, reconnecting on next command");
        self.state = ConnectionState::Reconnecting;
    }
}
