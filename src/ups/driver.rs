//! # UPS Driver
//!
//! Runs the Riello protocol over a [`UsbLink`] and publishes the results to
//! a [`StateSink`].

use serde::Deserialize;
use tracing::{debug, error, info, warn};

use super::instcmd::{CommandDelays, InstantCommand, InstcmdStatus};
use super::poll::{PollEvent, PollFailureCounter, COUNTLOST};
use crate::error::{RielloError, Result};
use crate::riello::decoder::{
    decode_extended, decode_identification, decode_nominal, decode_sentry, decode_status,
    decode_status_codes, resolve_extension_level,
};
use crate::riello::encoder::{GpserCommand, SentryCommand};
use crate::riello::protocol::{
    ChecksumMode, CommandFrame, ExtensionLevel, Frame, PhaseLayout, ProtocolFamily,
    TelemetrySnapshot, RUNTIME_UNKNOWN,
};
use crate::state::StateSink;
use crate::usb::link::UsbLink;

/// Manufacturer string published for every Riello unit
pub const MANUFACTURER: &str = "RPS S.p.a.";

/// Which protocol family to talk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FamilySelection {
    /// Probe SENTRY first, then GPSER
    Auto,
    #[default]
    Gpser,
    Sentry,
}

/// Driver behaviour taken from configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverSettings {
    pub family: FamilySelection,
    pub delays: CommandDelays,
    pub countlost: u32,
    pub shutdown_retries: u32,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            family: FamilySelection::default(),
            delays: CommandDelays::default(),
            countlost: COUNTLOST,
            shutdown_retries: 3,
        }
    }
}

/// Checksum first for data replies: a corrupted NAK is still corrupted
fn data_reply(frame: Frame) -> Result<Frame> {
    if frame.bad_checksum {
        Err(RielloError::BadChecksum)
    } else if frame.nak {
        Err(RielloError::Nak)
    } else {
        Ok(frame)
    }
}

fn tenths(value: u16, decimals: usize) -> String {
    format!("{:.*}", decimals, f64::from(value) / 10.0)
}

/// Riello UPS driver
pub struct UpsDriver<S: StateSink> {
    link: UsbLink,
    sink: S,
    settings: DriverSettings,
    family: ProtocolFamily,
    checksum: ChecksumMode,
    layout: PhaseLayout,
    level: ExtensionLevel,
    snapshot: TelemetrySnapshot,
    failures: PollFailureCounter,
    identified: bool,
}

impl<S: StateSink> std::fmt::Debug for UpsDriver<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpsDriver")
            .field("link", &self.link)
            .field("family", &self.family)
            .field("checksum", &self.checksum)
            .field("layout", &self.layout)
            .field("level", &self.level)
            .field("failures", &self.failures)
            .finish_non_exhaustive()
    }
}

impl<S: StateSink> UpsDriver<S> {
    pub fn new(link: UsbLink, sink: S, settings: DriverSettings) -> Self {
        let family = match settings.family {
            FamilySelection::Sentry => ProtocolFamily::Sentry,
            _ => ProtocolFamily::Gpser,
        };
        Self {
            link,
            sink,
            failures: PollFailureCounter::new(settings.countlost),
            settings,
            family,
            checksum: ChecksumMode::Sum,
            layout: PhaseLayout::default(),
            level: ExtensionLevel::default(),
            snapshot: TelemetrySnapshot::default(),
            identified: false,
        }
    }

    pub fn family(&self) -> ProtocolFamily {
        self.family
    }

    pub fn checksum_mode(&self) -> ChecksumMode {
        self.checksum
    }

    pub fn layout(&self) -> PhaseLayout {
        self.layout
    }

    pub fn extension_level(&self) -> ExtensionLevel {
        self.level
    }

    pub fn snapshot(&self) -> &TelemetrySnapshot {
        &self.snapshot
    }

    pub fn failures(&self) -> &PollFailureCounter {
        &self.failures
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn link(&self) -> &UsbLink {
        &self.link
    }

    /// Establish communication and publish static information
    ///
    /// Detects the family (when configured as `auto`), identifies the unit,
    /// reads its nominal ratings and advertises the instant commands.
    ///
    /// # Errors
    ///
    /// Fails when the device cannot be opened or does not answer the
    /// identification request with a clean frame.
    pub async fn initialize(&mut self) -> Result<()> {
        self.link.ensure_open().await?;
        self.link.take_reopened();

        self.family = self.detect().await?;
        info!(
            "Communication with UPS established ({:?}, model {})",
            self.family, self.snapshot.model_name
        );
        self.publish_identity();

        match self.read_nominal().await {
            Ok(()) => self.publish_nominal(),
            Err(e @ RielloError::Fatal(_)) => return Err(e),
            Err(e) => debug!("Get nominal Ko: {}", e),
        }

        match self.read_status_codes().await {
            Ok(true) => debug!("Status codes: {:02X?}", self.snapshot.status_code_table),
            Ok(false) => {}
            Err(e @ RielloError::Fatal(_)) => return Err(e),
            Err(e) => debug!("Get statuscode Ko: {}", e),
        }

        for command in InstantCommand::ALL {
            if command.supported_by(self.family) {
                self.sink.add_command(command.name());
            }
        }
        Ok(())
    }

    async fn detect(&mut self) -> Result<ProtocolFamily> {
        match self.settings.family {
            FamilySelection::Gpser => {
                self.identify_gpser().await?;
                Ok(ProtocolFamily::Gpser)
            }
            FamilySelection::Sentry => {
                self.identify_sentry().await?;
                Ok(ProtocolFamily::Sentry)
            }
            FamilySelection::Auto => {
                debug!("try to detect SENTRY");
                match self.identify_sentry().await {
                    Ok(()) => return Ok(ProtocolFamily::Sentry),
                    Err(e @ RielloError::Fatal(_)) => return Err(e),
                    Err(e) => debug!("No SENTRY reply: {}", e),
                }

                debug!("try to detect GPSER");
                match self.identify_gpser().await {
                    Ok(()) => Ok(ProtocolFamily::Gpser),
                    Err(e @ RielloError::Fatal(_)) => Err(e),
                    Err(e) => {
                        debug!("No GPSER reply: {}", e);
                        Err(RielloError::DeviceNotFound(
                            "no GPSER or SENTRY reply".to_string(),
                        ))
                    }
                }
            }
        }
    }

    async fn identify(&mut self) -> Result<()> {
        match self.family {
            ProtocolFamily::Gpser => self.identify_gpser().await,
            ProtocolFamily::Sentry => self.identify_sentry().await,
        }
    }

    async fn identify_gpser(&mut self) -> Result<()> {
        let frame = self.request(GpserCommand::Identify.encode(ChecksumMode::Sum)).await?;
        decode_identification(frame.as_slice(), &mut self.snapshot)?;

        let identif = self.snapshot.identif_bytes;
        self.family = ProtocolFamily::Gpser;
        self.checksum = ChecksumMode::from_identification(identif[4]);
        self.layout = PhaseLayout::from_identification(identif[0]);
        self.identified = true;

        debug!(
            "GPSER identified: {:?}, {:?}, {} batteries",
            self.checksum, self.layout, self.snapshot.num_bat
        );
        Ok(())
    }

    async fn identify_sentry(&mut self) -> Result<()> {
        let frame = self.request(SentryCommand::Identify.encode()).await?;
        decode_sentry(frame.as_slice(), ExtensionLevel::Only192, &mut self.snapshot)?;

        self.family = ProtocolFamily::Sentry;
        self.checksum = ChecksumMode::Sum;
        self.level = resolve_extension_level(frame.as_slice())?;
        self.layout = PhaseLayout::from_identification(self.snapshot.identif_bytes[0]);
        self.identified = true;

        debug!("SENTRY identified: model {}, {:?}", self.snapshot.model, self.level);
        Ok(())
    }

    async fn request(&mut self, command: CommandFrame) -> Result<Frame> {
        let frame = self.link.execute(&command).await?;
        data_reply(frame)
    }

    async fn read_nominal(&mut self) -> Result<()> {
        match self.family {
            ProtocolFamily::Gpser => {
                let frame = self.request(GpserCommand::ReadNominal.encode(self.checksum)).await?;
                decode_nominal(frame.as_slice(), &mut self.snapshot)
            }
            ProtocolFamily::Sentry => {
                let frame = self.request(SentryCommand::Request(self.level).encode()).await?;
                decode_sentry(frame.as_slice(), self.level, &mut self.snapshot)
            }
        }
    }

    /// Read the "RC" status-code table (GPSER only)
    ///
    /// Returns `Ok(false)` when the family or the unit does not support it.
    pub async fn read_status_codes(&mut self) -> Result<bool> {
        if self.family != ProtocolFamily::Gpser {
            return Ok(false);
        }

        match self.request(GpserCommand::ReadStatusCodes.encode(self.checksum)).await {
            Ok(frame) => {
                decode_status_codes(frame.as_slice(), &mut self.snapshot)?;
                Ok(true)
            }
            Err(RielloError::Nak) => {
                debug!("Get statuscode Ko: command not supported");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Poll the UPS and republish its state
    ///
    /// Returns `Ok(true)` when fresh data was published and `Ok(false)` when
    /// the poll failed. Failures are counted; once the count reaches the
    /// configured limit the published data is marked stale.
    ///
    /// # Errors
    ///
    /// Only fatal transport conditions are returned.
    pub async fn update_info(&mut self) -> Result<bool> {
        debug!("countlost {}", self.failures.count());
        if self.failures.count() > 0 {
            debug!("Communication with UPS is lost: status read failed");
        }

        match self.refresh().await {
            Ok(extended) => {
                if self.failures.record_success() == PollEvent::Recovered {
                    info!("Communication with UPS is re-established");
                }
                self.publish_status(extended);
                self.sink.data_ok();
                Ok(true)
            }
            Err(e @ RielloError::Fatal(_)) => Err(e),
            Err(e) => {
                debug!("Get status Ko: {}", e);
                if self.failures.record_failure() == PollEvent::BecameStale {
                    warn!("Communication with UPS is lost: status read failed");
                    self.sink.data_stale();
                }
                Ok(false)
            }
        }
    }

    async fn refresh(&mut self) -> Result<bool> {
        self.link.ensure_open().await?;
        if self.link.take_reopened() {
            info!("UPS reconnected, identifying again");
            self.identified = false;
        }
        if !self.identified {
            self.identify().await?;
        }

        match self.family {
            ProtocolFamily::Gpser => {
                let declared = self.layout.status_reply_len();
                let frame = self.request(GpserCommand::ReadStatus.encode(self.checksum)).await?;
                decode_status(frame.as_slice(), declared, &mut self.snapshot)?;
                self.read_extended().await
            }
            ProtocolFamily::Sentry => {
                let frame = self.request(SentryCommand::Request(self.level).encode()).await?;
                decode_sentry(frame.as_slice(), self.level, &mut self.snapshot)?;
                Ok(true)
            }
        }
    }

    /// Optional "RE" reply; only fatal errors escape
    async fn read_extended(&mut self) -> Result<bool> {
        match self.request(GpserCommand::ReadExtended.encode(self.checksum)).await {
            Ok(frame) => match decode_extended(frame.as_slice(), &mut self.snapshot) {
                Ok(()) => Ok(true),
                Err(e) => {
                    debug!("Get extended Ko: {}", e);
                    Ok(false)
                }
            },
            Err(e @ RielloError::Fatal(_)) => Err(e),
            Err(RielloError::Nak) => {
                debug!("Get extended Ko: command not supported");
                Ok(false)
            }
            Err(e) => {
                debug!("Get extended err: {}", e);
                Ok(false)
            }
        }
    }

    fn publish_identity(&mut self) {
        let snap = &self.snapshot;
        let sink = &mut self.sink;

        if !self.layout.input_monophase {
            sink.set_info("input.phases", "3".to_string());
            sink.set_info("input.bypass.phases", "3".to_string());
        }
        if !self.layout.output_monophase {
            sink.set_info("output.phases", "3".to_string());
        }

        sink.set_info("device.mfr", MANUFACTURER.to_string());
        sink.set_info("device.model", snap.model_name.clone());
        sink.set_info("device.serial", snap.identification.clone());
        sink.set_info("device.type", "ups".to_string());

        sink.set_info("ups.mfr", MANUFACTURER.to_string());
        sink.set_info("ups.model", snap.model_name.clone());
        sink.set_info("ups.serial", snap.identification.clone());
        sink.set_info("ups.firmware", snap.version.clone());

        sink.set_info("ups.delay.shutdown", self.settings.delays.shutdown.to_string());
        sink.set_info("ups.delay.reboot", self.settings.delays.reboot.to_string());
    }

    fn publish_nominal(&mut self) {
        let snap = &self.snapshot;
        let sink = &mut self.sink;

        sink.set_info("ups.realpower.nominal", snap.nom_power_w.to_string());
        sink.set_info("ups.power.nominal", snap.nom_power_va.to_string());
        sink.set_info("output.voltage.nominal", snap.nominal_uout.to_string());
        sink.set_info("output.frequency.nominal", tenths(snap.nom_fout, 1));
        sink.set_info("battery.voltage.nominal", snap.nom_ubat.to_string());
        sink.set_info("battery.capacity", snap.nom_bat_cap.to_string());
    }

    fn publish_status(&mut self, extended: bool) {
        let snap = &self.snapshot;
        let sink = &mut self.sink;

        sink.set_info("input.frequency", tenths(snap.finp, 2));
        sink.set_info("input.bypass.frequency", tenths(snap.fbypass, 2));
        sink.set_info("output.frequency", tenths(snap.fout, 2));
        sink.set_info("battery.voltage", tenths(snap.ubat, 1));
        sink.set_info("battery.charge", snap.bat_cap.to_string());
        if snap.bat_time != RUNTIME_UNKNOWN {
            sink.set_info("battery.runtime", (u32::from(snap.bat_time) * 60).to_string());
        }
        sink.set_info("ups.temperature", snap.tsystem.to_string());

        if self.layout.input_monophase {
            sink.set_info("input.voltage", snap.uinp1.to_string());
            sink.set_info("input.bypass.voltage", snap.ubypass1.to_string());
        } else {
            sink.set_info("input.L1-N.voltage", snap.uinp1.to_string());
            sink.set_info("input.L2-N.voltage", snap.uinp2.to_string());
            sink.set_info("input.L3-N.voltage", snap.uinp3.to_string());
            sink.set_info("input.bypass.L1-N.voltage", snap.ubypass1.to_string());
            sink.set_info("input.bypass.L2-N.voltage", snap.ubypass2.to_string());
            sink.set_info("input.bypass.L3-N.voltage", snap.ubypass3.to_string());
        }

        if self.layout.output_monophase {
            sink.set_info("output.voltage", snap.uout1.to_string());
            sink.set_info("output.power.percent", snap.pout1.to_string());
            sink.set_info("ups.load", snap.pout1.to_string());
        } else {
            sink.set_info("output.L1-N.voltage", snap.uout1.to_string());
            sink.set_info("output.L2-N.voltage", snap.uout2.to_string());
            sink.set_info("output.L3-N.voltage", snap.uout3.to_string());
            sink.set_info("output.L1.power.percent", snap.pout1.to_string());
            sink.set_info("output.L2.power.percent", snap.pout2.to_string());
            sink.set_info("output.L3.power.percent", snap.pout3.to_string());
            let load = (u32::from(snap.pout1) + u32::from(snap.pout2) + u32::from(snap.pout3)) / 3;
            sink.set_info("ups.load", load.to_string());
        }

        sink.set_status(&snap.status_flags().tokens());

        if extended {
            sink.set_info("output.L1.power", snap.pout1_va.to_string());
            sink.set_info("output.L2.power", snap.pout2_va.to_string());
            sink.set_info("output.L3.power", snap.pout3_va.to_string());
            sink.set_info("output.L1.realpower", snap.pout1_w.to_string());
            sink.set_info("output.L2.realpower", snap.pout2_w.to_string());
            sink.set_info("output.L3.realpower", snap.pout3_w.to_string());
            sink.set_info("output.L1.current", snap.iout1.to_string());
            sink.set_info("output.L2.current", snap.iout2.to_string());
            sink.set_info("output.L3.current", snap.iout3.to_string());
        }
    }

    /// Run a named instant command
    ///
    /// Commands not valid for the family or the current power state report
    /// `Unknown` without touching the device.
    ///
    /// # Errors
    ///
    /// Only fatal transport conditions are returned.
    pub async fn instcmd(&mut self, name: &str) -> Result<InstcmdStatus> {
        match InstantCommand::parse(name) {
            Some(command) => self.run_command(command).await,
            None => {
                info!("instcmd: unknown command [{}]", name);
                Ok(InstcmdStatus::Unknown)
            }
        }
    }

    async fn run_command(&mut self, command: InstantCommand) -> Result<InstcmdStatus> {
        let on_battery = self.snapshot.status_flags().on_battery;
        if !command.supported_by(self.family) || !command.allowed(on_battery) {
            info!("instcmd: command [{}] not available now", command.name());
            return Ok(InstcmdStatus::Unknown);
        }

        for frame in command.frames(self.family, self.checksum, self.settings.delays) {
            let status = self.command_reply(&frame).await?;
            if status != InstcmdStatus::Handled {
                return Ok(status);
            }
        }

        debug!("Command {} Ok", command.name());
        Ok(InstcmdStatus::Handled)
    }

    /// NAK first for command replies
    async fn command_reply(&mut self, frame: &CommandFrame) -> Result<InstcmdStatus> {
        match self.link.execute(frame).await {
            Ok(reply) if reply.nak => {
                debug!("Command {} Ko: command not supported", frame.name);
                Ok(InstcmdStatus::Failed)
            }
            Ok(reply) if reply.bad_checksum => {
                debug!("Command {} Ko: bad CRC or Checksum", frame.name);
                Ok(InstcmdStatus::Failed)
            }
            Ok(_) => Ok(InstcmdStatus::Handled),
            Err(e @ RielloError::Fatal(_)) => Err(e),
            Err(RielloError::Timeout(_)) if frame.family == ProtocolFamily::Sentry => {
                debug!("Command {}: no reply, assumed accepted", frame.name);
                Ok(InstcmdStatus::Handled)
            }
            Err(e) => {
                debug!("Command {} err: {}", frame.name, e);
                Ok(InstcmdStatus::Failed)
            }
        }
    }

    /// Cancel any pending shutdown, then shut down with return
    ///
    /// Retried up to the configured number of attempts.
    ///
    /// # Errors
    ///
    /// Returns `Protocol` when no attempt got both commands handled.
    pub async fn shutdown(&mut self) -> Result<()> {
        for attempt in 1..=self.settings.shutdown_retries {
            if self.run_command(InstantCommand::ShutdownStop).await? != InstcmdStatus::Handled {
                debug!("Shutdown attempt {}: shutdown.stop failed", attempt);
                continue;
            }
            if self.run_command(InstantCommand::ShutdownReturn).await? != InstcmdStatus::Handled {
                debug!("Shutdown attempt {}: shutdown.return failed", attempt);
                continue;
            }
            info!("Shutting down");
            return Ok(());
        }

        error!("Shutdown failed!");
        Err(RielloError::Protocol("shutdown failed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::riello::crc::append_checksum;
    use crate::riello::protocol::{ETX, GPSER_REPLY_HEADER, NAK, STX};
    use crate::state::DeviceState;
    use crate::usb::chunker::ChunkerSettings;
    use crate::usb::port_trait::mocks::ScriptedPort;
    use crate::usb::port_trait::{DeviceMatcher, MockUsbConnector, OpenedDevice};
    use crate::usb::recovery::UsbErrorKind;
    use std::time::Duration;

    const MAX_REPORTS: usize = 20;

    fn nibbles(value: u32, digits: usize) -> Vec<u8> {
        (0..digits)
            .rev()
            .map(|i| ((value >> (4 * i)) & 0x0F) as u8 + b'0')
            .collect()
    }

    fn gpser_reply(opcode: &[u8; 2], payload: &[u8]) -> Vec<u8> {
        let mut frame = GPSER_REPLY_HEADER.to_vec();
        frame.extend_from_slice(opcode);
        frame.extend_from_slice(b"00");
        frame.extend_from_slice(payload);
        append_checksum(ProtocolFamily::Gpser, &mut frame, ChecksumMode::Sum);
        frame.push(ETX);
        frame
    }

    fn gi_reply() -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(b"SN12345678901234");
        payload.extend_from_slice(b"SENTINEL DUAL   ");
        payload.extend_from_slice(b"SWM052-01-00");
        payload.extend_from_slice(b"100000040000");
        gpser_reply(b"GI", &payload)
    }

    fn gn_reply() -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend(nibbles(1500, 5));
        payload.extend(nibbles(1200, 5));
        payload.extend(nibbles(24, 3));
        payload.extend(nibbles(7, 3));
        payload.extend(nibbles(230, 3));
        payload.extend(nibbles(500, 3));
        gpser_reply(b"GN", &payload)
    }

    fn rs_reply(status: [u8; 5], bat_time: u32) -> Vec<u8> {
        let mut payload = status.to_vec();
        payload.extend(nibbles(500, 3)); // finp
        payload.extend(nibbles(229, 3)); // uinp1
        payload.extend(nibbles(500, 3)); // fout
        payload.extend(nibbles(230, 3)); // uout1
        payload.extend(nibbles(35, 2)); // pout1
        payload.extend(nibbles(499, 3)); // fbypass
        payload.extend(nibbles(231, 3)); // ubypass1
        payload.extend(nibbles(272, 4)); // ubat
        payload.extend(nibbles(98, 2)); // bat_cap
        payload.extend(nibbles(bat_time, 3));
        payload.extend(nibbles(31, 2)); // tsystem
        gpser_reply(b"RS", &payload)
    }

    fn re_reply() -> Vec<u8> {
        let mut payload = vec![b'0'; 16];
        payload.extend(nibbles(12, 4));
        payload.extend(nibbles(0, 4));
        payload.extend(nibbles(0, 4));
        payload.extend(nibbles(800, 5));
        payload.extend(nibbles(0, 5));
        payload.extend(nibbles(0, 5));
        payload.extend(nibbles(900, 5));
        payload.extend(nibbles(0, 5));
        payload.extend(nibbles(0, 5));
        gpser_reply(b"RE", &payload)
    }

    fn ack() -> Vec<u8> {
        gpser_reply(b"OK", b"")
    }

    fn sentry_frame(opcode: u8, model: u16) -> Vec<u8> {
        let mut frame = vec![0u8; 101];
        frame[0] = opcode;
        frame[1] = 103;
        frame[2..4].copy_from_slice(&model.to_le_bytes());
        frame[4..6].copy_from_slice(&1234u16.to_le_bytes());
        frame[8] = 95;
        frame[73] = 100;
        append_checksum(ProtocolFamily::Sentry, &mut frame, ChecksumMode::Sum);
        frame
    }

    fn driver_with(port: &ScriptedPort, family: FamilySelection) -> UpsDriver<DeviceState> {
        let shared = port.clone();
        let mut connector = MockUsbConnector::new();
        connector.expect_open().returning(move |_| {
            Ok(OpenedDevice {
                port: Box::new(shared.clone()),
                serial: None,
                bus: 1,
            })
        });

        let link = UsbLink::new(
            Box::new(connector),
            DeviceMatcher::new(0x04b4, 0x5500),
            ChunkerSettings {
                timeout: Duration::from_millis(10),
                write_delay: Duration::ZERO,
                read_interval: Duration::ZERO,
                max_reports: MAX_REPORTS,
            },
        );
        let settings = DriverSettings {
            family,
            ..DriverSettings::default()
        };
        UpsDriver::new(link, DeviceState::new(), settings)
    }

    /// Opcodes of every GPSER command written so far
    fn sent_opcodes(port: &ScriptedPort) -> Vec<[u8; 2]> {
        port.written()
            .iter()
            .filter(|report| report[0] == 0x37 && report[1] == STX)
            .map(|report| [report[4], report[5]])
            .collect()
    }

    async fn initialized_gpser(port: &ScriptedPort) -> UpsDriver<DeviceState> {
        port.push_reply(&gi_reply());
        port.push_reply(&gn_reply());
        port.push_reply(&[STX, 0x22, 0x20, NAK, ETX]);
        let mut driver = driver_with(port, FamilySelection::Gpser);
        driver.initialize().await.unwrap();
        driver
    }

    #[tokio::test]
    async fn test_initialize_gpser_publishes_identity() {
        let port = ScriptedPort::new();
        let driver = initialized_gpser(&port).await;

        assert_eq!(driver.family(), ProtocolFamily::Gpser);
        assert_eq!(driver.checksum_mode(), ChecksumMode::Sum);
        assert!(driver.layout().input_monophase);
        assert_eq!(driver.snapshot().num_bat, 4);

        let state = driver.sink();
        assert_eq!(state.get("device.mfr"), Some(MANUFACTURER));
        assert_eq!(state.get("ups.model"), Some("SENTINEL DUAL"));
        assert_eq!(state.get("ups.serial"), Some("SN12345678901234"));
        assert_eq!(state.get("ups.firmware"), Some("SWM052-01-00"));
        assert_eq!(state.get("ups.power.nominal"), Some("1500"));
        assert_eq!(state.get("ups.realpower.nominal"), Some("1200"));
        assert_eq!(state.get("output.frequency.nominal"), Some("50.0"));
        assert_eq!(state.get("input.phases"), None);
        assert!(state.has_command("test.panel.start"));
        assert!(state.has_command("load.on.delay"));

        assert_eq!(sent_opcodes(&port), vec![*b"GI", *b"GN", *b"RC"]);
    }

    #[tokio::test]
    async fn test_initialize_fails_on_nak_identification() {
        let port = ScriptedPort::new();
        port.push_reply(&[STX, 0x22, 0x20, NAK, ETX]);
        let mut driver = driver_with(&port, FamilySelection::Gpser);
        assert!(driver.initialize().await.is_err());
    }

    #[tokio::test]
    async fn test_update_info_publishes_status() {
        let port = ScriptedPort::new();
        let mut driver = initialized_gpser(&port).await;

        port.push_reply(&rs_reply([0x08, 0, 0x04, 0, 0], 0x0FFF));
        port.push_reply(&re_reply());
        assert!(driver.update_info().await.unwrap());

        let state = driver.sink();
        assert_eq!(state.status(), "OL CHRG");
        assert_eq!(state.get("input.frequency"), Some("50.00"));
        assert_eq!(state.get("input.voltage"), Some("229"));
        assert_eq!(state.get("battery.charge"), Some("98"));
        assert_eq!(state.get("battery.voltage"), Some("27.2"));
        // Unknown runtime is not published
        assert_eq!(state.get("battery.runtime"), None);
        assert_eq!(state.get("output.L1.current"), Some("12"));
        assert_eq!(state.get("output.L1.realpower"), Some("800"));
        assert_eq!(state.get("output.L1.power"), Some("900"));
        assert!(!state.is_stale());
    }

    #[tokio::test]
    async fn test_update_info_without_extended() {
        let port = ScriptedPort::new();
        let mut driver = initialized_gpser(&port).await;

        port.push_reply(&rs_reply([0x0A, 0, 0, 0, 0], 0x010));
        port.push_reply(&[STX, 0x22, 0x20, NAK, ETX]);
        assert!(driver.update_info().await.unwrap());

        let state = driver.sink();
        assert_eq!(state.status(), "OB");
        assert_eq!(state.get("battery.runtime"), Some("960"));
        assert_eq!(state.get("output.L1.current"), None);
    }

    #[tokio::test]
    async fn test_poll_failures_mark_stale_once_and_recover() {
        let port = ScriptedPort::new();
        let mut driver = initialized_gpser(&port).await;

        for _ in 0..9 {
            assert!(!driver.update_info().await.unwrap());
        }
        assert!(!driver.sink().is_stale());

        assert!(!driver.update_info().await.unwrap());
        assert!(driver.sink().is_stale());
        assert_eq!(driver.failures().count(), COUNTLOST);

        port.push_reply(&rs_reply([0x08, 0, 0, 0, 0], 0x010));
        port.push_reply(&re_reply());
        assert!(driver.update_info().await.unwrap());
        assert!(!driver.sink().is_stale());
        assert_eq!(driver.failures().count(), 0);
    }

    #[tokio::test]
    async fn test_bad_checksum_status_counts_as_failure() {
        let port = ScriptedPort::new();
        let mut driver = initialized_gpser(&port).await;

        let mut reply = rs_reply([0x08, 0, 0, 0, 0], 0x010);
        let tail = reply.len() - 2;
        reply[tail] = if reply[tail] == b'0' { b'1' } else { b'0' };
        port.push_reply(&reply);

        assert!(!driver.update_info().await.unwrap());
        assert_eq!(driver.failures().count(), 1);
    }

    #[tokio::test]
    async fn test_reidentify_after_reconnect() {
        let port = ScriptedPort::new();
        let mut driver = initialized_gpser(&port).await;

        port.push_read_error(UsbErrorKind::NoDevice);
        assert!(!driver.update_info().await.unwrap());

        port.push_reply(&gi_reply());
        port.push_reply(&rs_reply([0x08, 0, 0, 0, 0], 0x010));
        port.push_reply(&re_reply());
        assert!(driver.update_info().await.unwrap());

        let opcodes = sent_opcodes(&port);
        assert_eq!(opcodes.iter().filter(|op| **op == *b"GI").count(), 2);
        assert_eq!(opcodes.last(), Some(b"RE"));
    }

    #[tokio::test]
    async fn test_instcmd_gating_and_unknown() {
        let port = ScriptedPort::new();
        let mut driver = initialized_gpser(&port).await;
        let before = port.written().len();

        // On line (no status read yet): shutdown.return is not offered
        assert_eq!(
            driver.instcmd("shutdown.return").await.unwrap(),
            InstcmdStatus::Unknown
        );
        assert_eq!(
            driver.instcmd("beeper.enable").await.unwrap(),
            InstcmdStatus::Unknown
        );
        assert_eq!(port.written().len(), before);
    }

    #[tokio::test]
    async fn test_instcmd_load_off_handled() {
        let port = ScriptedPort::new();
        let mut driver = initialized_gpser(&port).await;

        port.push_reply(&ack());
        assert_eq!(driver.instcmd("load.off").await.unwrap(), InstcmdStatus::Handled);
        assert_eq!(sent_opcodes(&port).last(), Some(b"CS"));
    }

    #[tokio::test]
    async fn test_instcmd_nak_and_timeout_fail() {
        let port = ScriptedPort::new();
        let mut driver = initialized_gpser(&port).await;

        port.push_reply(&[STX, 0x22, 0x20, NAK, ETX]);
        assert_eq!(
            driver.instcmd("test.battery.start").await.unwrap(),
            InstcmdStatus::Failed
        );

        // GPSER commands without a reply fail
        assert_eq!(
            driver.instcmd("test.panel.start").await.unwrap(),
            InstcmdStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_shutdown_on_battery() {
        let port = ScriptedPort::new();
        let mut driver = initialized_gpser(&port).await;
        port.push_reply(&rs_reply([0x0A, 0, 0, 0, 0], 0x010));
        port.push_reply(&re_reply());
        driver.update_info().await.unwrap();

        port.push_reply(&ack());
        port.push_reply(&ack());
        driver.shutdown().await.unwrap();

        let opcodes = sent_opcodes(&port);
        assert_eq!(opcodes[opcodes.len() - 2..], [*b"CD", *b"CS"]);
    }

    #[tokio::test]
    async fn test_shutdown_gives_up_after_retries() {
        let port = ScriptedPort::new();
        let mut driver = initialized_gpser(&port).await;
        let before = sent_opcodes(&port).len();

        assert!(driver.shutdown().await.is_err());
        let opcodes = sent_opcodes(&port);
        assert_eq!(opcodes.len() - before, 3);
        assert!(opcodes[before..].iter().all(|op| op == b"CD"));
    }

    #[tokio::test]
    async fn test_fatal_error_propagates() {
        let port = ScriptedPort::new();
        let mut driver = initialized_gpser(&port).await;

        port.push_read_error(UsbErrorKind::Busy);
        let err = driver.update_info().await.unwrap_err();
        assert!(matches!(err, RielloError::Fatal(_)));
    }

    #[tokio::test]
    async fn test_auto_detects_sentry() {
        let port = ScriptedPort::new();
        port.push_reply(&sentry_frame(192, 1000));
        port.push_reply(&sentry_frame(192, 1000));
        let mut driver = driver_with(&port, FamilySelection::Auto);
        driver.initialize().await.unwrap();

        assert_eq!(driver.family(), ProtocolFamily::Sentry);
        assert_eq!(driver.extension_level(), ExtensionLevel::Only192);
        assert_eq!(port.written()[0][..2], [0x31, 192]);

        let state = driver.sink();
        assert_eq!(state.get("device.model"), Some("1000"));
        assert_eq!(state.get("ups.firmware"), Some("12.34"));
        assert!(state.get("ups.power.nominal").is_some());
        assert!(!state.has_command("test.panel.start"));
        assert!(state.has_command("test.battery.start"));
    }

    #[tokio::test]
    async fn test_auto_falls_back_to_gpser() {
        let port = ScriptedPort::new();
        for _ in 0..MAX_REPORTS {
            port.push_report(&[0x30, 0, 0, 0, 0, 0, 0, 0]);
        }
        port.push_reply(&gi_reply());
        let mut driver = driver_with(&port, FamilySelection::Auto);
        driver.initialize().await.unwrap();

        assert_eq!(driver.family(), ProtocolFamily::Gpser);
        assert_eq!(driver.sink().get("ups.serial"), Some("SN12345678901234"));
    }

    #[tokio::test]
    async fn test_auto_without_reply_is_not_found() {
        let port = ScriptedPort::new();
        let mut driver = driver_with(&port, FamilySelection::Auto);
        let err = driver.initialize().await.unwrap_err();
        assert!(matches!(err, RielloError::DeviceNotFound(_)));
    }

    #[tokio::test]
    async fn test_sentry_poll_and_control_timeout() {
        let port = ScriptedPort::new();
        port.push_reply(&sentry_frame(192, 1000));
        port.push_reply(&sentry_frame(192, 1000));
        let mut driver = driver_with(&port, FamilySelection::Sentry);
        driver.initialize().await.unwrap();

        port.push_reply(&sentry_frame(192, 1000));
        assert!(driver.update_info().await.unwrap());
        assert_eq!(driver.sink().get("battery.charge"), Some("95"));
        assert_eq!(driver.sink().status(), "OL");

        // SENTRY control commands often go unanswered
        assert_eq!(
            driver.instcmd("shutdown.stop").await.unwrap(),
            InstcmdStatus::Handled
        );
        assert_eq!(
            driver.instcmd("test.panel.start").await.unwrap(),
            InstcmdStatus::Unknown
        );
    }
}
