//! # UPS Driver Module
//!
//! Drives a Riello UPS end to end on top of the USB link.
//!
//! This module handles:
//! - Detecting the protocol family and identifying the unit
//! - Reading nominal ratings and periodic status
//! - Publishing values and the status word to a [`StateSink`](crate::state::StateSink)
//! - Marking data stale after repeated poll failures
//! - Instant commands and the shutdown sequence
//! - Identifying the unit again after the link reopens it

pub mod driver;
pub mod instcmd;
pub mod poll;

pub use driver::{DriverSettings, FamilySelection, UpsDriver, MANUFACTURER};
pub use instcmd::{CommandDelays, InstantCommand, InstcmdStatus};
pub use poll::{PollEvent, PollFailureCounter, COUNTLOST};
