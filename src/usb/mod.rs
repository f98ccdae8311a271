//! # USB Transport Module
//!
//! Talks to the Cypress USB-serial bridge built into Riello units.
//!
//! This module handles:
//! - Device lookup by vendor/product with optional serial and bus filters
//! - Splitting frames into 8-byte reports and feeding replies to the assembler
//! - Classifying transfer errors into recovery actions
//! - Holding the device handle across failures and reopening it on demand

pub mod chunker;
pub mod link;
pub mod port_trait;
pub mod recovery;

pub use chunker::{ChunkerSettings, TransportChunker};
pub use link::{ConnectionState, UsbLink};
pub use port_trait::{DeviceMatcher, NusbConnector, OpenedDevice, UsbConnector, UsbPort};
pub use recovery::{classify, Recovery, UsbErrorKind};
