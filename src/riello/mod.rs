//! # Riello Protocol Module
//!
//! Implementation of the Riello GPSER and SENTRY UPS protocols.
//!
//! This module handles:
//! - GPSER CRC and checksum, SENTRY byte sum
//! - Byte-stream frame reassembly with NAK and checksum classification
//! - Command frame encoding for both families
//! - Reply decoding into a telemetry snapshot

pub mod protocol;
pub mod crc;
pub mod assembler;
pub mod encoder;
pub mod decoder;
