//! # Riello UPS Library
//!
//! Protocol engine for Riello UPS units speaking GPSER or SENTRY over the
//! Cypress USB-to-serial chunk transport.
//!
//! The [`riello`] module frames, checks and decodes the wire protocol,
//! [`usb`] moves frames across 8-byte interrupt reports and recovers from
//! transfer errors, and [`ups`] drives identification, polling, instant
//! commands and shutdown on top of them.

pub mod config;
pub mod error;
pub mod riello;
pub mod state;
pub mod telemetry;
pub mod ups;
pub mod usb;
