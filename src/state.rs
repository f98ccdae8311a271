//! # Device State
//!
//! The key/value store the driver publishes into. A monitoring daemon would
//! implement [`StateSink`] over its own store; [`DeviceState`] keeps
//! everything in memory for the bundled binary and for tests.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

/// Receiver of published UPS state
pub trait StateSink: Send {
    /// Set one named variable
    fn set_info(&mut self, key: &str, value: String);

    /// Replace the status word with `tokens`
    fn set_status(&mut self, tokens: &[&str]);

    /// Advertise an instant command
    fn add_command(&mut self, name: &str);

    /// Published data no longer reflects the device
    fn data_stale(&mut self);

    /// Published data is current again
    fn data_ok(&mut self);
}

/// In-memory [`StateSink`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceState {
    values: BTreeMap<String, String>,
    status: String,
    commands: BTreeSet<String>,
    stale: bool,
}

impl DeviceState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn values(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    /// Space-separated status word, e.g. `"OL CHRG"`
    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn commands(&self) -> impl Iterator<Item = &str> {
        self.commands.iter().map(String::as_str)
    }

    pub fn has_command(&self, name: &str) -> bool {
        self.commands.contains(name)
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }
}

impl StateSink for DeviceState {
    fn set_info(&mut self, key: &str, value: String) {
        self.values.insert(key.to_string(), value);
    }

    fn set_status(&mut self, tokens: &[&str]) {
        self.status = tokens.join(" ");
    }

    fn add_command(&mut self, name: &str) {
        self.commands.insert(name.to_string());
    }

    fn data_stale(&mut self) {
        self.stale = true;
    }

    fn data_ok(&mut self) {
        self.stale = false;
    }
}
