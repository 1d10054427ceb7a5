use serde::{Deserialize, Serialize};

use crate::device::constants::{DEVICE_NAME, EVENT_CHANNEL_CAPACITY, MAX_CONNECTION_ATTEMPTS, TARGET_MTU};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Advertised name of the watch, matched exactly.
    pub device_name: String,
    pub max_connection_attempts: u32,
    pub target_mtu: u16,
    pub event_channel_capacity: usize,
}

impl Config {
    /// Replaces values that would make the link unusable with their defaults.
    pub fn sanitize(&mut self) {
        let defaults = Config::default();

        if self.device_name.trim().is_empty() {
            self.device_name = defaults.device_name;
        }
        if self.event_channel_capacity == 0 {
            self.event_channel_capacity = defaults.event_channel_capacity;
        }
        // 23 bytes is the minimum ATT MTU
        self.target_mtu = self.target_mtu.clamp(23, TARGET_MTU);
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            device_name: String::from(DEVICE_NAME),
            max_connection_attempts: MAX_CONNECTION_ATTEMPTS,
            target_mtu: TARGET_MTU,
            event_channel_capacity: EVENT_CHANNEL_CAPACITY,
        }
    }
}
