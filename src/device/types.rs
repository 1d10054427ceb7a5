use serde::Serialize;
use uuid::Uuid;

use crate::device::constants::{
    BATTERY_LEVEL_CHARACTERISTIC, NOTIFICATION_CHARACTERISTIC, SMART_WATCH_SERVICE, UPDATE_WATCH_TIME_CHARACTERISTIC,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Uninitialized,
    Initializing,
    Connected,
    Disconnected,
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let result = match self {
            ConnectionState::Uninitialized => "Uninitialized",
            ConnectionState::Initializing => "Initializing",
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Error => "Error",
        };

        write!(f, "{}", result)
    }
}

/// Why the next disconnect confirmation from the transport happens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Not requested by us: reconnect automatically.
    #[default]
    None,
    /// Pause the link but keep the session around for `reconnect`.
    UserDisconnect,
    /// Tear everything down.
    UserClose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    /// Intermediate progress (scanning, discovering, retrying...)
    Loading,
    Success,
    Error,
}

/// The watch operation an event reports the result of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    BatteryRead,
    NotificationWrite,
    WatchTimeWrite,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub kind: EventKind,
    pub battery_voltage: f32,
    pub connection_state: ConnectionState,
    pub message: String,
    /// Set on the result of a read or write, absent on lifecycle events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<Operation>,
}

/// The fixed GATT layout of the watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceProfile {
    pub service: Uuid,
    pub battery_level: Uuid,
    pub notification: Uuid,
    pub update_watch_time: Uuid,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        DeviceProfile {
            service: SMART_WATCH_SERVICE,
            battery_level: BATTERY_LEVEL_CHARACTERISTIC,
            notification: NOTIFICATION_CHARACTERISTIC,
            update_watch_time: UPDATE_WATCH_TIME_CHARACTERISTIC,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_record_serializes_camel_case() {
        let record = EventRecord {
            kind: EventKind::Success,
            battery_voltage: 3.5,
            connection_state: ConnectionState::Connected,
            message: String::from("Battery voltage 3.50 V"),
            operation: Some(Operation::BatteryRead),
        };

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["kind"], "success");
        assert_eq!(json["batteryVoltage"], 3.5);
        assert_eq!(json["connectionState"], "Connected");
        assert_eq!(json["message"], "Battery voltage 3.50 V");
        assert_eq!(json["operation"], "batteryRead");
    }

    #[test]
    fn lifecycle_events_have_no_operation_field() {
        let record = EventRecord {
            kind: EventKind::Loading,
            battery_voltage: 0.0,
            connection_state: ConnectionState::Initializing,
            message: String::from("Scanning BLE devices..."),
            operation: None,
        };

        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("operation").is_none());
    }

    #[test]
    fn disconnect_reason_defaults_to_none() {
        assert_eq!(DisconnectReason::default(), DisconnectReason::None);
    }
}
