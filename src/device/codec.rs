//! Wire formats of the SmartWatchService characteristics.
//!
//! - battery level: 4 bytes, little-endian f32 volts
//! - notification: utf-8 `app:title:body:timestamp`
//! - time update: 8 bytes, big-endian i64 seconds
//!
//! Timestamps sent to the watch are "local epoch seconds": unix time shifted by the local UTC
//! offset in effect at that instant, because the watch has no notion of time zones.

use std::fmt;
use chrono::{DateTime, Local, Offset, TimeZone, Utc};

use crate::error::PayloadError;

pub const BATTERY_PAYLOAD_LEN: usize = 4;
pub const TIME_SYNC_PAYLOAD_LEN: usize = 8;

const FIELD_DELIMITER: char = ':';
const DELIMITER_REPLACEMENT: char = ';';
const NO_TITLE: &str = "[No Title]";
const NO_TEXT: &str = "[No Text]";

pub fn decode_battery_voltage(value: &[u8]) -> Result<f32, PayloadError> {
    let bytes: [u8; BATTERY_PAYLOAD_LEN] = value.try_into().map_err(|_| PayloadError::WrongLength {
        payload: "Battery voltage",
        expected: BATTERY_PAYLOAD_LEN,
        actual: value.len(),
    })?;

    Ok(f32::from_le_bytes(bytes))
}

/// Unix seconds of `instant`, shifted by the UTC offset (including DST) of `zone` at that instant.
pub fn local_epoch_seconds<Tz: TimeZone>(instant: DateTime<Utc>, zone: &Tz) -> i64 {
    let offset_millis = i64::from(zone.offset_from_utc_datetime(&instant.naive_utc()).fix().local_minus_utc()) * 1000;
    (instant.timestamp_millis() + offset_millis) / 1000
}

pub fn encode_time_sync(seconds: i64) -> [u8; TIME_SYNC_PAYLOAD_LEN] {
    let mut remaining = seconds;
    let mut result = [0u8; TIME_SYNC_PAYLOAD_LEN];

    // most significant byte first
    for byte in result.iter_mut().rev() {
        *byte = (remaining & 0xFF) as u8;
        remaining >>= 8;
    }

    result
}

/// Time update payload for the current instant in the local time zone.
pub fn time_sync_payload_now() -> [u8; TIME_SYNC_PAYLOAD_LEN] {
    encode_time_sync(local_epoch_seconds(Utc::now(), &Local))
}

fn escape_field(value: &str) -> String {
    value.replace(FIELD_DELIMITER, &DELIMITER_REPLACEMENT.to_string())
}

/// A captured phone notification, ready to be forwarded to the watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub app_name: String,
    pub title: Option<String>,
    pub body: Option<String>,
    /// Local epoch seconds, see [`local_epoch_seconds`].
    pub timestamp: i64,
}

impl Notification {
    pub fn posted_at(app_name: String, title: Option<String>, body: Option<String>, posted: DateTime<Utc>) -> Self {
        Notification {
            app_name,
            title,
            body,
            timestamp: local_epoch_seconds(posted, &Local),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let title = self.title.as_deref().map(escape_field).unwrap_or_else(|| NO_TITLE.to_string());
        let body = self.body.as_deref().map(escape_field).unwrap_or_else(|| NO_TEXT.to_string());

        write!(
            f,
            "{}{d}{}{d}{}{d}{}",
            escape_field(&self.app_name),
            title,
            body,
            self.timestamp,
            d = FIELD_DELIMITER,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;

    #[test]
    fn decodes_little_endian_voltage() {
        assert_eq!(decode_battery_voltage(&[0x00, 0x00, 0x80, 0x3F]), Ok(1.0));
        assert_eq!(decode_battery_voltage(&3.7_f32.to_le_bytes()), Ok(3.7));
    }

    #[test]
    fn rejects_undersized_battery_payload() {
        assert_eq!(
            decode_battery_voltage(&[0x00, 0x80, 0x3F]),
            Err(PayloadError::WrongLength { payload: "Battery voltage", expected: 4, actual: 3 })
        );
        assert!(decode_battery_voltage(&[0; 8]).is_err());
    }

    #[test]
    fn notification_escapes_delimiters() {
        let notification = Notification {
            app_name: String::from("App"),
            title: Some(String::from("A:B")),
            body: Some(String::from("ok")),
            timestamp: 100,
        };

        assert_eq!(notification.to_string(), "App:A;B:ok:100");
        assert_eq!(notification.encode(), b"App:A;B:ok:100".to_vec());
    }

    #[test]
    fn notification_defaults_missing_fields() {
        let notification = Notification {
            app_name: String::from("Mail: Inbox"),
            title: None,
            body: None,
            timestamp: 0,
        };

        assert_eq!(notification.to_string(), "Mail; Inbox:[No Title]:[No Text]:0");
    }

    #[test]
    fn notification_is_utf8() {
        let notification = Notification {
            app_name: String::from("Chat"),
            title: Some(String::from("Zoë")),
            body: Some(String::from("café ☕")),
            timestamp: 7,
        };

        assert_eq!(String::from_utf8(notification.encode()).unwrap(), "Chat:Zoë:café ☕:7");
    }

    #[test]
    fn time_sync_is_big_endian() {
        assert_eq!(encode_time_sync(1), [0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(encode_time_sync(0x0102_0304_0506_0708), [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(encode_time_sync(1_700_000_000), 1_700_000_000_i64.to_be_bytes());
    }

    #[test]
    fn local_epoch_applies_offset() {
        let instant = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let amsterdam_winter = FixedOffset::east_opt(3600).unwrap();
        let new_york_winter = FixedOffset::west_opt(5 * 3600).unwrap();

        assert_eq!(local_epoch_seconds(instant, &Utc), 1_700_000_000);
        assert_eq!(local_epoch_seconds(instant, &amsterdam_winter), 1_700_003_600);
        assert_eq!(local_epoch_seconds(instant, &new_york_winter), 1_699_982_000);
    }

    #[test]
    fn local_epoch_truncates_to_whole_seconds() {
        let instant = Utc.timestamp_millis_opt(1_999).unwrap();
        assert_eq!(local_epoch_seconds(instant, &Utc), 1);
    }
}
