//! Types persisted to the data lists or published on pub/sub channels.

use serde::{Deserialize, Serialize};

/// Marker every payload must start with, naming the encryption envelope.
pub const PAYLOAD_MARKER: &str = "v1.naclbox.";

/// Value of `perf` when the client did not report one.
pub const PERF_NOT_PROVIDED: i64 = -1;

/// The unit appended to a project's data list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SerializedMessage {
    /// Encrypted payload, never inspected past [`PAYLOAD_MARKER`]
    pub payload: String,
    /// Server admission time, milliseconds since the epoch
    pub received: i64,
    /// Client-side serialization and encryption time in milliseconds
    pub perf: i64,
    /// Country code of origin, as reported by the edge network
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

/// Published on [`Channel::OverLimit`] when a project exceeds its daily limit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverageStats {
    #[serde(rename = "projectID")]
    pub project_id: String,
    pub usage: u64,
    pub over_usage: u64,
    pub current_time: i64,
    pub remaining_time: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    NewDataAvailable,
    OverLimit,
}

impl Channel {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Channel::NewDataAvailable => "push:new-data-available",
            Channel::OverLimit => "push:over-limit",
        }
    }
}

/// Coerces the `perf` query value to an integer.
///
/// Leading whitespace, an optional sign and the leading decimal digits are
/// used; anything else (or nothing at all) yields [`PERF_NOT_PROVIDED`].
/// Zero is indistinguishable from a missing value and maps to
/// [`PERF_NOT_PROVIDED`] as well.
pub fn parse_perf(raw: Option<&str>) -> i64 {
    let Some(raw) = raw else {
        return PERF_NOT_PROVIDED;
    };
    let trimmed = raw.trim_start();
    let (negative, rest) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };
    let digits_len = rest.bytes().take_while(u8::is_ascii_digit).count();
    match rest[..digits_len].parse::<i64>() {
        Ok(0) | Err(_) => PERF_NOT_PROVIDED,
        Ok(value) if negative => -value,
        Ok(value) => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_perf() {
        assert_eq!(parse_perf(None), -1);
        assert_eq!(parse_perf(Some("")), -1);
        assert_eq!(parse_perf(Some("42")), 42);
        assert_eq!(parse_perf(Some(" 42ms")), 42);
        assert_eq!(parse_perf(Some("-7")), -7);
        assert_eq!(parse_perf(Some("abc")), -1);
        assert_eq!(parse_perf(Some("-")), -1);
        assert_eq!(parse_perf(Some("99999999999999999999999")), -1);
    }

    #[test]
    fn test_parse_perf_zero_is_not_provided() {
        assert_eq!(parse_perf(Some("0")), PERF_NOT_PROVIDED);
        assert_eq!(parse_perf(Some("-0")), PERF_NOT_PROVIDED);
        assert_eq!(parse_perf(Some("00ms")), PERF_NOT_PROVIDED);
        assert_eq!(parse_perf(Some("01")), 1);
    }

    #[test]
    fn test_message_json_shape() {
        let message = SerializedMessage {
            payload: "v1.naclbox.foo".into(),
            received: 1_577_836_800_000,
            perf: -1,
            country: None,
        };
        let json: serde_json::Value = serde_json::to_value(&message).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "payload": "v1.naclbox.foo",
                "received": 1_577_836_800_000_i64,
                "perf": -1,
            })
        );

        let with_country = SerializedMessage {
            country: Some("FR".into()),
            ..message
        };
        let json = serde_json::to_value(&with_country).unwrap();
        assert_eq!(json["country"], "FR");
    }

    #[test]
    fn test_overage_stats_field_names() {
        let stats = OverageStats {
            project_id: "bar".into(),
            usage: 3,
            over_usage: 1,
            current_time: 10,
            remaining_time: 20,
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "projectID": "bar",
                "usage": 3,
                "overUsage": 1,
                "currentTime": 10,
                "remainingTime": 20,
            })
        );
    }
}
