//! Wall-clock helpers and defensive normalisation of remote timestamps.
//!
//! The remote store hands back timestamps in three shapes depending on the
//! writer: `{seconds, nanoseconds}` pairs, ISO-8601 strings, or raw
//! milliseconds. Everything is normalised to epoch milliseconds on entry;
//! garbage defaults to "now" with a warning rather than failing a hydration.

use crate::TimestampMs;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::time::{SystemTime, UNIX_EPOCH};

const MS_PER_YEAR: i64 = 365 * 24 * 60 * 60 * 1000;

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> TimestampMs {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// The shapes a remote timestamp may arrive in.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RemoteTimestamp {
    Epoch { seconds: i64, nanoseconds: u32 },
    Millis(i64),
    Iso(String),
}

/// Normalises an arbitrary remote timestamp value to epoch milliseconds.
///
/// Unparseable values fall back to `now` (logged). Parseable values more
/// than a year away from `now` in either direction are clamped to `now` —
/// devices with a wildly wrong clock must not poison ordering.
pub fn normalize_timestamp(raw: &serde_json::Value, now: TimestampMs) -> TimestampMs {
    let parsed = match serde_json::from_value::<RemoteTimestamp>(raw.clone()) {
        Ok(RemoteTimestamp::Epoch {
            seconds,
            nanoseconds,
        }) => Some(
            seconds
                .saturating_mul(1000)
                .saturating_add(i64::from(nanoseconds) / 1_000_000),
        ),
        Ok(RemoteTimestamp::Millis(ms)) => Some(ms),
        Ok(RemoteTimestamp::Iso(text)) => DateTime::parse_from_rfc3339(&text)
            .map(|dt| dt.timestamp_millis())
            .ok(),
        Err(_) => None,
    };
    match parsed {
        Some(ms) => clamp_timestamp(ms, now),
        None => {
            tracing::warn!(target: "time", value = %raw, "unparseable remote timestamp, using now");
            now
        }
    }
}

/// Clamps a timestamp to within one year of `now`.
pub fn clamp_timestamp(ts: TimestampMs, now: TimestampMs) -> TimestampMs {
    if ts < now - MS_PER_YEAR || ts > now + MS_PER_YEAR {
        tracing::warn!(target: "time", ts, now, "timestamp outside plausible window, clamping");
        now
    } else {
        ts
    }
}

/// Renders a timestamp as an RFC 3339 string (millisecond precision).
pub fn to_iso(ts: TimestampMs) -> String {
    match Utc.timestamp_millis_opt(ts) {
        chrono::LocalResult::Single(dt) => dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        _ => Utc
            .timestamp_millis_opt(0)
            .single()
            .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NOW: TimestampMs = 1_700_000_000_000;

    #[test]
    fn test_millis_pass_through() {
        assert_eq!(normalize_timestamp(&json!(NOW - 5_000), NOW), NOW - 5_000);
    }

    #[test]
    fn test_seconds_nanos_pair() {
        let raw = json!({"seconds": 1_700_000_000u64, "nanoseconds": 500_000_000u32});
        assert_eq!(normalize_timestamp(&raw, NOW), 1_700_000_000_500);
    }

    #[test]
    fn test_iso_string() {
        let raw = json!("2023-11-14T22:13:20Z");
        assert_eq!(normalize_timestamp(&raw, NOW), 1_700_000_000_000);
    }

    #[test]
    fn test_garbage_defaults_to_now() {
        assert_eq!(normalize_timestamp(&json!("not a date"), NOW), NOW);
        assert_eq!(normalize_timestamp(&json!(["nope"]), NOW), NOW);
        assert_eq!(normalize_timestamp(&serde_json::Value::Null, NOW), NOW);
    }

    #[test]
    fn test_far_future_clamped() {
        let far = NOW + 2 * MS_PER_YEAR;
        assert_eq!(normalize_timestamp(&json!(far), NOW), NOW);
    }

    #[test]
    fn test_epoch_boundary_clamped_not_thrown() {
        assert_eq!(normalize_timestamp(&json!(0), NOW), NOW);
        assert_eq!(clamp_timestamp(i64::MIN, NOW), NOW);
        assert_eq!(clamp_timestamp(i64::MAX, NOW), NOW);
    }

    #[test]
    fn test_to_iso_round_trip() {
        let iso = to_iso(1_700_000_000_500);
        assert_eq!(normalize_timestamp(&json!(iso), NOW), 1_700_000_000_500);
    }
}
