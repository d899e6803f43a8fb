//! Small helpers shared by the engine crates.
//!
//! - [`Counter`]: an atomic gauge with a high-water mark, used for engine statistics
//! - duration parsing (`"1m30s"`, `"250ms"`) and the matching serde helpers
//! - wall-clock timestamps in seconds and milliseconds
//!
//! ```
//! use mqengine_utils::to_duration;
//!
//! assert_eq!(to_duration("1m30s").as_secs(), 90);
//! assert_eq!(to_duration("250ms").as_millis(), 250);
//! ```

#![deny(unsafe_code)]

use std::time::Duration;

use serde::de::{Deserialize, Deserializer};

mod counter;

pub use counter::Counter;

/// Seconds since the Unix epoch
pub type Timestamp = i64;

/// Milliseconds since the Unix epoch
pub type TimestampMillis = i64;

/// Parse a duration made of `<number><unit>` groups.
///
/// Units: `ms`, `s`, `m`, `h`, `d`, `w`. A bare number is read as seconds.
/// Malformed groups contribute nothing.
pub fn to_duration(text: &str) -> Duration {
    let text = text.trim().to_ascii_lowercase();
    if let Ok(secs) = text.parse::<u64>() {
        return Duration::from_secs(secs);
    }

    let mut total_ms: u64 = 0;
    let mut digits = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let value = digits.parse::<u64>().unwrap_or(0);
        digits.clear();
        let factor = match c {
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                1
            }
            's' => 1_000,
            'm' => 60_000,
            'h' => 3_600_000,
            'd' => 86_400_000,
            'w' => 604_800_000,
            _ => 0,
        };
        total_ms = total_ms.saturating_add(value.saturating_mul(factor));
    }
    Duration::from_millis(total_ms)
}

#[inline]
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let v = String::deserialize(deserializer)?;
    Ok(to_duration(&v))
}

/// An empty string deserializes to `None`
#[inline]
pub fn deserialize_duration_option<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = String::deserialize(deserializer)?;
    if v.trim().is_empty() {
        Ok(None)
    } else {
        Ok(Some(to_duration(&v)))
    }
}

#[inline]
pub fn timestamp_secs() -> Timestamp {
    chrono::Utc::now().timestamp()
}

#[inline]
pub fn timestamp_millis() -> TimestampMillis {
    chrono::Utc::now().timestamp_millis()
}

/// Local time rendering used in dumps and log lines, empty for non-positive input
pub fn format_timestamp_millis(t: TimestampMillis) -> String {
    use chrono::TimeZone;
    if t <= 0 {
        return String::new();
    }
    match chrono::Local.timestamp_millis_opt(t) {
        chrono::LocalResult::Single(t) => t.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_duration() {
        assert_eq!(to_duration("10ms"), Duration::from_millis(10));
        assert_eq!(to_duration("1h30m15s").as_secs(), 5415);
        assert_eq!(to_duration("2d").as_secs(), 172_800);
        assert_eq!(to_duration("45"), Duration::from_secs(45));
        assert_eq!(to_duration("1m500ms"), Duration::from_millis(60_500));
        assert_eq!(to_duration("abc"), Duration::ZERO);
    }

    #[test]
    fn test_timestamps() {
        let ms = timestamp_millis();
        let s = timestamp_secs();
        assert!(ms / 1000 - s <= 1);
        assert!(!format_timestamp_millis(ms).is_empty());
        assert!(format_timestamp_millis(0).is_empty());
    }
}
