use anyhow::{anyhow, Result};
use chrono::{Local, NaiveDateTime};

/// Formats accepted for timestamps scraped off the feed surface.
///
/// The feed reports second precision at best; some entries omit the seconds
/// entirely ("2023-12-25 16:58").
const FEED_TIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
];

/// Current local time, naive (the feed surface reports local wall-clock times)
pub fn now() -> NaiveDateTime {
    Local::now().naive_local()
}

/// Compact timestamp used for batch filenames and diagnostic screenshots
pub fn dt_stamp(dt: NaiveDateTime) -> String {
    dt.format("%Y%m%d%H%M%S").to_string()
}

/// Parse a timestamp as reported by the feed surface
pub fn parse_feed_time(text: &str) -> Result<NaiveDateTime> {
    let text = text.trim();
    for format in FEED_TIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(dt);
        }
    }
    Err(anyhow!("unrecognized feed timestamp: {text}"))
}

/// ISO-8601 serialization for store-persisted timestamps
pub fn to_iso(dt: NaiveDateTime) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S").to_string()
}

/// Inverse of [`to_iso`]; also tolerates the feed's space-separated form
pub fn from_iso(text: &str) -> Result<NaiveDateTime> {
    parse_feed_time(text)
}
