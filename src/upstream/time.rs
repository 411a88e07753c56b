// Flexible timestamp parsing — the catalog occasionally omits the timezone
// (e.g. "2025-04-14T02:31:00.353"); such values are treated as UTC.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer};

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"];

fn parse(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in NAIVE_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, format) {
            return Some(parsed.and_utc());
        }
    }
    None
}

/// Deserialize an optional timestamp. Null and empty strings map to `None`.
pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    let value = match raw {
        None => return Ok(None),
        Some(value) => value,
    };

    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    parse(trimmed)
        .map(Some)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid time {trimmed:?}")))
}
