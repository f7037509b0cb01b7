//! Serde helpers for the optional `date` of transaction events.
//!
//! Producers send either a bare "YYYY-MM-DD" or a full RFC 3339 timestamp. A
//! timestamp keeps its time of day and offset; a bare date is midnight UTC.
//! Both are written back as RFC 3339.

use chrono::{DateTime, FixedOffset, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Serialize Option<DateTime<FixedOffset>> as null or RFC 3339.
/// Used with #[serde(serialize_with = "crate::utils::date::serialize_opt")].
pub fn serialize_opt<S>(date: &Option<DateTime<FixedOffset>>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match date {
        Some(ts) => ts
            .to_rfc3339_opts(SecondsFormat::AutoSi, true)
            .serialize(serializer),
        None => serializer.serialize_none(),
    }
}

/// Deserialize Option<DateTime<FixedOffset>> from null, "", "YYYY-MM-DD" or an
/// RFC 3339 timestamp.
pub fn deserialize_opt<'de, D>(deserializer: D) -> Result<Option<DateTime<FixedOffset>>, D::Error>
where
    D: Deserializer<'de>,
{
    let opt = Option::<String>::deserialize(deserializer)?;
    match opt {
        None => Ok(None),
        Some(s) if s.is_empty() => Ok(None),
        Some(s) => parse(&s).map(Some).map_err(serde::de::Error::custom),
    }
}

/// Deserialize Option<DateTime<Utc>> from null, "" or a timestamp.
pub fn deserialize_utc_opt<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let opt = Option::<String>::deserialize(deserializer)?;
    match opt {
        None => Ok(None),
        Some(s) if s.is_empty() => Ok(None),
        Some(s) => s
            .parse::<DateTime<Utc>>()
            .map(Some)
            .map_err(|e| serde::de::Error::custom(format!("invalid timestamp {:?}: {}", s, e))),
    }
}

fn parse(s: &str) -> Result<DateTime<FixedOffset>, String> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Ok(ts);
    }
    NaiveDate::parse_from_str(s, DATE_FORMAT)
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|midnight| midnight.and_utc().fixed_offset())
        .ok_or_else(|| format!("invalid date {:?}: expected YYYY-MM-DD or RFC 3339", s))
}
