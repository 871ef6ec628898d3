use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Which of the two trackers an issue, write or attachment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Source,
    Target,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::Source => Side::Target,
            Side::Target => Side::Source,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Source => f.write_str("source"),
            Side::Target => f.write_str("target"),
        }
    }
}

/// Read-only projection of one tracker issue at sync time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueSnapshot {
    pub key: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
    pub updated: DateTime<Utc>,
    pub issue_type: String,
}

impl IssueSnapshot {
    /// Field value, treating JSON null the same as an absent field.
    pub fn field(&self, field_id: &str) -> Option<&Value> {
        self.fields.get(field_id).filter(|v| !v.is_null())
    }
}

/// One attachment as listed on an issue. Identity is the filename.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRecord {
    pub owning_issue_key: String,
    pub filename: String,
    /// Opaque handle the owning tracker resolves to bytes (a content URL for Jira).
    pub bytes_ref: String,
    pub origin_side: Side,
}

/// Parse the timestamp shapes trackers hand back: Jira's
/// `2023-12-10T10:00:00.000+0800`, RFC 3339, an offset-less ISO datetime
/// (read as UTC), or a bare date.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Render a timestamp the way Jira datetime fields accept it.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.3f%z").to_string()
}
