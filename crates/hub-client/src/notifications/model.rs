use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

pub type NotificationId = u64;

/// A server-generated notification.
///
/// Accepts both the REST shape (`created_at` as RFC 3339) and the push shape
/// (`created_at` as `YYYY-MM-DD HH:MM`, with the origin in `type`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub message: String,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(rename = "type", alias = "source_type", default = "default_source_type")]
    pub source_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
}

impl Notification {
    pub fn new(id: NotificationId, message: impl Into<String>) -> Self {
        Self {
            id,
            message: message.into(),
            created_at: Utc::now(),
            is_read: false,
            source_type: default_source_type(),
            sender: None,
        }
    }

    pub fn with_source_type(mut self, source_type: impl Into<String>) -> Self {
        self.source_type = source_type.into();
        self
    }

    pub fn read(mut self) -> Self {
        self.is_read = true;
        self
    }
}

fn default_source_type() -> String {
    "notification".to_string()
}

const NAIVE_FORMATS: &[&str] = &["%Y-%m-%d %H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"];

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    // Naive timestamps are server time, which is UTC.
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(raw.trim())
        .ok_or_else(|| serde::de::Error::custom(format!("unrecognized timestamp: {raw}")))
}
