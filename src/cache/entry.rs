//! Cache entry records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier of a cached value. Also names its object on disk, so
/// only ASCII alphanumerics, `-` and `_` are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntryId(String);

impl EntryId {
    /// Fresh random id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Validate an externally supplied id
    pub fn parse(raw: &str) -> Result<Self, String> {
        if raw.len() < 2 {
            return Err(format!("entry id '{}' is too short", raw));
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(format!("entry id '{}' contains invalid characters", raw));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First two characters, used to fan objects out over subdirectories
    pub fn shard(&self) -> &str {
        &self.0[..2]
    }

    /// Short form for display (first 12 chars)
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl TryFrom<String> for EntryId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<EntryId> for String {
    fn from(id: EntryId) -> Self {
        id.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Public view of one cached value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub id: EntryId,
    pub description: String,
    pub disk_space_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    /// True while at least one live session holds a reference
    #[serde(default)]
    pub actively_used: bool,
}
