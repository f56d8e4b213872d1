//! Inbound record shape and derived claim state
//!
//! Every upstream source is normalized to [`RawRecord`] before it reaches the
//! identity resolver; nothing downstream branches on source shape.

use chrono::{DateTime, Utc};
use clientsync_common::time::flexible;
use serde::{Deserialize, Deserializer, Serialize};

/// One contact/enquiry row from any source. Never mutated after read.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRecord {
    /// Upstream identifier; numeric ids are accepted and kept as text,
    /// a missing or null id reads as empty
    #[serde(default, deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    /// Free-text owner / claim marker
    #[serde(default)]
    pub point_of_contact: String,
    #[serde(default, with = "flexible")]
    pub touchpoint_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub area_of_work: String,
    /// Originating data source
    #[serde(default)]
    pub source_tag: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IdRepr {
    Text(String),
    Integer(i64),
}

fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<IdRepr>::deserialize(deserializer)? {
        Some(IdRepr::Text(s)) => s.trim().to_string(),
        Some(IdRepr::Integer(n)) => n.to_string(),
        None => String::new(),
    })
}

/// Ownership state derived from `point_of_contact`
///
/// Ordering follows the status rank: `Unclaimed < Triaged < Claimed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimState {
    Unclaimed,
    Triaged,
    Claimed,
}

impl ClaimState {
    /// Ordinal tie-break rank (0, 1, 2)
    pub fn rank(&self) -> u8 {
        match self {
            ClaimState::Unclaimed => 0,
            ClaimState::Triaged => 1,
            ClaimState::Claimed => 2,
        }
    }
}
