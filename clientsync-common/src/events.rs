//! Claim change event types
//!
//! Shared event definitions for the live-update channel. A [`Change`] is what
//! producers (the claim trigger and the change detector) hand to the broadcast
//! hub; the hub stamps it with a sequence id, producing a [`ChangeEvent`] that
//! is serialized for SSE transmission.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of change carried by a live event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    /// Ownership of an entity changed
    Claim,
    /// Entity observed for the first time without an owner
    Created,
    /// Entity removed upstream
    Deleted,
}

impl ChangeType {
    /// SSE `event:` field value
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Claim => "claim",
            ChangeType::Created => "created",
            ChangeType::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unsequenced change, as produced by the claim trigger or change detector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    pub change_type: ChangeType,
    pub entity_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    /// Originating data source tag, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Change {
    /// Ownership change for `entity_id`
    pub fn claim(
        entity_id: impl Into<String>,
        claimed_by: Option<String>,
        claimed_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            change_type: ChangeType::Claim,
            entity_id: entity_id.into(),
            claimed_by,
            claimed_at,
            source: None,
            timestamp: crate::time::now(),
        }
    }

    /// Change of an arbitrary type with no owner information
    pub fn bare(change_type: ChangeType, entity_id: impl Into<String>) -> Self {
        Self {
            change_type,
            entity_id: entity_id.into(),
            claimed_by: None,
            claimed_at: None,
            source: None,
            timestamp: crate::time::now(),
        }
    }

    /// Attach the originating data source tag
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Stamp with a hub-assigned sequence id
    pub fn sequenced(self, sequence_id: u64) -> ChangeEvent {
        ChangeEvent {
            sequence_id,
            change: self,
        }
    }
}

/// Sequenced change event, the wire shape of a domain event on the live channel
///
/// ```text
/// { sequenceId, changeType, entityId, claimedBy?, claimedAt?, source?, timestamp }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    /// Strictly increasing per hub instance
    pub sequence_id: u64,
    #[serde(flatten)]
    pub change: Change,
}

impl ChangeEvent {
    pub fn change_type(&self) -> ChangeType {
        self.change.change_type
    }

    pub fn entity_id(&self) -> &str {
        &self.change.entity_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_change_event_wire_shape() {
        let claimed_at = Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap();
        let event = Change::claim("42", Some("AB".to_string()), Some(claimed_at))
            .with_source("enquiries")
            .sequenced(7);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["sequenceId"], 7);
        assert_eq!(json["changeType"], "claim");
        assert_eq!(json["entityId"], "42");
        assert_eq!(json["claimedBy"], "AB");
        assert_eq!(json["claimedAt"], "2024-03-01T09:30:00Z");
        assert_eq!(json["source"], "enquiries");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_optional_fields_omitted() {
        let event = Change::bare(ChangeType::Deleted, "9").sequenced(1);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["changeType"], "deleted");
        assert!(json.get("claimedBy").is_none());
        assert!(json.get("claimedAt").is_none());
        assert!(json.get("source").is_none());
    }

    #[test]
    fn test_change_event_deserializes() {
        let raw = r#"{"sequenceId":3,"changeType":"created","entityId":"x","timestamp":"2024-01-01T00:00:00Z"}"#;
        let event: ChangeEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.sequence_id, 3);
        assert_eq!(event.change_type(), ChangeType::Created);
        assert_eq!(event.entity_id(), "x");
    }
}
