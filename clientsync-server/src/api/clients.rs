//! Grouped client view
//!
//! Groups a posted batch of records by identity and, when a scope is given,
//! runs the dedup ranking over the same batch. Results are cached under
//! `clients:{viewer}:{sha256 of request}` so claim invalidation evicts them.
//!
//! Records that fail to parse are counted in `dropped`; they never reject
//! the batch.

use axum::{extract::State, Json};
use clientsync_common::Error;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::api::ApiError;
use crate::dedup::{resolve_buckets, suppressed_ids, DedupScope, FuzzyBucket};
use crate::grouping::{group_records, ClientEntry, ClientGroup};
use crate::model::RawRecord;
use crate::AppState;

/// Request body
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupRequest {
    /// Raw record objects; each is parsed on its own
    pub records: Vec<Value>,
    /// `owner-scoped` or `unscoped`; inferred as owner-scoped when only a viewer is given
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub viewer: Option<String>,
}

impl GroupRequest {
    fn dedup_scope(&self) -> Result<Option<DedupScope>, Error> {
        let viewer = self
            .viewer
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty());

        match (self.scope.as_deref().map(str::trim), viewer) {
            (None, None) => Ok(None),
            (None, Some(v)) | (Some("owner-scoped"), Some(v)) => Ok(Some(DedupScope::OwnerScoped {
                viewer: v.to_string(),
            })),
            (Some("owner-scoped"), None) => Err(Error::InvalidInput(
                "owner-scoped view requires a viewer".to_string(),
            )),
            (Some("unscoped"), _) => Ok(Some(DedupScope::Unscoped)),
            (Some(other), _) => Err(Error::InvalidInput(format!("Unknown scope: {}", other))),
        }
    }

    fn cache_key(&self) -> Result<String, Error> {
        let encoded = serde_json::to_string(self)
            .map_err(|e| Error::Internal(format!("Failed to encode request: {}", e)))?;
        let digest = Sha256::digest(encoded.as_bytes());
        let viewer = self.viewer.as_deref().map(str::trim).unwrap_or("");
        Ok(format!("clients:{}:{:x}", viewer, digest))
    }
}

/// Records parsed from a batch, plus the ids of entries that failed to parse
fn parse_records(raw: &[Value]) -> (Vec<RawRecord>, usize, Vec<String>) {
    let mut records = Vec::with_capacity(raw.len());
    let mut malformed = 0;
    let mut malformed_ids = Vec::new();
    for (index, value) in raw.iter().enumerate() {
        match RawRecord::deserialize(value) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!("Skipping malformed record at index {}: {}", index, e);
                malformed += 1;
                match value.get("id") {
                    Some(Value::String(id)) if !id.trim().is_empty() => {
                        malformed_ids.push(id.trim().to_string())
                    }
                    Some(Value::Number(id)) => malformed_ids.push(id.to_string()),
                    _ => {}
                }
            }
        }
    }
    (records, malformed, malformed_ids)
}

/// Response body
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupResponse {
    pub groups: Vec<ClientGroup>,
    pub entries: Vec<ClientEntry>,
    pub dropped: usize,
    pub dropped_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<DedupScope>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buckets: Option<Vec<FuzzyBucket>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suppressed_ids: Option<Vec<String>>,
}

/// POST /api/clients/group
pub async fn group_clients(
    State(state): State<AppState>,
    Json(request): Json<GroupRequest>,
) -> Result<Json<Value>, ApiError> {
    let scope = request.dedup_scope()?;
    let cache_key = request.cache_key()?;

    if let Some(cached) = state.views.get(&cache_key).await {
        debug!(key = %cache_key, "Serving grouped view from cache");
        return Ok(Json(cached));
    }

    let (records, malformed, malformed_ids) = parse_records(&request.records);
    let report = group_records(&state.identity, &records);
    let buckets = scope
        .as_ref()
        .map(|scope| resolve_buckets(&state.identity, &state.dedup, &records, scope));
    let suppressed = buckets.as_deref().map(suppressed_ids);

    let entries = report.render_entries();
    let mut dropped_ids = report.dropped_ids;
    dropped_ids.extend(malformed_ids);
    let response = GroupResponse {
        entries,
        groups: report.groups,
        dropped: report.dropped + malformed,
        dropped_ids,
        scope,
        buckets,
        suppressed_ids: suppressed,
    };

    let value = serde_json::to_value(&response)
        .map_err(|e| Error::Internal(format!("Failed to encode grouped view: {}", e)))?;
    state.views.put(cache_key, value.clone()).await;

    Ok(Json(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(scope: Option<&str>, viewer: Option<&str>) -> GroupRequest {
        GroupRequest {
            records: Vec::new(),
            scope: scope.map(str::to_string),
            viewer: viewer.map(str::to_string),
        }
    }

    #[test]
    fn test_scope_inference() {
        assert_eq!(request(None, None).dedup_scope().unwrap(), None);
        assert_eq!(
            request(None, Some("AB")).dedup_scope().unwrap(),
            Some(DedupScope::OwnerScoped { viewer: "AB".to_string() })
        );
        assert_eq!(
            request(Some("unscoped"), Some("AB")).dedup_scope().unwrap(),
            Some(DedupScope::Unscoped)
        );
        assert!(request(Some("owner-scoped"), Some(" ")).dedup_scope().is_err());
        assert!(request(Some("everyone"), None).dedup_scope().is_err());
    }

    #[test]
    fn test_cache_key_is_namespaced_and_stable() {
        let a = request(None, Some("AB")).cache_key().unwrap();
        let b = request(None, Some("AB")).cache_key().unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("clients:AB:"));
        assert_ne!(a, request(Some("unscoped"), Some("AB")).cache_key().unwrap());
    }

    #[test]
    fn test_cache_key_covers_records() {
        let mut first = request(None, Some("AB"));
        first.records = vec![json!({"id": "1", "email": "a@x.com"})];
        let mut second = request(None, Some("AB"));
        second.records = vec![json!({"id": "1", "email": "b@x.com"})];

        let a = first.cache_key().unwrap();
        let b = second.cache_key().unwrap();
        assert_ne!(a, b);
        // 256-bit digest in hex
        assert_eq!(a.trim_start_matches("clients:AB:").len(), 64);
    }

    #[test]
    fn test_parse_records_counts_failures() {
        let raw = vec![
            json!({"id": "ok", "email": "a@x.com"}),
            json!(42),
            json!({"id": 7, "email": ["not", "text"]}),
            json!({"id": null, "touchpointDate": "01/02/2024", "email": "b@x.com"}),
        ];
        let (records, malformed, ids) = parse_records(&raw);
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].id, "");
        assert!(records[1].touchpoint_date.is_none());
        assert_eq!(malformed, 2);
        assert_eq!(ids, vec!["7"]);
    }
}
