//! Claim trigger
//!
//! Forwards a claim to the external processor, then evicts stale aggregate
//! views and broadcasts the new owner. A rejected claim changes nothing:
//! no eviction, no event, and the upstream status is surfaced to the caller.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clientsync_common::config::ClaimsConfig;
use clientsync_common::{Change, Error, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cache::CacheInvalidator;
use crate::hub::BroadcastHub;

const USER_AGENT: &str = concat!("clientsync/", env!("CARGO_PKG_VERSION"));

/// Claim request as received from the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRequest {
    pub entity_id: String,
    pub acting_identity: String,
    #[serde(default)]
    pub data_source_tag: Option<String>,
}

impl ClaimRequest {
    fn validate(&self) -> Result<()> {
        if self.entity_id.trim().is_empty() {
            return Err(Error::InvalidInput("entityId must not be empty".to_string()));
        }
        if self.acting_identity.trim().is_empty() {
            return Err(Error::InvalidInput(
                "actingIdentity must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Ownership recorded by the processor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimOutcome {
    pub claimed_by: String,
    pub claimed_at: DateTime<Utc>,
}

/// Result returned to the claiming client
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimReceipt {
    pub claimed_by: String,
    pub claimed_at: DateTime<Utc>,
    pub sequence_id: u64,
}

/// External system that records claims
#[async_trait]
pub trait ClaimProcessor: Send + Sync {
    async fn process(&self, request: &ClaimRequest) -> Result<ClaimOutcome>;
}

/// Upstream reply; both fields are optional
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpstreamReply {
    #[serde(default)]
    claimed_by: Option<String>,
    #[serde(default, with = "clientsync_common::time::flexible")]
    claimed_at: Option<DateTime<Utc>>,
}

/// Processor posting the claim as JSON to an HTTP endpoint
pub struct HttpClaimProcessor {
    http_client: reqwest::Client,
    url: String,
}

impl HttpClaimProcessor {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ClaimProcessor for HttpClaimProcessor {
    async fn process(&self, request: &ClaimRequest) -> Result<ClaimOutcome> {
        tracing::debug!(
            entity_id = %request.entity_id,
            url = %self.url,
            "Forwarding claim upstream"
        );

        let response = self
            .http_client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| Error::upstream(e.status().map(|s| s.as_u16()), e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            let message = if error_text.trim().is_empty() {
                format!("upstream returned {}", status)
            } else {
                error_text
            };
            return Err(Error::upstream(Some(status.as_u16()), message));
        }

        let body = response
            .text()
            .await
            .map_err(|e| Error::upstream(None, e.to_string()))?;
        let reply: UpstreamReply = if body.trim().is_empty() {
            UpstreamReply::default()
        } else {
            serde_json::from_str(&body)
                .map_err(|e| Error::upstream(None, format!("unreadable upstream reply: {}", e)))?
        };

        Ok(ClaimOutcome {
            claimed_by: reply
                .claimed_by
                .unwrap_or_else(|| request.acting_identity.clone()),
            claimed_at: reply.claimed_at.unwrap_or_else(clientsync_common::time::now),
        })
    }
}

/// Processor used when no upstream is configured; rejects every claim
pub struct UnconfiguredClaimProcessor;

#[async_trait]
impl ClaimProcessor for UnconfiguredClaimProcessor {
    async fn process(&self, _request: &ClaimRequest) -> Result<ClaimOutcome> {
        Err(Error::upstream(Some(503), "claim processing is not configured"))
    }
}

/// Build the processor described by `[claims]`
pub fn processor_from_config(config: &ClaimsConfig) -> Result<Box<dyn ClaimProcessor>> {
    match config.upstream_url.as_deref().map(str::trim) {
        Some(url) if !url.is_empty() => Ok(Box::new(HttpClaimProcessor::new(
            url,
            Duration::from_secs(config.timeout_secs.max(1)),
        )?)),
        _ => {
            warn!("No claim upstream configured; claims will be rejected");
            Ok(Box::new(UnconfiguredClaimProcessor))
        }
    }
}

/// Claim pipeline: process, invalidate, broadcast
pub struct ClaimTrigger {
    processor: Box<dyn ClaimProcessor>,
    invalidator: CacheInvalidator,
    patterns: Vec<String>,
    hub: BroadcastHub,
}

impl ClaimTrigger {
    pub fn new(
        processor: Box<dyn ClaimProcessor>,
        invalidator: CacheInvalidator,
        patterns: Vec<String>,
        hub: BroadcastHub,
    ) -> Self {
        Self {
            processor,
            invalidator,
            patterns,
            hub,
        }
    }

    pub async fn execute(&self, request: &ClaimRequest) -> Result<ClaimReceipt> {
        request.validate()?;

        let outcome = match self.processor.process(request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(entity_id = %request.entity_id, "Claim rejected: {}", e);
                return Err(e);
            }
        };

        self.invalidator.invalidate(&self.patterns).await;

        let mut change = Change::claim(
            request.entity_id.trim(),
            Some(outcome.claimed_by.clone()),
            Some(outcome.claimed_at),
        );
        if let Some(tag) = request.data_source_tag.as_deref().filter(|t| !t.trim().is_empty()) {
            change = change.with_source(tag.trim());
        }
        let event = self.hub.broadcast(change);

        info!(
            entity_id = %request.entity_id,
            claimed_by = %outcome.claimed_by,
            sequence_id = event.sequence_id,
            "Claim recorded"
        );

        Ok(ClaimReceipt {
            claimed_by: outcome.claimed_by,
            claimed_at: outcome.claimed_at,
            sequence_id: event.sequence_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryViewCache;
    use crate::hub::{ChannelSink, HubSettings};
    use chrono::TimeZone;
    use clientsync_common::{ChangeType, Frame};
    use serde_json::json;
    use std::sync::Arc;

    struct AcceptingProcessor;

    #[async_trait]
    impl ClaimProcessor for AcceptingProcessor {
        async fn process(&self, request: &ClaimRequest) -> Result<ClaimOutcome> {
            Ok(ClaimOutcome {
                claimed_by: request.acting_identity.clone(),
                claimed_at: Utc.with_ymd_and_hms(2024, 6, 1, 9, 30, 0).unwrap(),
            })
        }
    }

    struct RejectingProcessor;

    #[async_trait]
    impl ClaimProcessor for RejectingProcessor {
        async fn process(&self, _request: &ClaimRequest) -> Result<ClaimOutcome> {
            Err(Error::upstream(Some(409), "already claimed"))
        }
    }

    fn request() -> ClaimRequest {
        ClaimRequest {
            entity_id: "42".to_string(),
            acting_identity: "AB".to_string(),
            data_source_tag: Some("v2".to_string()),
        }
    }

    async fn fixture(
        processor: Box<dyn ClaimProcessor>,
    ) -> (ClaimTrigger, Arc<InMemoryViewCache>, tokio::sync::mpsc::Receiver<Frame>) {
        let cache = Arc::new(InMemoryViewCache::new(Duration::from_secs(60)));
        cache.put("clients:AB", json!([])).await;
        cache.put("enquiries:AB", json!([])).await;

        let hub = BroadcastHub::new(HubSettings::default());
        let (sink, mut rx) = ChannelSink::channel(8);
        hub.register(Arc::new(sink)).unwrap();
        // retry hint and connected acknowledgement
        rx.recv().await.unwrap();
        rx.recv().await.unwrap();

        let trigger = ClaimTrigger::new(
            processor,
            CacheInvalidator::new(cache.clone()),
            vec!["clients:*".to_string(), "enquiries:*".to_string()],
            hub,
        );
        (trigger, cache, rx)
    }

    #[tokio::test]
    async fn test_successful_claim_invalidates_and_broadcasts() {
        let (trigger, cache, mut rx) = fixture(Box::new(AcceptingProcessor)).await;

        let receipt = trigger.execute(&request()).await.unwrap();
        assert_eq!(receipt.claimed_by, "AB");
        assert_eq!(receipt.sequence_id, 1);
        assert!(cache.is_empty().await);

        match rx.recv().await.unwrap() {
            Frame::Change(event) => {
                assert_eq!(event.sequence_id, 1);
                assert_eq!(event.change_type(), ChangeType::Claim);
                assert_eq!(event.entity_id(), "42");
                assert_eq!(event.change.claimed_by.as_deref(), Some("AB"));
                assert_eq!(event.change.source.as_deref(), Some("v2"));
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rejected_claim_changes_nothing() {
        let (trigger, cache, mut rx) = fixture(Box::new(RejectingProcessor)).await;

        let err = trigger.execute(&request()).await.unwrap_err();
        assert!(matches!(err, Error::UpstreamClaim { status: Some(409), .. }));
        assert_eq!(cache.len().await, 2);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_blank_identity_is_invalid_input() {
        let (trigger, _cache, _rx) = fixture(Box::new(AcceptingProcessor)).await;
        let mut req = request();
        req.acting_identity = "  ".to_string();
        assert!(matches!(
            trigger.execute(&req).await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_unconfigured_processor_rejects() {
        let processor = processor_from_config(&ClaimsConfig::default()).unwrap();
        let err = processor.process(&request()).await.unwrap_err();
        assert!(matches!(err, Error::UpstreamClaim { status: Some(503), .. }));
    }

    #[test]
    fn test_request_wire_format() {
        let req: ClaimRequest = serde_json::from_value(json!({
            "entityId": "42",
            "actingIdentity": "AB",
            "dataSourceTag": "v2"
        }))
        .unwrap();
        assert_eq!(req, request());
    }
}
