//! Server-Sent Events (SSE) frame model
//!
//! Frames written to a live connection, in the order a client sees them:
//! a reconnect hint, a `connected` acknowledgement, then heartbeats and
//! domain events interleaved.

use axum::response::sse::Event;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::time::Duration;
use tracing::warn;

use crate::events::ChangeEvent;

/// Comment text of a keep-alive frame
pub const HEARTBEAT_COMMENT: &str = "heartbeat";

/// One frame on the live-update channel
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// `retry:` reconnect-interval hint
    Retry(Duration),
    /// Initial acknowledgement after registration
    Connected { timestamp: DateTime<Utc> },
    /// Comment-only keep-alive
    Heartbeat,
    /// Sequenced domain event
    Change(ChangeEvent),
}

impl Frame {
    /// Acknowledgement frame stamped now
    pub fn connected() -> Self {
        Frame::Connected {
            timestamp: crate::time::now(),
        }
    }

    /// Convert to an axum SSE event
    pub fn into_event(self) -> Event {
        match self {
            Frame::Retry(interval) => Event::default().retry(interval),
            Frame::Connected { timestamp } => Event::default()
                .event("connected")
                .data(json!({ "timestamp": timestamp }).to_string()),
            Frame::Heartbeat => Event::default().comment(HEARTBEAT_COMMENT),
            Frame::Change(event) => {
                let base = Event::default()
                    .id(event.sequence_id.to_string())
                    .event(event.change_type().as_str());
                match serde_json::to_string(&event) {
                    Ok(data) => base.data(data),
                    Err(e) => {
                        warn!("Failed to serialize change event {}: {}", event.sequence_id, e);
                        base
                    }
                }
            }
        }
    }
}
