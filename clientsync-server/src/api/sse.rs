//! Live change stream
//!
//! Each request registers a channel-backed sink with the broadcast hub and
//! drains it as SSE. The hub already writes the retry hint, the `connected`
//! acknowledgement and heartbeat comments, so no axum keep-alive is layered on.
//! The stream unregisters its connection when the client goes away.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::State,
    response::sse::{Event, Sse},
};
use clientsync_common::Error;
use futures::stream::Stream;
use tracing::debug;

use crate::api::ApiError;
use crate::hub::{BroadcastHub, ChannelSink, ConnectionId};
use crate::AppState;

/// Unregisters the connection when the response stream is dropped
struct ConnectionGuard {
    hub: BroadcastHub,
    id: ConnectionId,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.hub.unregister(self.id) {
            debug!(connection = self.id, "SSE client disconnected");
        }
    }
}

/// GET /api/events
pub async fn event_stream(
    State(state): State<AppState>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let (sink, mut rx) = ChannelSink::channel(state.channel_capacity);
    let id = state
        .hub
        .register(Arc::new(sink))
        .ok_or_else(|| Error::Transport("connection closed during handshake".to_string()))?;
    debug!(connection = id, "SSE client connected");

    let guard = ConnectionGuard {
        hub: state.hub.clone(),
        id,
    };

    let stream = async_stream::stream! {
        let _guard = guard;
        while let Some(frame) = rx.recv().await {
            yield Ok(frame.into_event());
        }
    };

    Ok(Sse::new(stream))
}
