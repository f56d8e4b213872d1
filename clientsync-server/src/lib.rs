//! clientsync-server library
//!
//! Groups client records by identity, ranks fuzzy duplicates per viewing
//! scope, and pushes claim changes to connected browsers over SSE.

use std::sync::Arc;

use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub mod api;
pub mod cache;
pub mod claim;
pub mod db;
pub mod dedup;
pub mod grouping;
pub mod hub;
pub mod identity;
pub mod model;
pub mod poller;

use cache::InMemoryViewCache;
use claim::ClaimTrigger;
use dedup::DedupPolicy;
use hub::BroadcastHub;
use identity::IdentityRules;

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub hub: BroadcastHub,
    pub claims: Arc<ClaimTrigger>,
    pub identity: Arc<IdentityRules>,
    pub dedup: Arc<DedupPolicy>,
    /// Cached grouped views, evicted by claim invalidation
    pub views: Arc<InMemoryViewCache>,
    /// Frame buffer per SSE connection
    pub channel_capacity: usize,
}

impl AppState {
    pub fn new(
        hub: BroadcastHub,
        claims: ClaimTrigger,
        identity: IdentityRules,
        dedup: DedupPolicy,
        views: Arc<InMemoryViewCache>,
        channel_capacity: usize,
    ) -> Self {
        Self {
            hub,
            claims: Arc::new(claims),
            identity: Arc::new(identity),
            dedup: Arc::new(dedup),
            views,
            channel_capacity: channel_capacity.max(1),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::{get, post};

    let api = Router::new()
        .route("/api/events", get(api::event_stream))
        .route("/api/claims", post(api::submit_claim))
        .route("/api/clients/group", post(api::group_clients))
        .route("/api/buildinfo", get(api::get_build_info));

    Router::new()
        .merge(api)
        .merge(api::health_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
