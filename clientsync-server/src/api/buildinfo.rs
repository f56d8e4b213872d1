//! Build information endpoint

use axum::response::Json;
use serde::Serialize;

/// Build identification captured by `build.rs`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildInfo {
    pub version: String,
    pub git_hash: String,
    pub built_at: String,
    pub profile: String,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            git_hash: env!("CLIENTSYNC_GIT_HASH").to_string(),
            built_at: env!("CLIENTSYNC_BUILT_AT").to_string(),
            profile: env!("CLIENTSYNC_PROFILE").to_string(),
        }
    }
}

/// GET /api/buildinfo
pub async fn get_build_info() -> Json<BuildInfo> {
    Json(BuildInfo::current())
}
