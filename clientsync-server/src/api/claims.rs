//! Claim submission endpoint

use axum::{extract::State, Json};

use crate::api::ApiError;
use crate::claim::{ClaimReceipt, ClaimRequest};
use crate::AppState;

/// POST /api/claims
///
/// Body `{entityId, actingIdentity, dataSourceTag}`. Upstream rejections keep
/// the upstream status code (502 when it has none).
pub async fn submit_claim(
    State(state): State<AppState>,
    Json(request): Json<ClaimRequest>,
) -> Result<Json<ClaimReceipt>, ApiError> {
    let receipt = state.claims.execute(&request).await?;
    Ok(Json(receipt))
}
