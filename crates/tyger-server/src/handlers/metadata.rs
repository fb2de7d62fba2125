//! Unauthenticated discovery endpoints (spec §6).

use axum::extract::State;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthcheckResponse {
    status: &'static str,
}

pub async fn healthcheck() -> Json<HealthcheckResponse> {
    Json(HealthcheckResponse { status: "ok" })
}

#[derive(Serialize)]
pub struct MetadataResponse {
    /// Always empty: the core has no OAuth authority to discover (spec §6
    /// Non-goals — auth acquisition is out of scope).
    auth: Option<()>,
    data_plane_available: bool,
}

pub async fn metadata(State(state): State<Arc<AppState>>) -> Json<MetadataResponse> {
    let _ = &state;
    Json(MetadataResponse {
        auth: None,
        data_plane_available: true,
    })
}
