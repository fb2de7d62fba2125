//! `POST /buffers`, `GET /buffers/{id}`, `POST /buffers/{id}/access`.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use tyger_buffers::BufferAccessRequest;
use tyger_types::{Buffer, TagSet};

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct CreateBufferRequest {
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

pub async fn create_buffer(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateBufferRequest>,
) -> ApiResult<(StatusCode, Json<Buffer>)> {
    let cancel = state.cancel.child_token();
    let tags = TagSet::from_iter(request.tags);
    let buffer = state.buffers.create_buffer(tags, &cancel).await?;
    Ok((StatusCode::CREATED, Json(buffer)))
}

pub async fn get_buffer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Buffer>> {
    let cancel = state.cancel.child_token();
    let buffer = state.repository.get_buffer(&id, &cancel).await?;
    Ok(Json(buffer))
}

#[derive(Debug, serde::Serialize)]
pub struct BufferAccessResponse {
    pub id: String,
    pub url: String,
}

pub async fn access_buffer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<BufferAccessResponse>> {
    let cancel = state.cancel.child_token();
    let parse_flag = |key: &str, default: bool| {
        params.get(key).map(|v| v == "true" || v == "1").unwrap_or(default)
    };
    let writable = parse_flag("writeable", false);
    let mut request = BufferAccessRequest::new(id.clone(), writable);
    request.prefer_tcp = parse_flag("preferTcp", true);
    request.from_internal_network = parse_flag("fromInternalNetwork", false);

    let requests = [request];
    let mut urls = state
        .buffers
        .create_buffer_access_urls(&requests, true, &cancel)
        .await?;
    let url = urls.remove(0);
    Ok(Json(BufferAccessResponse { id: url.id, url: url.url }))
}
