//! `PUT /codespecs/{name}`, `GET /codespecs/{name}[/versions/{version}]`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use tyger_types::{Codespec, CodespecRecord, ErrorKind};

use crate::error::ApiResult;
use crate::state::AppState;

pub async fn upsert(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(body): Json<Codespec>,
) -> ApiResult<(StatusCode, Json<CodespecRecord>)> {
    let cancel = state.cancel.child_token();
    let prev_version = match state.repository.get_latest_codespec(&name, &cancel).await {
        Ok(record) => Some(record.version),
        Err(err) if err.kind() == ErrorKind::NotFound => None,
        Err(err) => return Err(err.into()),
    };

    let record = state.repository.upsert_codespec(&name, body, &cancel).await?;
    let status = if prev_version == Some(record.version) {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(record)))
}

pub async fn get_latest(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<CodespecRecord>> {
    let cancel = state.cancel.child_token();
    let record = state.repository.get_latest_codespec(&name, &cancel).await?;
    Ok(Json(record))
}

pub async fn get_version(
    State(state): State<Arc<AppState>>,
    Path((name, version)): Path<(String, u32)>,
) -> ApiResult<Json<CodespecRecord>> {
    let cancel = state.cancel.child_token();
    let record = state.repository.get_codespec_at_version(&name, version, &cancel).await?;
    Ok(Json(record))
}
