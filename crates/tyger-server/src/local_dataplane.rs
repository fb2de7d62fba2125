//! The local data-plane server (spec §6): a thin HTTP blob surface the
//! Data-Plane Client and sidecar relay talk to, mounted on this same
//! router/listener. Every request carries a `sig` query param validated
//! against the run/buffer's signed access token before touching the store.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::Engine;
use bytes::Bytes;
use chrono::Utc;
use md5::Digest;
use tyger_sign::{ActionMask, ValidationOutcome};
use tyger_types::{ErrorKind, TygerError};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

fn md5_of(data: &[u8]) -> [u8; 16] {
    md5::Md5::digest(data).into()
}

async fn authorize(state: &AppState, container: &str, params: &HashMap<String, String>, write: bool) -> ApiResult<()> {
    let token = params
        .get("sig")
        .ok_or_else(|| TygerError::new(ErrorKind::Unauthorized, "missing `sig` query parameter"))?;
    let requested = if write { ActionMask::read_write() } else { ActionMask::read_only() };
    let outcome = state
        .signer
        .read()
        .await
        .validate(token, container, requested, Utc::now());
    match outcome {
        ValidationOutcome::Ok => Ok(()),
        ValidationOutcome::InvalidSas => Err(ApiError(TygerError::new(ErrorKind::Unauthorized, "invalid or expired signature"))),
        ValidationOutcome::ActionNotAllowed => Err(ApiError(TygerError::new(ErrorKind::Forbidden, "signature does not permit this action"))),
    }
}

pub async fn head_container(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<StatusCode> {
    authorize(&state, &id, &params, false).await?;
    Ok(StatusCode::OK)
}

pub async fn put_container(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<StatusCode> {
    authorize(&state, &id, &params, true).await?;
    Ok(StatusCode::CREATED)
}

pub async fn put_blob(
    State(state): State<Arc<AppState>>,
    Path((container, blob)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<StatusCode> {
    authorize(&state, &container, &params, true).await?;

    let actual_md5 = md5_of(&body);
    if let Some(raw) = headers.get("content-md5").and_then(|v| v.to_str().ok()) {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(raw)
            .map_err(|_| TygerError::invalid("Content-MD5 header is not valid base64"))?;
        let claimed: [u8; 16] = decoded
            .try_into()
            .map_err(|_| TygerError::invalid("Content-MD5 header must decode to 16 bytes"))?;
        if claimed != actual_md5 {
            return Err(TygerError::invalid("Content-MD5 does not match request body").into());
        }
    }

    let outcome = state
        .store
        .put_block(&container, &blob, body, actual_md5)
        .await?;
    Ok(match outcome {
        tyger_dataplane::PutOutcome::Created => StatusCode::CREATED,
        tyger_dataplane::PutOutcome::AlreadyExists => StatusCode::OK,
    })
}

pub async fn get_blob(
    State(state): State<Arc<AppState>>,
    Path((container, blob)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Response> {
    authorize(&state, &container, &params, false).await?;
    let (data, md5) = state.store.get_block(&container, &blob).await?;
    let response = Response::builder()
        .status(StatusCode::OK)
        .header("content-md5", base64::engine::general_purpose::STANDARD.encode(md5))
        .body(Body::from(data))
        .expect("static response parts are always valid");
    Ok(response.into_response())
}

pub async fn head_blob(
    state: State<Arc<AppState>>,
    path: Path<(String, String)>,
    query: Query<HashMap<String, String>>,
) -> ApiResult<Response> {
    get_blob(state, path, query).await
}
