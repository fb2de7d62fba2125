//! The run lifecycle endpoints (spec §6): submit, list, fetch/watch,
//! stream logs, cancel, and retag.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Deserialize;
use tyger_backend::DeleteCascade;
use tyger_logs::LogOptions;
use tyger_repository::{ListRunsOpts, Page, RunCounts};
use tyger_run_creator::{reject_system_kind, SubmittedRunRequest};
use tyger_types::{BackendHandle, Run, RunCodeTarget, RunKind, RunStatus};

use super::extract_tag_filter;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRunRequest {
    #[serde(default = "default_kind")]
    pub kind: RunKind,
    pub job: RunCodeTarget,
    #[serde(default)]
    pub worker: Option<RunCodeTarget>,
    #[serde(default)]
    pub timeout_seconds: Option<i64>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub cluster: Option<String>,
}

fn default_kind() -> RunKind {
    RunKind::User
}

pub async fn create_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<CreateRunRequest>,
) -> ApiResult<(StatusCode, Json<Run>)> {
    let cancel = state.cancel.child_token();
    reject_system_kind(request.kind)?;

    let idempotency_key = headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let submitted = SubmittedRunRequest {
        job: request.job,
        worker: request.worker,
        timeout_seconds: request.timeout_seconds,
        tags: request.tags,
        cluster: request.cluster,
        idempotency_key,
    };

    let (run, workload) = state.run_creator.create_run(submitted, &cancel).await?;
    let handle = state.backend.submit(&workload, &cancel).await?;
    state.reconciler.track(run.id, handle);

    Ok((StatusCode::CREATED, Json(run)))
}

fn parse_status(raw: &str) -> Option<RunStatus> {
    match raw {
        "pending" => Some(RunStatus::Pending),
        "running" => Some(RunStatus::Running),
        "succeeded" => Some(RunStatus::Succeeded),
        "failed" => Some(RunStatus::Failed),
        "canceling" => Some(RunStatus::Canceling),
        "canceled" => Some(RunStatus::Canceled),
        _ => None,
    }
}

pub async fn list_runs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<Page<Run>>> {
    let cancel = state.cancel.child_token();
    let opts = ListRunsOpts {
        limit: params.get("limit").and_then(|v| v.parse().ok()).unwrap_or(50),
        since: params
            .get("since")
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|dt| dt.with_timezone(&Utc)),
        status: params.get("status").and_then(|v| parse_status(v)),
        tags: extract_tag_filter(&params),
        continuation_token: params.get("_ct").cloned(),
    };
    let page = state.repository.list_runs(opts, &cancel).await?;
    Ok(Json(page))
}

pub async fn run_counts(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<RunCounts>> {
    let cancel = state.cancel.child_token();
    let since = params
        .get("since")
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|dt| dt.with_timezone(&Utc));
    let counts = state
        .repository
        .get_run_counts(since, extract_tag_filter(&params), &cancel)
        .await?;
    Ok(Json(counts))
}

pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Response> {
    let cancel = state.cancel.child_token();
    let watch = params.get("watch").map(|v| v == "true").unwrap_or(false);

    if !watch {
        let run = state.repository.get_run(id, &cancel).await?;
        return Ok(Json(run).into_response());
    }

    let snapshots = state.repository.watch_run(id, &cancel).await?;
    let body_stream = snapshots.map(|run| {
        let mut line = serde_json::to_vec(&run).expect("Run always serializes");
        line.push(b'\n');
        Ok::<_, std::convert::Infallible>(line)
    });
    let response = Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/x-ndjson")
        .body(Body::from_stream(body_stream))
        .expect("static response parts are always valid");
    Ok(response)
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    #[serde(default)]
    pub timestamps: bool,
    #[serde(rename = "tailLines")]
    pub tail_lines: Option<u64>,
    pub since: Option<String>,
    #[serde(default)]
    pub follow: bool,
}

pub async fn get_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(query): Query<LogQuery>,
) -> ApiResult<Response> {
    let cancel = state.cancel.child_token();
    let run = state.repository.get_run(id, &cancel).await?;

    let opts = LogOptions {
        include_timestamps: query.timestamps,
        tail_lines: query.tail_lines,
        since: query
            .since
            .as_deref()
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|dt| dt.with_timezone(&Utc)),
        follow: query.follow,
    };
    let handle = BackendHandle::for_run(id);
    let stream = tyger_logs::get_logs(
        state.backend.clone(),
        state.store.clone(),
        &run,
        Some(&handle),
        opts,
        &cancel,
    )
    .await?;

    let response = Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; charset=utf-8")
        .body(Body::from_stream(stream))
        .expect("static response parts are always valid");
    Ok(response)
}

pub async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    let cancel = state.cancel.child_token();
    state
        .repository
        .update_run_status(id, RunStatus::Canceling, Some("canceled by caller".into()), None, Utc::now(), &cancel)
        .await?;
    let handle = BackendHandle::for_run(id);
    match state.backend.delete(&handle, DeleteCascade::Background, &cancel).await {
        Ok(()) => {}
        Err(err) if err.kind() == tyger_types::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }
    Ok(StatusCode::ACCEPTED)
}

pub async fn update_run_tags(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(tags): Json<HashMap<String, String>>,
) -> ApiResult<Json<Run>> {
    let cancel = state.cancel.child_token();
    let if_match = match headers.get("if-match").and_then(|v| v.to_str().ok()) {
        Some(raw) => Some(
            raw.parse::<u64>()
                .map_err(|_| ApiError(tyger_types::TygerError::invalid("If-Match header must be an integer etag")))?,
        ),
        None => None,
    };
    let run = state.repository.update_run_tags(id, tags, if_match, &cancel).await?;
    Ok(Json(run))
}
