//! Assembles the full router (spec §6's external interface table) plus the
//! local data-plane surface, mounted on the same listener.

use std::sync::Arc;

use axum::routing::{get, head, post, put};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::handlers::{buffers, codespecs, metadata, runs};
use crate::local_dataplane;
use crate::state::AppState;

pub fn build_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/runs", post(runs::create_run).get(runs::list_runs))
        .route("/runs/counts", get(runs::run_counts))
        .route("/runs/{id}", get(runs::get_run).put(runs::update_run_tags))
        .route("/runs/{id}/logs", get(runs::get_logs))
        .route("/runs/{id}/cancel", post(runs::cancel_run))
        .route("/codespecs/{name}", put(codespecs::upsert).get(codespecs::get_latest))
        .route("/codespecs/{name}/versions/{version}", get(codespecs::get_version))
        .route("/buffers", post(buffers::create_buffer))
        .route("/buffers/{id}", get(buffers::get_buffer))
        .route("/buffers/{id}/access", post(buffers::access_buffer));

    let data_plane = Router::new()
        .route("/containers/{id}", head(local_dataplane::head_container).put(local_dataplane::put_container))
        .route(
            "/containers/{id}/{blob}",
            put(local_dataplane::put_blob).get(local_dataplane::get_blob).head(local_dataplane::head_blob),
        );

    Router::new()
        .route("/healthcheck", get(metadata::healthcheck))
        .route("/metadata", get(metadata::metadata))
        .merge(api)
        .merge(data_plane)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
