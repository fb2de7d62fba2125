//! End-to-end HTTP tests: drive the real router with in-memory
//! collaborators, no sockets involved (`tower::ServiceExt::oneshot`).

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tyger_backend::{Backend, StubBackend};
use tyger_buffers::{BufferManager, InMemoryBufferStore};
use tyger_config::ServerConfig;
use tyger_dataplane::{DataPlaneClient, InMemoryObjectStore, ObjectStore};
use tyger_reconciler::Reconciler;
use tyger_repository::{InMemoryRepository, Repository};
use tyger_run_creator::RunCreator;
use tyger_server::state::AppState;
use tyger_sign::{SignatureService, SigningKey};

fn test_state() -> Arc<AppState> {
    let config = ServerConfig::default();
    let repository: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
    let store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::default());
    let signer = Arc::new(RwLock::new(SignatureService::new(SigningKey::generate())));
    let buffers = Arc::new(BufferManager::new(
        repository.clone(),
        Arc::new(InMemoryBufferStore::default()),
        signer.clone(),
        config.buffer.clone(),
        "http://localhost:8080",
    ));
    let run_creator = Arc::new(RunCreator::new(
        repository.clone(),
        buffers.clone(),
        chrono::Duration::seconds(config.run.idempotency_key_ttl_secs),
    ));
    let backend: Arc<dyn Backend> = Arc::new(StubBackend::new());
    let reconciler = Arc::new(Reconciler::new(repository.clone(), backend.clone(), store.clone(), config.run.clone()));
    let data_plane = Arc::new(DataPlaneClient::new(store.clone(), config.data_plane.clone()));

    Arc::new(AppState {
        repository,
        backend,
        buffers,
        run_creator,
        reconciler,
        store,
        data_plane,
        signer,
        config,
        cancel: CancellationToken::new(),
    })
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), 1024 * 1024).await.expect("collect body");
    serde_json::from_slice(&bytes).expect("valid json body")
}

#[tokio::test]
async fn healthcheck_reports_ok() {
    let state = test_state();
    let app = tyger_server::build_router(state);

    let response = app
        .oneshot(Request::builder().uri("/healthcheck").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn codespec_upsert_is_201_then_200_on_identical_body() {
    let state = test_state();
    let app = tyger_server::build_router(state);

    let body = json!({"kind": "job", "image": "alpine:3.19"});

    let first = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/codespecs/greeter")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);
    let first_record = body_json(first).await;
    assert_eq!(first_record["version"], 1);

    let second = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/codespecs/greeter")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::OK, "identical body is an idempotent no-op, not a new version");
    let second_record = body_json(second).await;
    assert_eq!(second_record["version"], 1);

    let changed = json!({"kind": "job", "image": "alpine:3.20"});
    let third = app
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/codespecs/greeter")
                .header("content-type", "application/json")
                .body(Body::from(changed.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(third.status(), StatusCode::CREATED, "a changed body mints a new version");
    let third_record = body_json(third).await;
    assert_eq!(third_record["version"], 2);
}

#[tokio::test]
async fn codespec_get_unknown_name_is_404() {
    let state = test_state();
    let app = tyger_server::build_router(state);

    let response = app
        .oneshot(Request::builder().uri("/codespecs/nope").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let error = body_json(response).await;
    assert_eq!(error["error"]["code"], "NotFound");
}

#[tokio::test]
async fn buffer_create_then_get_round_trips() {
    let state = test_state();
    let app = tyger_server::build_router(state);

    let create = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/buffers")
                .header("content-type", "application/json")
                .body(Body::from(json!({"tags": {"project": "demo"}}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(create.status(), StatusCode::CREATED);
    let created = body_json(create).await;
    let id = created["id"].as_str().unwrap().to_string();

    let fetched = app
        .oneshot(Request::builder().uri(format!("/buffers/{id}")).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(fetched.status(), StatusCode::OK);
    let fetched_body = body_json(fetched).await;
    assert_eq!(fetched_body["id"], id);
}

#[tokio::test]
async fn buffer_access_url_carries_a_signature() {
    let state = test_state();
    let app = tyger_server::build_router(state);

    let create = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/buffers")
                .header("content-type", "application/json")
                .body(Body::from(json!({}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let created = body_json(create).await;
    let id = created["id"].as_str().unwrap().to_string();

    let access = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/buffers/{id}/access?writeable=true"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(access.status(), StatusCode::OK);
    let access_body = body_json(access).await;
    let url = access_body["url"].as_str().unwrap();
    assert!(url.contains("sig="), "access URL must carry a signed token: {url}");
}

#[tokio::test]
async fn run_submission_is_rejected_for_system_kind() {
    let state = test_state();
    let app = tyger_server::build_router(state);

    let request = json!({
        "kind": "system",
        "job": {"codespec_ref": {"kind": "inline", "body": {"kind": "job", "image": "alpine:3.19"}}},
    });

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/runs")
                .header("content-type", "application/json")
                .body(Body::from(request.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST, "clients may never submit kind=system runs directly");
}

#[tokio::test]
async fn run_lifecycle_create_then_cancel() {
    let state = test_state();
    let app = tyger_server::build_router(state);

    let request = json!({
        "job": {"codespec_ref": {"kind": "inline", "body": {"kind": "job", "image": "alpine:3.19", "command": ["echo", "hi"]}}},
    });

    let create = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/runs")
                .header("content-type", "application/json")
                .body(Body::from(request.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(create.status(), StatusCode::CREATED);
    let run = body_json(create).await;
    assert_eq!(run["status"], "pending");
    let id = run["id"].as_i64().unwrap();

    let fetched = app
        .clone()
        .oneshot(Request::builder().uri(format!("/runs/{id}")).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(fetched.status(), StatusCode::OK);

    let cancel_response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/runs/{id}/cancel"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(cancel_response.status(), StatusCode::ACCEPTED);

    // The cancel endpoint only kicks off a background teardown; the run
    // reaches its terminal status once the reconciler's sweep confirms the
    // backend handle is gone.
    state.reconciler.sweep_once(&CancellationToken::new()).await.expect("sweep");

    let fetched_after_cancel = app
        .oneshot(Request::builder().uri(format!("/runs/{id}")).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(fetched_after_cancel.status(), StatusCode::OK);
    let run_after_cancel = body_json(fetched_after_cancel).await;
    assert_eq!(run_after_cancel["status"], "canceled", "run must reach canceled once the backend handle is torn down");
}

#[tokio::test]
async fn run_counts_reflects_pending_submissions() {
    let state = test_state();
    let app = tyger_server::build_router(state);

    let request = json!({
        "job": {"codespec_ref": {"kind": "inline", "body": {"kind": "job", "image": "alpine:3.19"}}},
    });
    let create = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/runs")
                .header("content-type", "application/json")
                .body(Body::from(request.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(create.status(), StatusCode::CREATED);

    let counts = app
        .oneshot(Request::builder().uri("/runs/counts").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(counts.status(), StatusCode::OK);
    let counts_body = body_json(counts).await;
    assert_eq!(counts_body["pending"], 1);
}

#[tokio::test]
async fn idempotency_key_reuse_returns_the_original_run() {
    let state = test_state();
    let app = tyger_server::build_router(state);

    let request = json!({
        "job": {"codespec_ref": {"kind": "inline", "body": {"kind": "job", "image": "alpine:3.19"}}},
    });

    let submit = |app: axum::Router, key: &'static str| {
        let body = request.to_string();
        async move {
            app.oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/runs")
                    .header("content-type", "application/json")
                    .header("idempotency-key", key)
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap()
        }
    };

    let first = submit(app.clone(), "retry-me").await;
    assert_eq!(first.status(), StatusCode::CREATED);
    let first_run = body_json(first).await;

    let second = submit(app, "retry-me").await;
    assert_eq!(second.status(), StatusCode::CREATED);
    let second_run = body_json(second).await;

    assert_eq!(first_run["id"], second_run["id"], "a reused idempotency key must short-circuit to the original run");
}
