//! Process entry point: reads [`ServerConfig`], wires up every component
//! crate into an [`AppState`], starts the background subsystems, and
//! serves the HTTP API until shutdown.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tyger_backend::cluster::ClusterBackend;
use tyger_backend::local::LocalBackend;
use tyger_backend::{Backend, StubBackend};
use tyger_buffers::BufferManager;
use tyger_config::{BackendKind, ServerConfig};
use tyger_dataplane::{DataPlaneClient, LocalFilesystemObjectStore, ObjectStore};
use tyger_reconciler::Reconciler;
use tyger_repository::{InMemoryRepository, Repository};
use tyger_run_creator::RunCreator;
use tyger_server::state::AppState;
use tyger_sign::{SignatureService, SigningKey};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    if let Err(err) = run().await {
        tracing::error!(error = %err, "server exited with an error");
        return Err(err);
    }
    Ok(())
}

async fn run() -> Result<()> {
    let config = ServerConfig::from_env().context("loading configuration")?;
    let cancel = CancellationToken::new();

    let repository: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());

    let data_plane_dir = std::env::var("TYGER_DATA_PLANE_DIR").unwrap_or_else(|_| "/var/run/tyger/data".to_string());
    let filesystem_store = Arc::new(LocalFilesystemObjectStore::new(data_plane_dir));
    let store: Arc<dyn ObjectStore> = filesystem_store.clone();
    let buffer_store: Arc<dyn tyger_buffers::BufferStore> = filesystem_store;
    let data_plane = Arc::new(DataPlaneClient::new(store.clone(), config.data_plane.clone()));

    let signing_key = match std::env::var("TYGER_SIGNING_KEY") {
        Ok(raw) => {
            use base64::Engine;
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(raw)
                .context("decoding TYGER_SIGNING_KEY")?;
            SigningKey::from_bytes(bytes)
        }
        Err(_) => {
            tracing::warn!("TYGER_SIGNING_KEY not set; generating an ephemeral key for this process");
            SigningKey::generate()
        }
    };
    let signer = Arc::new(RwLock::new(SignatureService::new(signing_key)));

    let data_plane_base_url = std::env::var("TYGER_DATA_PLANE_BASE_URL")
        .unwrap_or_else(|_| format!("http://{}", config.listen_addr));
    let buffers = Arc::new(BufferManager::new(
        repository.clone(),
        buffer_store,
        signer.clone(),
        config.buffer.clone(),
        data_plane_base_url,
    ));

    let run_creator = Arc::new(RunCreator::new(
        repository.clone(),
        buffers.clone(),
        chrono::Duration::seconds(config.run.idempotency_key_ttl_secs),
    ));

    let backend: Arc<dyn Backend> = match config.backend {
        BackendKind::Local => match LocalBackend::connect_with_local_defaults() {
            Ok(backend) => Arc::new(backend),
            Err(err) => {
                tracing::warn!(error = %err, "local container engine unavailable; falling back to the in-memory stub backend");
                Arc::new(StubBackend::new())
            }
        },
        BackendKind::Cluster => {
            let client = kube::Client::try_default().await.context("connecting to Kubernetes")?;
            let namespace = std::env::var("TYGER_NAMESPACE").unwrap_or_else(|_| "default".to_string());
            Arc::new(ClusterBackend::new(client, namespace))
        }
    };

    let reconciler = Arc::new(Reconciler::new(repository.clone(), backend.clone(), store.clone(), config.run.clone()));

    let state = Arc::new(AppState {
        repository,
        backend,
        buffers,
        run_creator,
        reconciler,
        store,
        data_plane,
        signer,
        config: config.clone(),
        cancel: cancel.clone(),
    });

    let background_tasks = tyger_server::background::spawn_background(&state);

    let app = tyger_server::build_router(state);
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "tyger-server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await
        .context("serving HTTP")?;

    cancel.cancel();
    for task in background_tasks {
        let _ = task.await;
    }
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = cancel.cancelled() => {}
    }
}
