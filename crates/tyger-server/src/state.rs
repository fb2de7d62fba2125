//! Shared application state handed to every handler.

use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tyger_backend::Backend;
use tyger_buffers::BufferManager;
use tyger_config::ServerConfig;
use tyger_dataplane::{DataPlaneClient, ObjectStore};
use tyger_reconciler::Reconciler;
use tyger_repository::Repository;
use tyger_run_creator::RunCreator;
use tyger_sign::SignatureService;

#[derive(Clone)]
pub struct AppState {
    pub repository: Arc<dyn Repository>,
    pub backend: Arc<dyn Backend>,
    pub buffers: Arc<BufferManager>,
    pub run_creator: Arc<RunCreator>,
    pub reconciler: Arc<Reconciler>,
    pub store: Arc<dyn ObjectStore>,
    pub data_plane: Arc<DataPlaneClient>,
    pub signer: Arc<RwLock<SignatureService>>,
    pub config: ServerConfig,
    pub cancel: CancellationToken,
}
