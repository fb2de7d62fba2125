//! Main-container presence (spec §4.8): the sidecar must not open its pipe
//! until the main container is confirmed to exist, and must treat the
//! buffer as empty rather than hang if the main container exits first.
//!
//! Reuses the `/run/tyger/` tombstone-directory convention the cluster
//! backend's worker-wait init container already polls
//! (`tyger_backend::cluster`'s `/run/tyger/started`): `started` signals the
//! main container is up, `exited` signals it is gone.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tyger_types::TygerError;

pub struct MainContainerPresence {
    started_path: PathBuf,
    exited_path: PathBuf,
    poll_interval: Duration,
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

impl MainContainerPresence {
    pub fn new(tombstone_dir: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        let dir = tombstone_dir.into();
        Self {
            started_path: dir.join("started"),
            exited_path: dir.join("exited"),
            poll_interval,
        }
    }

    /// Blocks until the main container is confirmed to exist, or returns
    /// `Ok(false)` if it already exited without ever starting — in which
    /// case the caller must not open the pipe and should treat the
    /// buffer's contents as empty.
    pub async fn wait_for_start(&self, cancel: &CancellationToken) -> Result<bool, TygerError> {
        loop {
            if path_exists(&self.exited_path).await {
                return Ok(false);
            }
            if path_exists(&self.started_path).await {
                return Ok(true);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(TygerError::cancelled()),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}
