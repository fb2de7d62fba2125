//! read/write pipe modes (spec §4.8): bridge a named pipe in the shared
//! volume to a buffer via the Data-Plane Client (C7).

use std::path::Path;
use std::sync::Arc;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tyger_dataplane::DataPlaneClient;
use tyger_types::TygerError;

use crate::presence::MainContainerPresence;

pub struct PipeBridge {
    client: Arc<DataPlaneClient>,
}

impl PipeBridge {
    pub fn new(client: Arc<DataPlaneClient>) -> Self {
        Self { client }
    }

    /// read mode: the main container reads its input from `pipe_path`, so
    /// the sidecar pushes the buffer's contents into the pipe.
    pub async fn bridge_read(
        &self,
        presence: &MainContainerPresence,
        pipe_path: &Path,
        container: &str,
        cancel: &CancellationToken,
    ) -> Result<(), TygerError> {
        if !presence.wait_for_start(cancel).await? {
            info!(container, "main container exited before start; nothing to read into");
            return Ok(());
        }
        let mut pipe = tokio::fs::OpenOptions::new()
            .write(true)
            .open(pipe_path)
            .await
            .map_err(|e| TygerError::transient(format!("open pipe {}: {e}", pipe_path.display())))?;
        let mut stream = self.client.read_buffer(container, cancel).await?;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            pipe.write_all(&chunk)
                .await
                .map_err(|e| TygerError::transient(format!("write pipe: {e}")))?;
        }
        pipe.shutdown()
            .await
            .map_err(|e| TygerError::transient(format!("close pipe: {e}")))?;
        Ok(())
    }

    /// write mode: the main container writes its output to `pipe_path`, so
    /// the sidecar drains the pipe into the buffer. If the main container
    /// never started, an empty buffer is written so downstream readers see
    /// a completed zero-length buffer instead of hanging.
    pub async fn bridge_write(
        &self,
        presence: &MainContainerPresence,
        pipe_path: &Path,
        container: &str,
        cancel: &CancellationToken,
    ) -> Result<(), TygerError> {
        if !presence.wait_for_start(cancel).await? {
            info!(container, "main container exited before start; writing empty buffer");
            self.client.write_buffer(container, tokio::io::empty(), cancel).await?;
            return Ok(());
        }
        let pipe = tokio::fs::File::open(pipe_path)
            .await
            .map_err(|e| TygerError::transient(format!("open pipe {}: {e}", pipe_path.display())))?;
        self.client.write_buffer(container, pipe, cancel).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tyger_config::DataPlaneConfig;
    use tyger_dataplane::InMemoryObjectStore;

    #[tokio::test]
    async fn bridge_write_on_early_exit_produces_empty_buffer() {
        let client = Arc::new(DataPlaneClient::new(
            Arc::new(InMemoryObjectStore::default()),
            DataPlaneConfig::default(),
        ));
        let bridge = PipeBridge::new(client.clone());
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("exited"), b"").await.unwrap();
        let presence = MainContainerPresence::new(dir.path(), Duration::from_millis(5));
        let cancel = CancellationToken::new();
        bridge
            .bridge_write(&presence, Path::new("/nonexistent"), "out", &cancel)
            .await
            .unwrap();

        let mut stream = client.read_buffer("out", &cancel).await.unwrap();
        assert!(stream.next().await.is_none());
    }
}
