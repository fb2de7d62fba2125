//! Background `BufferDeleter` (spec §4.2): every 30 s, soft-delete expired
//! active buffers, then hard-delete expired soft-deleted buffers. Failures
//! per batch are logged and retried on the next tick; partial success is
//! acceptable.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::BufferManager;

pub struct BufferDeleter {
    manager: Arc<BufferManager>,
    interval: Duration,
}

impl BufferDeleter {
    pub fn new(manager: Arc<BufferManager>, interval: Duration) -> Self {
        Self { manager, interval }
    }

    /// Spawns the ticker as a background task, governed by `cancel`
    /// (spec §5: "long-running subsystems ... are independent background
    /// tasks each governed by their own cancellation-aware ticker").
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("buffer deleter shutting down");
                        return;
                    }
                    _ = ticker.tick() => {
                        let tick_cancel = cancel.child_token();
                        if let Err(err) = self.manager.sweep_once(chrono::Utc::now(), &tick_cancel).await {
                            warn!(error = %err, "buffer deleter sweep failed");
                        }
                    }
                }
            }
        })
    }
}
