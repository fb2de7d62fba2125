//! The capability set both Backend Adapter variants implement (spec §4.4).

use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tyger_types::{BackendEvent, BackendHandle, TygerError};

/// A byte stream of RFC3339Nano-prefixed log lines (spec §4.4's
/// `StreamLogs`).
pub type LogStream = Pin<Box<dyn futures::Stream<Item = Result<bytes::Bytes, TygerError>> + Send>>;

/// Foreground (block until gone) or background cascade delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteCascade {
    Foreground,
    Background,
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Idempotent on `(runId)`: submitting the same workload twice returns
    /// the same handle without creating a second backend object.
    async fn submit(
        &self,
        spec: &crate::BackendWorkloadSpec,
        cancel: &CancellationToken,
    ) -> Result<BackendHandle, TygerError>;

    /// A stream of every observed [`BackendEvent`] across all handles this
    /// backend is tracking.
    async fn watch(
        &self,
        cancel: &CancellationToken,
    ) -> Result<std::pin::Pin<Box<dyn futures::Stream<Item = BackendEvent> + Send>>, TygerError>;

    async fn stream_logs(
        &self,
        handle: &BackendHandle,
        since: Option<DateTime<Utc>>,
        follow: bool,
        cancel: &CancellationToken,
    ) -> Result<LogStream, TygerError>;

    async fn delete(
        &self,
        handle: &BackendHandle,
        cascade: DeleteCascade,
        cancel: &CancellationToken,
    ) -> Result<(), TygerError>;
}
