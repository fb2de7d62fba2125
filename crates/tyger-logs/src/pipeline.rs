//! The `Pipeline`/`PipelineElement` abstraction (spec §4.6): a chain of
//! transforms connected by asynchronous byte buffers, each respecting
//! cancellation by draining its reader and closing its writer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tyger_types::TygerError;

const PIPE_BUFFER_SIZE: usize = 64 * 1024;

#[async_trait]
pub trait PipelineElement: Send + Sync {
    /// Copy `reader` to `writer`, applying this element's transform.
    /// Implementations must drain `reader` and close `writer` promptly
    /// when `cancel` fires rather than leaving the upstream/downstream
    /// end blocked.
    async fn process(
        &self,
        reader: Box<dyn AsyncRead + Send + Unpin>,
        writer: Box<dyn AsyncWrite + Send + Unpin>,
        cancel: CancellationToken,
    ) -> Result<(), TygerError>;
}

/// Lets the reconciler stop a follow-stream at a clean timestamp boundary
/// when the run finalizes, rather than cutting the byte stream mid-line.
pub trait TerminablePipelineElement: PipelineElement {
    fn terminate_at(&self, boundary: DateTime<Utc>);
}

/// Runs `source` through `elements` in sequence, wiring each stage with an
/// in-memory duplex pipe, and returns a reader yielding the final stage's
/// output. Each stage runs in its own task; cancelling `cancel` propagates
/// by closing the chain's readers, which makes each writer observe EOF.
pub fn run_pipeline(
    source: Box<dyn AsyncRead + Send + Unpin>,
    elements: Vec<Arc<dyn PipelineElement>>,
    cancel: CancellationToken,
) -> Box<dyn AsyncRead + Send + Unpin> {
    let mut current: Box<dyn AsyncRead + Send + Unpin> = source;
    for element in elements {
        let (read_half, write_half) = tokio::io::duplex(PIPE_BUFFER_SIZE);
        let reader = std::mem::replace(&mut current, Box::new(read_half));
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = element.process(reader, Box::new(write_half), cancel).await {
                tracing::warn!(error = %err, "pipeline element failed");
            }
        });
    }
    current
}

/// Counts newline-terminated lines as bytes pass through, unmodified.
/// Used by [`crate::archive::archive_logs`] to record `lineCount` metadata
/// without buffering the archive.
#[derive(Default)]
pub struct LineCountingElement {
    count: Arc<AtomicU64>,
}

impl LineCountingElement {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self) -> Arc<AtomicU64> {
        self.count.clone()
    }
}

#[async_trait]
impl PipelineElement for LineCountingElement {
    async fn process(
        &self,
        mut reader: Box<dyn AsyncRead + Send + Unpin>,
        mut writer: Box<dyn AsyncWrite + Send + Unpin>,
        cancel: CancellationToken,
    ) -> Result<(), TygerError> {
        let mut buf = vec![0u8; PIPE_BUFFER_SIZE];
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let n = reader
                .read(&mut buf)
                .await
                .map_err(|e| TygerError::transient(format!("pipeline read: {e}")))?;
            if n == 0 {
                break;
            }
            self.count
                .fetch_add(bytecount(&buf[..n]), Ordering::Relaxed);
            writer
                .write_all(&buf[..n])
                .await
                .map_err(|e| TygerError::transient(format!("pipeline write: {e}")))?;
        }
        let _ = writer.shutdown().await;
        Ok(())
    }
}

fn bytecount(buf: &[u8]) -> u64 {
    buf.iter().filter(|&&b| b == b'\n').count() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn line_counter_passes_bytes_through_unmodified() {
        let element = Arc::new(LineCountingElement::new());
        let counter = element.counter();
        let source: Box<dyn AsyncRead + Send + Unpin> =
            Box::new(std::io::Cursor::new(b"a\nb\nc\n".to_vec()));
        let mut out = run_pipeline(source, vec![element], CancellationToken::new());
        let mut buf = Vec::new();
        out.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"a\nb\nc\n");
        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }
}
