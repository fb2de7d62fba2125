//! Log archival (spec §4.6): on run termination, drain the pipeline
//! through a line-counting stream, upload the bytes to `runs/<runId>`, and
//! record `lineCount` as a sidecar blob. Overwrite is permitted only on
//! retry of the same (incomplete) archive, enforced by the `ObjectStore`'s
//! own conditional-create semantics.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tyger_dataplane::ObjectStore;
use tyger_types::TygerError;

const ARCHIVE_CONTAINER: &str = "logs";

fn blob_name(run_id: i64) -> String {
    format!("runs/{run_id}")
}

fn meta_blob_name(run_id: i64) -> String {
    format!("runs/{run_id}.lines")
}

fn md5_of(data: &[u8]) -> [u8; 16] {
    use md5::Digest;
    md5::Md5::digest(data).into()
}

/// Drains `reader` (the pipeline's output for a finalized run) into the
/// archive and returns the line count recorded alongside it.
pub async fn archive_logs<R>(
    store: &Arc<dyn ObjectStore>,
    run_id: i64,
    mut reader: R,
    cancel: &CancellationToken,
) -> Result<u64, TygerError>
where
    R: AsyncRead + Unpin + Send,
{
    if cancel.is_cancelled() {
        return Err(TygerError::cancelled());
    }
    let mut buf = Vec::new();
    reader
        .read_to_end(&mut buf)
        .await
        .map_err(|e| TygerError::transient(format!("drain log pipeline: {e}")))?;
    let line_count = buf.iter().filter(|&&b| b == b'\n').count() as u64;

    let data = Bytes::from(buf);
    store
        .put_block(ARCHIVE_CONTAINER, &blob_name(run_id), data.clone(), md5_of(&data))
        .await?;
    let count_bytes = Bytes::from(line_count.to_string());
    store
        .put_block(
            ARCHIVE_CONTAINER,
            &meta_blob_name(run_id),
            count_bytes.clone(),
            md5_of(&count_bytes),
        )
        .await?;
    Ok(line_count)
}

pub async fn is_archived(store: &Arc<dyn ObjectStore>, run_id: i64) -> bool {
    store
        .list_blob_names(ARCHIVE_CONTAINER, &blob_name(run_id))
        .await
        .map(|names| names.iter().any(|n| n == &blob_name(run_id)))
        .unwrap_or(false)
}

/// Reads the archived blob and its recorded line count back out.
pub async fn open_archive(
    store: &Arc<dyn ObjectStore>,
    run_id: i64,
) -> Result<(Bytes, Option<u64>), TygerError> {
    let (data, _) = store.get_block(ARCHIVE_CONTAINER, &blob_name(run_id)).await?;
    let line_count = match store.get_block(ARCHIVE_CONTAINER, &meta_blob_name(run_id)).await {
        Ok((bytes, _)) => std::str::from_utf8(&bytes).ok().and_then(|s| s.parse().ok()),
        Err(_) => None,
    };
    Ok((data, line_count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tyger_dataplane::InMemoryObjectStore;

    #[tokio::test]
    async fn archives_and_reopens_with_line_count() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::default());
        let cancel = CancellationToken::new();
        let data = b"line one\nline two\nline three\n".to_vec();
        let count = archive_logs(&store, 1, std::io::Cursor::new(data.clone()), &cancel)
            .await
            .unwrap();
        assert_eq!(count, 3);
        assert!(is_archived(&store, 1).await);

        let (reopened, line_count) = open_archive(&store, 1).await.unwrap();
        assert_eq!(reopened.to_vec(), data);
        assert_eq!(line_count, Some(3));
    }

    #[tokio::test]
    async fn retrying_an_incomplete_archive_with_identical_bytes_succeeds() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::default());
        let cancel = CancellationToken::new();
        let data = b"only line\n".to_vec();
        archive_logs(&store, 2, std::io::Cursor::new(data.clone()), &cancel)
            .await
            .unwrap();
        // Same content re-archived (e.g. reconciler retry after a crash
        // before `logsArchivedAt` was persisted) is a no-op, not a conflict.
        let count = archive_logs(&store, 2, std::io::Cursor::new(data), &cancel)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
