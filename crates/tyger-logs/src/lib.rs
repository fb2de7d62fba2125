//! Log Source & Archive (C6, spec §4.6): a uniform read interface over
//! live backend logs and archived blob logs, implementing `follow`,
//! `tailLines`, `since`, and timestamp-include filters; and the archival
//! path that persists a finalized run's logs once.

pub mod archive;
pub mod filter;
pub mod pipeline;
pub mod source;

use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::Stream;
use tokio_util::sync::CancellationToken;
use tyger_backend::Backend;
use tyger_dataplane::ObjectStore;
use tyger_types::{BackendHandle, Run, TygerError};

pub type LogStream = Pin<Box<dyn Stream<Item = Result<Bytes, TygerError>> + Send>>;

#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub include_timestamps: bool,
    pub tail_lines: Option<u64>,
    pub since: Option<DateTime<Utc>>,
    pub follow: bool,
}

/// `GetLogs(runId, opts) -> Pipeline | NotFound` (spec §4.6). Picks the
/// live or archived path based on whether the run has already been
/// archived (`run.logs_archived_at.is_some()`); the live path needs the
/// backend handle the reconciler tracks for this run.
pub async fn get_logs(
    backend: Arc<dyn Backend>,
    store: Arc<dyn ObjectStore>,
    run: &Run,
    handle: Option<&BackendHandle>,
    opts: LogOptions,
    cancel: &CancellationToken,
) -> Result<LogStream, TygerError> {
    if run.logs_archived_at.is_some() {
        return get_archived_logs(&store, run.id, opts).await;
    }
    let handle = handle
        .ok_or_else(|| TygerError::not_found(format!("run {} has no live backend handle", run.id)))?;
    let follow = opts.follow;
    let include_timestamps = opts.include_timestamps;
    let raw = source::resumable_live_stream(backend, handle.clone(), opts.since, follow, cancel.clone());
    if include_timestamps {
        Ok(raw)
    } else {
        Ok(Box::pin(futures::StreamExt::map(raw, |item| {
            item.map(strip_timestamp_prefix)
        })))
    }
}

fn strip_timestamp_prefix(line: Bytes) -> Bytes {
    let Ok(text) = std::str::from_utf8(&line) else {
        return line;
    };
    match text.find(' ') {
        Some(space) if DateTime::parse_from_rfc3339(&text[..space]).is_ok() => {
            line.slice(space + 1..)
        }
        _ => line,
    }
}

async fn get_archived_logs(
    store: &Arc<dyn ObjectStore>,
    run_id: i64,
    opts: LogOptions,
) -> Result<LogStream, TygerError> {
    let (data, line_count) = archive::open_archive(store, run_id).await?;
    let unfiltered = opts.tail_lines.is_none() && opts.since.is_none() && opts.include_timestamps;
    if unfiltered {
        return Ok(Box::pin(futures::stream::once(async move { Ok(data) })));
    }
    let reader = tokio::io::BufReader::new(std::io::Cursor::new(data));
    Ok(filter::filter_archive_lines(reader, line_count, opts))
}

/// Drains `reader` (a finalized run's log pipeline output) into the
/// archive, returning the recorded line count. Thin re-export so callers
/// only need `tyger_logs::archive_logs` / `tyger_logs::ArchiveLogs`.
pub async fn archive_logs<R>(
    store: &Arc<dyn ObjectStore>,
    run_id: i64,
    reader: R,
    cancel: &CancellationToken,
) -> Result<u64, TygerError>
where
    R: tokio::io::AsyncRead + Unpin + Send,
{
    archive::archive_logs(store, run_id, reader, cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tyger_backend::workload::ResolvedCodespec;
    use tyger_backend::{BackendWorkloadSpec, StubBackend};
    use tyger_dataplane::InMemoryObjectStore;
    use tyger_types::{BackendPhase, BufferParameters, Codespec, CodespecKind, Resources, RunKind, RunStatus};

    fn workload(run_id: i64) -> BackendWorkloadSpec {
        BackendWorkloadSpec {
            run_id,
            job: ResolvedCodespec {
                name: Some("job".into()),
                version: Some(1),
                body: Codespec {
                    kind: CodespecKind::Job,
                    image: "img:latest".into(),
                    command: Vec::new(),
                    args: Vec::new(),
                    env: Default::default(),
                    resources: Resources::default(),
                    max_replicas: 1,
                    buffers: BufferParameters::default(),
                    endpoints: Default::default(),
                    sockets: Vec::new(),
                },
                replicas: 1,
                node_pool: None,
            },
            worker: None,
            buffer_urls: Default::default(),
            relay_topology: Vec::new(),
            timeout_seconds: 3600,
            secrets: Default::default(),
        }
    }

    fn run(id: i64, archived: bool) -> Run {
        Run {
            id,
            kind: RunKind::User,
            job: tyger_types::RunCodeTarget {
                codespec_ref: tyger_types::CodespecRef::Named {
                    name: "job".into(),
                    version: None,
                },
                buffers: Default::default(),
                node_pool: None,
                replicas: 1,
            },
            worker: None,
            buffers: Default::default(),
            cluster: None,
            timeout_seconds: 3600,
            status: RunStatus::Running,
            status_reason: None,
            running_count: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            modified_at: None,
            logs_archived_at: archived.then(Utc::now),
            tags: Default::default(),
            tags_version: 0,
        }
    }

    #[tokio::test]
    async fn live_run_without_handle_is_not_found() {
        let backend: Arc<dyn Backend> = Arc::new(StubBackend::new());
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::default());
        let cancel = CancellationToken::new();
        let err = get_logs(backend, store, &run(1, false), None, LogOptions::default(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), tyger_types::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn live_run_streams_from_backend() {
        let backend = Arc::new(StubBackend::new());
        let cancel = CancellationToken::new();
        let handle = backend.submit(&workload(5), &cancel).await.unwrap();
        backend.advance(&handle, BackendPhase::Running);
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::default());
        let mut stream = get_logs(
            backend.clone(),
            store,
            &run(5, false),
            Some(&handle),
            LogOptions {
                include_timestamps: false,
                ..Default::default()
            },
            &cancel,
        )
        .await
        .unwrap();
        assert!(stream.next().await.is_some());
    }

    #[tokio::test]
    async fn archived_run_reads_back_through_filter() {
        let backend: Arc<dyn Backend> = Arc::new(StubBackend::new());
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::default());
        let cancel = CancellationToken::new();
        let data = b"2026-01-01T00:00:00.000000000Z hello\n".to_vec();
        archive_logs(&store, 9, std::io::Cursor::new(data), &cancel).await.unwrap();

        let mut stream = get_logs(
            backend,
            store,
            &run(9, true),
            None,
            LogOptions {
                include_timestamps: false,
                ..Default::default()
            },
            &cancel,
        )
        .await
        .unwrap();
        let line = stream.next().await.unwrap().unwrap();
        assert_eq!(&line[..], b"hello\n");
    }
}
