//! An in-memory [`Backend`] used by the reconciler's own tests and by
//! scenario tests that need a full Run Creator -> Backend Adapter ->
//! Reconciler loop without a real cluster or container engine.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tyger_types::{BackendEvent, BackendHandle, BackendPhase, ErrorKind, ReplicaState, TygerError};

use crate::backend::{Backend, DeleteCascade, LogStream};
use crate::BackendWorkloadSpec;

#[derive(Clone)]
struct StubRun {
    handle: BackendHandle,
    replicas: u32,
    phase: BackendPhase,
    deleted: bool,
}

/// Test/demo backend: every submitted run starts `Pending`, can be driven
/// through its lifecycle with [`StubBackend::advance`], and emits each
/// transition on the shared watch channel.
pub struct StubBackend {
    runs: Mutex<HashMap<String, StubRun>>,
    events: broadcast::Sender<BackendEvent>,
}

impl Default for StubBackend {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            runs: Mutex::new(HashMap::new()),
            events: tx,
        }
    }
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Manually moves a submitted run to `phase`, synthesizing one replica
    /// state per replica and broadcasting the resulting event.
    pub fn advance(&self, handle: &BackendHandle, phase: BackendPhase) {
        let event = {
            let mut runs = self.runs.lock();
            let run = match runs.get_mut(&handle.0) {
                Some(r) => r,
                None => return,
            };
            run.phase = phase;
            let replica_states: Vec<ReplicaState> = (0..run.replicas.max(1))
                .map(|_| ReplicaState {
                    phase,
                    restart_count: 0,
                    exit_code: match phase {
                        BackendPhase::Succeeded => Some(0),
                        BackendPhase::Failed => Some(1),
                        _ => None,
                    },
                    reason: None,
                })
                .collect();
            BackendEvent {
                handle: handle.clone(),
                phase,
                replica_states,
                terminated_at: matches!(phase, BackendPhase::Succeeded | BackendPhase::Failed)
                    .then(Utc::now),
                exit_reasons: Vec::new(),
            }
        };
        let _ = self.events.send(event);
    }

    pub fn is_deleted(&self, handle: &BackendHandle) -> bool {
        self.runs
            .lock()
            .get(&handle.0)
            .map(|r| r.deleted)
            .unwrap_or(true)
    }
}

#[async_trait]
impl Backend for StubBackend {
    async fn submit(
        &self,
        spec: &BackendWorkloadSpec,
        _cancel: &CancellationToken,
    ) -> Result<BackendHandle, TygerError> {
        let handle = BackendHandle::for_run(spec.run_id);
        let mut runs = self.runs.lock();
        runs.entry(handle.0.clone()).or_insert_with(|| StubRun {
            handle: handle.clone(),
            replicas: spec.worker.as_ref().map(|w| w.replicas).unwrap_or(spec.job.replicas),
            phase: BackendPhase::Pending,
            deleted: false,
        });
        Ok(handle)
    }

    async fn watch(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<std::pin::Pin<Box<dyn futures::Stream<Item = BackendEvent> + Send>>, TygerError> {
        let rx = self.events.subscribe();
        let s = BroadcastStream::new(rx).filter_map(|r| async move { r.ok() });
        Ok(Box::pin(s))
    }

    async fn stream_logs(
        &self,
        handle: &BackendHandle,
        _since: Option<DateTime<Utc>>,
        _follow: bool,
        _cancel: &CancellationToken,
    ) -> Result<LogStream, TygerError> {
        if !self.runs.lock().contains_key(&handle.0) {
            return Err(TygerError::not_found(format!("no such backend handle {}", handle.0)));
        }
        let line = bytes::Bytes::from(format!("stub log line for {}\n", handle.0));
        Ok(Box::pin(stream::once(async move { Ok(line) })))
    }

    async fn delete(
        &self,
        handle: &BackendHandle,
        _cascade: DeleteCascade,
        _cancel: &CancellationToken,
    ) -> Result<(), TygerError> {
        let mut runs = self.runs.lock();
        match runs.get_mut(&handle.0) {
            Some(run) => {
                run.deleted = true;
                Ok(())
            }
            None => Err(TygerError::new(ErrorKind::NotFound, format!("no such backend handle {}", handle.0))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::ResolvedCodespec;
    use std::collections::HashMap as Map;
    use tyger_types::{BufferParameters, Codespec, CodespecKind, Resources};

    fn spec(run_id: i64) -> BackendWorkloadSpec {
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
                    env: Map::new(),
                    resources: Resources::default(),
                    max_replicas: 1,
                    buffers: BufferParameters::default(),
                    endpoints: Map::new(),
                    sockets: Vec::new(),
                },
                replicas: 1,
                node_pool: None,
            },
            worker: None,
            buffer_urls: Map::new(),
            relay_topology: Vec::new(),
            timeout_seconds: 3600,
            secrets: Map::new(),
        }
    }

    #[tokio::test]
    async fn submit_is_idempotent_per_run() {
        let backend = StubBackend::new();
        let cancel = CancellationToken::new();
        let s = spec(42);
        let h1 = backend.submit(&s, &cancel).await.unwrap();
        let h2 = backend.submit(&s, &cancel).await.unwrap();
        assert_eq!(h1.0, h2.0);
        assert_eq!(backend.runs.lock().len(), 1);
    }

    #[tokio::test]
    async fn advance_emits_watch_event() {
        let backend = Arc::new(StubBackend::new());
        let cancel = CancellationToken::new();
        let handle = backend.submit(&spec(7), &cancel).await.unwrap();
        let mut events = backend.watch(&cancel).await.unwrap();
        let b2 = backend.clone();
        let h2 = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            b2.advance(&h2, BackendPhase::Succeeded);
        });
        let ev = events.next().await.unwrap();
        assert_eq!(ev.handle.0, handle.0);
        assert!(ev.is_terminal());
        assert!(ev.all_replicas_succeeded());
    }

    #[tokio::test]
    async fn delete_unknown_handle_errors() {
        let backend = StubBackend::new();
        let cancel = CancellationToken::new();
        let result = backend
            .delete(&BackendHandle::for_run(999), DeleteCascade::Foreground, &cancel)
            .await;
        assert!(result.is_err());
    }
}
