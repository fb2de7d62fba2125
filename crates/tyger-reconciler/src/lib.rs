//! Run Reconciler / Sweeper (C5, spec §4.5): a single cooperative loop per
//! process that folds `BackendEvent`s into persisted run status, enforces
//! `timeoutSeconds`, archives logs and tears down the backend workload on
//! terminal transition, and periodically prunes the `modifiedAt` index.
//!
//! Crash-safety invariant: every step only ever derives new state from the
//! run's persisted row plus the backend's own observable state, so a crash
//! at any point is resumed correctly by the next sweep rather than by any
//! reconciler-private bookkeeping.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tyger_backend::{Backend, DeleteCascade};
use tyger_config::RunConfig;
use tyger_dataplane::ObjectStore;
use tyger_repository::{ListRunsOpts, Repository};
use tyger_types::{BackendEvent, BackendHandle, BackendPhase, ErrorKind, Run, RunStatus, TygerError};

/// Reverses `BackendHandle::for_run`'s `"run-<id>"` naming convention.
fn run_id_of(handle: &BackendHandle) -> Option<i64> {
    handle.0.strip_prefix("run-").and_then(|s| s.parse().ok())
}

fn status_for_phase(event: &BackendEvent) -> RunStatus {
    match event.phase {
        BackendPhase::Pending => RunStatus::Pending,
        BackendPhase::Running => RunStatus::Running,
        BackendPhase::Succeeded => RunStatus::Succeeded,
        BackendPhase::Failed => RunStatus::Failed,
    }
}

fn running_count(event: &BackendEvent) -> u32 {
    event
        .replica_states
        .iter()
        .filter(|r| r.phase == BackendPhase::Running)
        .count() as u32
}

pub struct Reconciler {
    repository: Arc<dyn Repository>,
    backend: Arc<dyn Backend>,
    store: Arc<dyn ObjectStore>,
    config: RunConfig,
    /// `run_id -> handle`, rebuilt from `list_runs` on startup and kept
    /// current from `Backend::submit` call sites; purely a lookup cache,
    /// never the source of truth for run state.
    handles: Mutex<HashMap<i64, BackendHandle>>,
}

impl Reconciler {
    pub fn new(
        repository: Arc<dyn Repository>,
        backend: Arc<dyn Backend>,
        store: Arc<dyn ObjectStore>,
        config: RunConfig,
    ) -> Self {
        Self {
            repository,
            backend,
            store,
            config,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Registers the handle a freshly submitted run was assigned, so the
    /// reconciler can fold its `BackendEvent`s and later archive/delete it.
    /// Calling this isn't required for correctness — `run_id_of` recovers
    /// the same handle deterministically — but avoids the string-parse
    /// round trip on the hot path.
    pub fn track(&self, run_id: i64, handle: BackendHandle) {
        self.handles.lock().insert(run_id, handle);
    }

    fn handle_for(&self, run_id: i64) -> BackendHandle {
        self.handles
            .lock()
            .get(&run_id)
            .cloned()
            .unwrap_or_else(|| BackendHandle::for_run(run_id))
    }

    /// Spawns the event-folding loop and the periodic prune ticker as
    /// independent background tasks, both governed by `cancel` — the same
    /// shape as `tyger_buffers::BufferDeleter::spawn`.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let events_task = {
            let this = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { this.run_event_loop(cancel).await })
        };
        let prune_task = {
            let this = self.clone();
            tokio::spawn(async move { this.run_prune_ticker(cancel).await })
        };
        vec![events_task, prune_task]
    }

    async fn run_event_loop(&self, cancel: CancellationToken) {
        let mut events = match self.backend.watch(&cancel).await {
            Ok(s) => s,
            Err(err) => {
                warn!(error = %err, "reconciler failed to open backend watch stream");
                return;
            }
        };
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("reconciler event loop shutting down");
                    return;
                }
                event = events.next() => {
                    match event {
                        Some(event) => {
                            if let Err(err) = self.fold_event(event, &cancel).await {
                                warn!(error = %err, "failed to fold backend event");
                            }
                        }
                        None => return,
                    }
                }
            }
        }
    }

    async fn fold_event(&self, event: BackendEvent, cancel: &CancellationToken) -> Result<(), TygerError> {
        let Some(run_id) = run_id_of(&event.handle) else {
            return Ok(());
        };
        let new_status = status_for_phase(&event);
        let run = self
            .repository
            .update_run_status(
                run_id,
                new_status,
                event.exit_reasons.first().cloned(),
                Some(running_count(&event)),
                event.terminated_at.unwrap_or_else(Utc::now),
                cancel,
            )
            .await?;
        if event.is_terminal() {
            self.finalize(&run, &event.handle, cancel).await?;
        }
        Ok(())
    }

    /// Step 3: collect logs, archive them, then delete the backend
    /// workload. Log-archival failure only blocks deletion unless the run
    /// succeeded and the archive blob already exists, in which case a
    /// stale archive attempt is allowed to fall through to deletion
    /// (spec §4.5's failure model).
    async fn finalize(&self, run: &Run, handle: &BackendHandle, cancel: &CancellationToken) -> Result<(), TygerError> {
        if run.logs_archived_at.is_none() {
            match self.archive_logs(run, handle, cancel).await {
                Ok(()) => {}
                Err(err) => {
                    let already_archived = tyger_logs::archive::is_archived(&self.store, run.id).await;
                    let can_proceed = run.status == RunStatus::Succeeded && already_archived;
                    if !can_proceed {
                        warn!(run_id = run.id, error = %err, "log archival failed, retrying next sweep");
                        return Err(err);
                    }
                }
            }
        }
        self.delete_backend(handle, DeleteCascade::Foreground, cancel).await?;
        self.handles.lock().remove(&run.id);
        Ok(())
    }

    /// Tears down the backend workload, treating a handle the backend no
    /// longer recognizes as an already-successful delete rather than a
    /// failure — the canceling sweep and `finalize` both tear down the
    /// same handle, and the second one in is expected to find it gone.
    async fn delete_backend(
        &self,
        handle: &BackendHandle,
        cascade: DeleteCascade,
        cancel: &CancellationToken,
    ) -> Result<(), TygerError> {
        match self.backend.delete(handle, cascade, cancel).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn archive_logs(&self, run: &Run, handle: &BackendHandle, cancel: &CancellationToken) -> Result<(), TygerError> {
        let stream = self.backend.stream_logs(handle, None, false, cancel).await?;
        let reader = tokio_util::io::StreamReader::new(
            stream.map(|r| r.map_err(std::io::Error::other)),
        );
        tyger_logs::archive_logs(&self.store, run.id, reader, cancel).await?;
        self.repository
            .set_run_logs_archived_at(run.id, Utc::now(), cancel)
            .await
    }

    /// Step 2, run once per sweep: cancels any run that has exceeded its
    /// `timeoutSeconds` and hasn't reached a terminal status yet.
    async fn enforce_timeouts(&self, cancel: &CancellationToken) -> Result<(), TygerError> {
        let now = Utc::now();
        for status in [RunStatus::Pending, RunStatus::Running] {
            let page = self
                .repository
                .list_runs(
                    ListRunsOpts {
                        limit: 1000,
                        status: Some(status),
                        ..Default::default()
                    },
                    cancel,
                )
                .await?;
            for run in page.items {
                let Some(started_at) = run.started_at else { continue };
                let elapsed = now.signed_duration_since(started_at);
                if elapsed > chrono::Duration::seconds(run.timeout_seconds) {
                    let handle = self.handle_for(run.id);
                    self.backend.delete(&handle, DeleteCascade::Foreground, cancel).await.ok();
                    self.repository
                        .update_run_status(
                            run.id,
                            RunStatus::Canceling,
                            Some("timeout exceeded".into()),
                            run.running_count,
                            now,
                            cancel,
                        )
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Step, run once per sweep: a run sitting in `Canceling` (from either
    /// `cancel_run`'s background delete or `enforce_timeouts` above) is
    /// advanced to the terminal `Canceled` status once the backend
    /// confirms its handle is gone (spec §4.5, `canceling -- backend gone
    /// --> canceled`). No `BackendEvent` phase models this — a torn-down
    /// handle simply stops producing events — so this is driven by polling
    /// rather than folded from `Backend::watch`.
    async fn reconcile_canceling_runs(&self, cancel: &CancellationToken) -> Result<(), TygerError> {
        let page = self
            .repository
            .list_runs(
                ListRunsOpts {
                    limit: 1000,
                    status: Some(RunStatus::Canceling),
                    ..Default::default()
                },
                cancel,
            )
            .await?;
        for run in page.items {
            let handle = self.handle_for(run.id);
            match self.finalize(&run, &handle, cancel).await {
                Ok(()) => {
                    self.repository
                        .update_run_status(run.id, RunStatus::Canceled, run.status_reason.clone(), run.running_count, Utc::now(), cancel)
                        .await?;
                }
                Err(err) => {
                    warn!(run_id = run.id, error = %err, "backend teardown not yet confirmed, retrying next sweep");
                }
            }
        }
        Ok(())
    }

    async fn run_prune_ticker(&self, cancel: CancellationToken) {
        let interval = Duration::from_secs(self.config.prune_modified_at_interval_secs);
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("reconciler prune ticker shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    let tick_cancel = cancel.child_token();
                    if let Err(err) = self.enforce_timeouts(&tick_cancel).await {
                        warn!(error = %err, "timeout enforcement pass failed");
                    }
                    if let Err(err) = self.reconcile_canceling_runs(&tick_cancel).await {
                        warn!(error = %err, "canceling-run reconciliation pass failed");
                    }
                    let threshold = Utc::now() - chrono::Duration::seconds(self.config.prune_modified_at_interval_secs as i64 * 6);
                    match self.repository.prune_run_modified_at_index(threshold, &tick_cancel).await {
                        Ok(pruned) => info!(pruned, "pruned modifiedAt index"),
                        Err(err) => warn!(error = %err, "prune pass failed"),
                    }
                }
            }
        }
    }

    /// Test-only synchronous full pass (spec §4.5 step 5's `SweepRuns()`):
    /// one round of timeout enforcement and one pruning call, without the
    /// event-folding loop (that's driven by `Backend::watch` directly).
    pub async fn sweep_once(&self, cancel: &CancellationToken) -> Result<(), TygerError> {
        self.enforce_timeouts(cancel).await?;
        self.reconcile_canceling_runs(cancel).await?;
        self.repository
            .prune_run_modified_at_index(Utc::now() - chrono::Duration::days(7), cancel)
            .await?;
        Ok(())
    }
}
