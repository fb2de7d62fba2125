//! In-memory `Repository` implementation. Grounded for tests and for the
//! "local" deployment profile (spec §1: "the persistent store schema
//! migrations ... the engine only calls a Repository interface" — no real
//! store is in scope, only the semantic contract).

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tyger_types::{
    Buffer, BufferState, CodespecRecord, ErrorKind, IdempotencyRecord, Run, RunStatus, TagSet,
    TygerError,
};

use crate::{
    decode_cursor, encode_cursor, hash_tag_filter, ListBuffersOpts, ListCodespecsOpts,
    ListRunsOpts, Page, Repository, RunCounts, RunSnapshot,
};

const WATCH_CHANNEL_CAPACITY: usize = 64;

#[derive(Default)]
struct State {
    codespecs: HashMap<String, Vec<CodespecRecord>>,
    buffers: HashMap<String, Buffer>,
    runs: HashMap<i64, Run>,
    idempotency: HashMap<String, IdempotencyRecord>,
    watchers: HashMap<i64, broadcast::Sender<Run>>,
}

pub struct InMemoryRepository {
    state: Mutex<State>,
    next_run_id: AtomicI64,
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            next_run_id: AtomicI64::new(1),
        }
    }

    fn publish(&self, state: &mut State, run: &Run) {
        if let Some(sender) = state.watchers.get(&run.id) {
            let _ = sender.send(run.clone());
        }
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<(), TygerError> {
    if cancel.is_cancelled() {
        return Err(TygerError::cancelled());
    }
    Ok(())
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn upsert_codespec(
        &self,
        name: &str,
        body: tyger_types::Codespec,
        cancel: &CancellationToken,
    ) -> Result<CodespecRecord, TygerError> {
        check_cancelled(cancel)?;
        body.validate()?;
        let key = name.to_ascii_lowercase();
        let mut state = self.state.lock();
        let versions = state.codespecs.entry(key).or_default();

        if let Some(latest) = versions.last() {
            if latest.body == body {
                return Ok(latest.clone());
            }
        }

        let next_version = versions.last().map(|r| r.version + 1).unwrap_or(1);
        let record = CodespecRecord {
            name: name.to_string(),
            version: next_version,
            body,
            created_at: Utc::now(),
        };
        versions.push(record.clone());
        Ok(record)
    }

    async fn get_latest_codespec(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<CodespecRecord, TygerError> {
        check_cancelled(cancel)?;
        let state = self.state.lock();
        state
            .codespecs
            .get(&name.to_ascii_lowercase())
            .and_then(|v| v.last())
            .cloned()
            .ok_or_else(|| TygerError::not_found(format!("codespec `{name}` not found")))
    }

    async fn get_codespec_at_version(
        &self,
        name: &str,
        version: u32,
        cancel: &CancellationToken,
    ) -> Result<CodespecRecord, TygerError> {
        check_cancelled(cancel)?;
        let state = self.state.lock();
        let versions = state
            .codespecs
            .get(&name.to_ascii_lowercase())
            .ok_or_else(|| TygerError::not_found(format!("codespec `{name}` not found")))?;
        versions.iter().find(|r| r.version == version).cloned().ok_or_else(|| {
            let latest = versions.last().map(|r| r.version).unwrap_or(0);
            CodespecRecord::missing_version_error(name, version, latest)
        })
    }

    async fn list_codespecs(
        &self,
        opts: ListCodespecsOpts,
        cancel: &CancellationToken,
    ) -> Result<Page<CodespecRecord>, TygerError> {
        check_cancelled(cancel)?;
        let state = self.state.lock();
        let mut latest: Vec<CodespecRecord> = state
            .codespecs
            .values()
            .filter_map(|v| v.last().cloned())
            .filter(|r| opts.prefix.as_ref().is_none_or(|p| r.name.starts_with(p.as_str())))
            .collect();
        latest.sort_by(|a, b| (a.created_at, a.name.clone()).cmp(&(b.created_at, b.name.clone())));

        let filter_hash = hash_tag_filter(&TagSet::new());
        let start = if let Some(token) = &opts.continuation_token {
            let cursor = decode_cursor(token, filter_hash)?;
            latest
                .iter()
                .position(|r| r.created_at > cursor.created_at)
                .unwrap_or(latest.len())
        } else {
            0
        };

        let limit = if opts.limit == 0 { latest.len() } else { opts.limit };
        let page: Vec<_> = latest[start..].iter().take(limit).cloned().collect();
        let next_token = if start + page.len() < latest.len() {
            page.last()
                .map(|r| encode_cursor(r.created_at, r.version as i64, filter_hash))
        } else {
            None
        };

        Ok(Page { items: page, next_token })
    }

    async fn create_buffer(&self, buffer: Buffer, cancel: &CancellationToken) -> Result<Buffer, TygerError> {
        check_cancelled(cancel)?;
        let mut state = self.state.lock();
        if state.buffers.contains_key(&buffer.id) {
            return Err(TygerError::new(
                ErrorKind::Conflict,
                format!("buffer `{}` already exists", buffer.id),
            ));
        }
        state.buffers.insert(buffer.id.clone(), buffer.clone());
        Ok(buffer)
    }

    async fn get_buffer(&self, id: &str, cancel: &CancellationToken) -> Result<Buffer, TygerError> {
        check_cancelled(cancel)?;
        self.state
            .lock()
            .buffers
            .get(id)
            .cloned()
            .ok_or_else(|| TygerError::not_found(format!("buffer `{id}` not found")))
    }

    async fn update_buffer_tags(
        &self,
        id: &str,
        tags: TagSet,
        if_match_etag: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<Buffer, TygerError> {
        check_cancelled(cancel)?;
        let mut state = self.state.lock();
        let buffer = state
            .buffers
            .get_mut(id)
            .ok_or_else(|| TygerError::not_found(format!("buffer `{id}` not found")))?;
        if let Some(expected) = if_match_etag {
            if buffer.etag != expected {
                return Err(TygerError::precondition_failed("buffer etag mismatch"));
            }
        }
        buffer.tags = tags;
        buffer.etag += 1;
        Ok(buffer.clone())
    }

    async fn list_buffers(
        &self,
        opts: ListBuffersOpts,
        cancel: &CancellationToken,
    ) -> Result<Page<Buffer>, TygerError> {
        check_cancelled(cancel)?;
        let state = self.state.lock();
        let mut matching: Vec<Buffer> = state
            .buffers
            .values()
            .filter(|b| b.tags.matches(&opts.tags))
            .cloned()
            .collect();
        matching.sort_by(|a, b| (a.created_at, a.id.clone()).cmp(&(b.created_at, b.id.clone())));

        let filter_hash = hash_tag_filter(&opts.tags);
        let start = if let Some(token) = &opts.continuation_token {
            let cursor = decode_cursor(token, filter_hash)?;
            matching
                .iter()
                .position(|b| b.created_at > cursor.created_at)
                .unwrap_or(matching.len())
        } else {
            0
        };

        let limit = if opts.limit == 0 { matching.len() } else { opts.limit };
        let page: Vec<_> = matching[start..].iter().take(limit).cloned().collect();
        let next_token = if start + page.len() < matching.len() {
            page.last()
                .and_then(|b| b.id.parse::<i64>().ok().or(Some(0)))
                .map(|id| encode_cursor(page.last().unwrap().created_at, id, filter_hash))
        } else {
            None
        };

        Ok(Page { items: page, next_token })
    }

    async fn soft_delete_buffer(
        &self,
        id: &str,
        if_match_etag: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<Buffer, TygerError> {
        check_cancelled(cancel)?;
        let mut state = self.state.lock();
        let buffer = state
            .buffers
            .get_mut(id)
            .ok_or_else(|| TygerError::not_found(format!("buffer `{id}` not found")))?;
        if let Some(expected) = if_match_etag {
            if buffer.etag != expected {
                return Err(TygerError::precondition_failed("buffer etag mismatch"));
            }
        }
        buffer.soft_delete(Utc::now());
        Ok(buffer.clone())
    }

    async fn restore_buffer(&self, id: &str, cancel: &CancellationToken) -> Result<Buffer, TygerError> {
        check_cancelled(cancel)?;
        let mut state = self.state.lock();
        let buffer = state
            .buffers
            .get_mut(id)
            .ok_or_else(|| TygerError::not_found(format!("buffer `{id}` not found")))?;
        buffer.restore();
        Ok(buffer.clone())
    }

    async fn hard_delete_buffers(
        &self,
        ids: &[String],
        cancel: &CancellationToken,
    ) -> Result<(), TygerError> {
        check_cancelled(cancel)?;
        let mut state = self.state.lock();
        for id in ids {
            if let Some(buffer) = state.buffers.get_mut(id) {
                buffer.purge();
            }
        }
        Ok(())
    }

    async fn get_expired_buffer_ids(
        &self,
        where_soft_deleted: bool,
        active_lifetime: chrono::Duration,
        soft_lifetime: chrono::Duration,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, TygerError> {
        check_cancelled(cancel)?;
        let state = self.state.lock();
        let ids = state
            .buffers
            .values()
            .filter(|b| {
                if where_soft_deleted {
                    b.state == BufferState::SoftDeleted
                        && b.soft_deleted_at.is_some_and(|t| now - t >= soft_lifetime)
                } else {
                    b.state == BufferState::Active && now - b.created_at >= active_lifetime
                }
            })
            .map(|b| b.id.clone())
            .collect();
        Ok(ids)
    }

    async fn create_run(&self, mut run: Run, cancel: &CancellationToken) -> Result<Run, TygerError> {
        check_cancelled(cancel)?;
        let mut state = self.state.lock();
        run.id = self.next_run_id.fetch_add(1, Ordering::SeqCst);
        state.runs.insert(run.id, run.clone());
        debug!(run_id = run.id, "run created");
        Ok(run)
    }

    async fn create_run_with_idempotency_key_guard(
        &self,
        key: &str,
        ttl: chrono::Duration,
        new_run: Run,
        cancel: &CancellationToken,
    ) -> Result<Run, TygerError> {
        check_cancelled(cancel)?;
        let now = Utc::now();
        let mut state = self.state.lock();

        if let Some(existing) = state.idempotency.get(key) {
            if !existing.is_expired(now, ttl) {
                let run_id = existing.run_id;
                return state
                    .runs
                    .get(&run_id)
                    .cloned()
                    .ok_or_else(|| TygerError::new(ErrorKind::Fatal, "idempotency record points at missing run"));
            }
        }

        let mut run = new_run;
        run.id = self.next_run_id.fetch_add(1, Ordering::SeqCst);
        state.runs.insert(run.id, run.clone());
        state
            .idempotency
            .insert(key.to_string(), IdempotencyRecord::new(key, run.id, now));
        Ok(run)
    }

    async fn list_runs(
        &self,
        opts: ListRunsOpts,
        cancel: &CancellationToken,
    ) -> Result<Page<Run>, TygerError> {
        check_cancelled(cancel)?;
        let state = self.state.lock();
        let mut matching: Vec<Run> = state
            .runs
            .values()
            .filter(|r| opts.since.is_none_or(|s| r.created_at >= s))
            .filter(|r| opts.status.is_none_or(|s| r.status == s))
            .filter(|r| {
                opts.tags
                    .iter()
                    .all(|(k, v)| r.tags.get(k).map(String::as_str) == Some(v))
            })
            .cloned()
            .collect();
        matching.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));

        let filter_hash = hash_tag_filter(&opts.tags);
        let start = if let Some(token) = &opts.continuation_token {
            let cursor = decode_cursor(token, filter_hash)?;
            matching
                .iter()
                .position(|r| (r.created_at, r.id) > (cursor.created_at, cursor.id))
                .unwrap_or(matching.len())
        } else {
            0
        };

        let limit = if opts.limit == 0 { matching.len() } else { opts.limit };
        let page: Vec<_> = matching[start..].iter().take(limit).cloned().collect();
        let next_token = if start + page.len() < matching.len() {
            page.last().map(|r| encode_cursor(r.created_at, r.id, filter_hash))
        } else {
            None
        };

        Ok(Page { items: page, next_token })
    }

    async fn get_run(&self, id: i64, cancel: &CancellationToken) -> Result<Run, TygerError> {
        check_cancelled(cancel)?;
        self.state
            .lock()
            .runs
            .get(&id)
            .cloned()
            .ok_or_else(|| TygerError::not_found(format!("run {id} not found")))
    }

    async fn watch_run(
        &self,
        id: i64,
        cancel: &CancellationToken,
    ) -> Result<Pin<Box<dyn futures::Stream<Item = RunSnapshot> + Send>>, TygerError> {
        check_cancelled(cancel)?;
        let mut state = self.state.lock();
        let current = state
            .runs
            .get(&id)
            .cloned()
            .ok_or_else(|| TygerError::not_found(format!("run {id} not found")))?;

        let sender = state
            .watchers
            .entry(id)
            .or_insert_with(|| broadcast::channel(WATCH_CHANNEL_CAPACITY).0)
            .clone();
        let receiver = sender.subscribe();
        drop(state);

        let updates = BroadcastStream::new(receiver).filter_map(|r| async move { r.ok() });
        let stream = futures::stream::once(async move { current }).chain(updates);
        Ok(Box::pin(stream))
    }

    async fn update_run_status(
        &self,
        id: i64,
        status: RunStatus,
        status_reason: Option<String>,
        running_count: Option<u32>,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Run, TygerError> {
        check_cancelled(cancel)?;
        let mut state = self.state.lock();
        let run = state
            .runs
            .get_mut(&id)
            .ok_or_else(|| TygerError::not_found(format!("run {id} not found")))?;
        run.transition_to(status, now)?;
        if status_reason.is_some() {
            run.status_reason = status_reason;
        }
        if running_count.is_some() {
            run.running_count = running_count;
        }
        let snapshot = run.clone();
        self.publish(&mut state, &snapshot);
        Ok(snapshot)
    }

    async fn update_run_tags(
        &self,
        id: i64,
        tags: HashMap<String, String>,
        if_match_tags_version: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<Run, TygerError> {
        check_cancelled(cancel)?;
        let mut state = self.state.lock();
        let run = state
            .runs
            .get_mut(&id)
            .ok_or_else(|| TygerError::not_found(format!("run {id} not found")))?;
        if let Some(expected) = if_match_tags_version {
            if run.tags_version != expected {
                return Err(TygerError::precondition_failed("run tagsVersion mismatch"));
            }
        }
        run.tags = tags;
        run.tags_version += 1;
        let snapshot = run.clone();
        self.publish(&mut state, &snapshot);
        Ok(snapshot)
    }

    async fn get_run_counts(
        &self,
        since: Option<DateTime<Utc>>,
        tags: TagSet,
        cancel: &CancellationToken,
    ) -> Result<RunCounts, TygerError> {
        check_cancelled(cancel)?;
        let state = self.state.lock();
        let mut counts = RunCounts::default();
        for run in state.runs.values() {
            if since.is_some_and(|s| run.created_at < s) {
                continue;
            }
            if !tags.iter().all(|(k, v)| run.tags.get(k).map(String::as_str) == Some(v)) {
                continue;
            }
            match run.status {
                RunStatus::Pending => counts.pending += 1,
                RunStatus::Running => counts.running += 1,
                RunStatus::Succeeded => counts.succeeded += 1,
                RunStatus::Failed => counts.failed += 1,
                RunStatus::Canceling => counts.canceling += 1,
                RunStatus::Canceled => counts.canceled += 1,
            }
        }
        Ok(counts)
    }

    async fn prune_run_modified_at_index(
        &self,
        older_than: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<u64, TygerError> {
        check_cancelled(cancel)?;
        let mut state = self.state.lock();
        let mut pruned = 0;
        for run in state.runs.values_mut() {
            if run.status.is_terminal() {
                if let Some(modified_at) = run.modified_at {
                    if modified_at < older_than {
                        run.modified_at = None;
                        pruned += 1;
                    }
                }
            }
        }
        Ok(pruned)
    }

    async fn set_run_logs_archived_at(
        &self,
        id: i64,
        archived_at: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<(), TygerError> {
        check_cancelled(cancel)?;
        let mut state = self.state.lock();
        let run = state
            .runs
            .get_mut(&id)
            .ok_or_else(|| TygerError::not_found(format!("run {id} not found")))?;
        run.logs_archived_at = Some(archived_at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::collections::HashMap as Map;
    use tyger_types::{Codespec, CodespecKind, RunCodeTarget, RunKind};

    fn sample_codespec() -> tyger_types::Codespec {
        Codespec {
            kind: CodespecKind::Job,
            image: "busybox".into(),
            command: vec!["echo".into(), "hi".into()],
            args: vec![],
            env: Map::new(),
            resources: Default::default(),
            max_replicas: 1,
            buffers: Default::default(),
            endpoints: Map::new(),
            sockets: vec![],
        }
    }

    fn sample_run() -> Run {
        Run {
            id: 0,
            kind: RunKind::User,
            job: RunCodeTarget {
                codespec_ref: tyger_types::CodespecRef::Named {
                    name: "echo".into(),
                    version: None,
                },
                buffers: Map::new(),
                node_pool: None,
                replicas: 1,
            },
            worker: None,
            buffers: Map::new(),
            cluster: None,
            timeout_seconds: 3600,
            status: RunStatus::Pending,
            status_reason: None,
            running_count: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            modified_at: None,
            logs_archived_at: None,
            tags: Map::new(),
            tags_version: 0,
        }
    }

    #[tokio::test]
    async fn upsert_codespec_idempotent_on_same_body() {
        let repo = InMemoryRepository::new();
        let cancel = CancellationToken::new();
        let r1 = repo.upsert_codespec("echo", sample_codespec(), &cancel).await.unwrap();
        let r2 = repo.upsert_codespec("echo", sample_codespec(), &cancel).await.unwrap();
        assert_eq!(r1.version, 1);
        assert_eq!(r2.version, 1);

        let mut changed = sample_codespec();
        changed.image = "alpine".into();
        let r3 = repo.upsert_codespec("echo", changed, &cancel).await.unwrap();
        assert_eq!(r3.version, 2);
    }

    #[tokio::test]
    async fn missing_version_names_latest() {
        let repo = InMemoryRepository::new();
        let cancel = CancellationToken::new();
        repo.upsert_codespec("echo", sample_codespec(), &cancel).await.unwrap();
        let err = repo
            .get_codespec_at_version("echo", 7, &cancel)
            .await
            .unwrap_err();
        assert!(err.message().contains("latest is 1"));
    }

    #[tokio::test]
    async fn idempotency_guard_returns_same_run() {
        let repo = InMemoryRepository::new();
        let cancel = CancellationToken::new();
        let ttl = chrono::Duration::hours(1);
        let r1 = repo
            .create_run_with_idempotency_key_guard("k1", ttl, sample_run(), &cancel)
            .await
            .unwrap();
        let r2 = repo
            .create_run_with_idempotency_key_guard("k1", ttl, sample_run(), &cancel)
            .await
            .unwrap();
        assert_eq!(r1.id, r2.id);
    }

    #[tokio::test]
    async fn buffer_tag_update_respects_etag() {
        let repo = InMemoryRepository::new();
        let cancel = CancellationToken::new();
        let buffer = Buffer::new("buf1", "zone-a", Utc::now());
        repo.create_buffer(buffer, &cancel).await.unwrap();

        let mut tags = TagSet::new();
        tags.insert("owner", "alice");
        let updated = repo
            .update_buffer_tags("buf1", tags, Some(0), &cancel)
            .await
            .unwrap();
        assert_eq!(updated.etag, 1);

        let err = repo
            .update_buffer_tags("buf1", TagSet::new(), Some(0), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
    }

    #[tokio::test]
    async fn watch_run_emits_current_snapshot_first() {
        let repo = InMemoryRepository::new();
        let cancel = CancellationToken::new();
        let run = repo.create_run(sample_run(), &cancel).await.unwrap();

        let mut stream = repo.watch_run(run.id, &cancel).await.unwrap();
        let first = stream.next().await.unwrap();
        assert_eq!(first.status, RunStatus::Pending);

        repo.update_run_status(run.id, RunStatus::Running, None, None, Utc::now(), &cancel)
            .await
            .unwrap();
        let second = stream.next().await.unwrap();
        assert_eq!(second.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn list_runs_pages_with_continuation_token() {
        let repo = InMemoryRepository::new();
        let cancel = CancellationToken::new();
        for _ in 0..5 {
            repo.create_run(sample_run(), &cancel).await.unwrap();
        }

        let first_page = repo
            .list_runs(
                ListRunsOpts {
                    limit: 2,
                    ..Default::default()
                },
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(first_page.items.len(), 2);
        assert!(first_page.next_token.is_some());

        let second_page = repo
            .list_runs(
                ListRunsOpts {
                    limit: 2,
                    continuation_token: first_page.next_token,
                    ..Default::default()
                },
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(second_page.items.len(), 2);
    }
}
