//! Repository (spec §4.1): durable record of codespecs, runs, buffers, tags,
//! and idempotency keys. CRUD + watch + pruning primitives, exposed as a
//! trait so the in-memory implementation here can later sit alongside a
//! real store without the rest of the system noticing.
//!
//! All writes respect optimistic concurrency via `etag`/`tagsVersion`;
//! watchers observe every committed snapshot at least once in commit order
//! (spec §4.1 invariants, §5 ordering guarantees).

mod memory;

pub use memory::InMemoryRepository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tyger_types::{
    Buffer, CodespecRecord, ContinuationToken, IdempotencyRecord, Run, RunStatus, TagSet,
    TygerError,
};

/// Page of results plus an opaque cursor for the next page, or `None` if
/// this was the last page.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ListCodespecsOpts {
    pub limit: usize,
    pub prefix: Option<String>,
    pub continuation_token: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ListBuffersOpts {
    pub limit: usize,
    pub tags: TagSet,
    pub continuation_token: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ListRunsOpts {
    pub limit: usize,
    pub since: Option<DateTime<Utc>>,
    pub status: Option<RunStatus>,
    pub tags: TagSet,
    pub continuation_token: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RunCounts {
    pub pending: u64,
    pub running: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub canceling: u64,
    pub canceled: u64,
}

/// A single committed observation of a run, as delivered by `watch_run`.
pub type RunSnapshot = Run;

#[async_trait]
pub trait Repository: Send + Sync {
    async fn upsert_codespec(
        &self,
        name: &str,
        body: tyger_types::Codespec,
        cancel: &CancellationToken,
    ) -> Result<CodespecRecord, TygerError>;

    async fn get_latest_codespec(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<CodespecRecord, TygerError>;

    async fn get_codespec_at_version(
        &self,
        name: &str,
        version: u32,
        cancel: &CancellationToken,
    ) -> Result<CodespecRecord, TygerError>;

    async fn list_codespecs(
        &self,
        opts: ListCodespecsOpts,
        cancel: &CancellationToken,
    ) -> Result<Page<CodespecRecord>, TygerError>;

    async fn create_buffer(&self, buffer: Buffer, cancel: &CancellationToken) -> Result<Buffer, TygerError>;

    async fn get_buffer(&self, id: &str, cancel: &CancellationToken) -> Result<Buffer, TygerError>;

    async fn update_buffer_tags(
        &self,
        id: &str,
        tags: TagSet,
        if_match_etag: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<Buffer, TygerError>;

    async fn list_buffers(
        &self,
        opts: ListBuffersOpts,
        cancel: &CancellationToken,
    ) -> Result<Page<Buffer>, TygerError>;

    async fn soft_delete_buffer(
        &self,
        id: &str,
        if_match_etag: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<Buffer, TygerError>;

    async fn restore_buffer(&self, id: &str, cancel: &CancellationToken) -> Result<Buffer, TygerError>;

    async fn hard_delete_buffers(
        &self,
        ids: &[String],
        cancel: &CancellationToken,
    ) -> Result<(), TygerError>;

    /// Buffers whose relevant lifecycle timer (active or soft-deleted) has
    /// elapsed, per spec §4.2's `BufferDeleter` two passes.
    async fn get_expired_buffer_ids(
        &self,
        where_soft_deleted: bool,
        active_lifetime: chrono::Duration,
        soft_lifetime: chrono::Duration,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, TygerError>;

    async fn create_run(&self, run: Run, cancel: &CancellationToken) -> Result<Run, TygerError>;

    /// Atomically inserts the idempotency key; a duplicate key within TTL
    /// short-circuits to the first run instead of invoking `create_fn`
    /// (spec §4.1, §8 property 3).
    async fn create_run_with_idempotency_key_guard(
        &self,
        key: &str,
        ttl: chrono::Duration,
        new_run: Run,
        cancel: &CancellationToken,
    ) -> Result<Run, TygerError>;

    async fn list_runs(
        &self,
        opts: ListRunsOpts,
        cancel: &CancellationToken,
    ) -> Result<Page<Run>, TygerError>;

    async fn get_run(&self, id: i64, cancel: &CancellationToken) -> Result<Run, TygerError>;

    /// A stream of every committed snapshot of this run from the moment of
    /// subscription onward, always including the terminal snapshot (spec
    /// §5: "may coalesce if a consumer is slow but the terminal snapshot is
    /// always emitted").
    async fn watch_run(
        &self,
        id: i64,
        cancel: &CancellationToken,
    ) -> Result<std::pin::Pin<Box<dyn futures::Stream<Item = RunSnapshot> + Send>>, TygerError>;

    async fn update_run_status(
        &self,
        id: i64,
        status: RunStatus,
        status_reason: Option<String>,
        running_count: Option<u32>,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Run, TygerError>;

    async fn update_run_tags(
        &self,
        id: i64,
        tags: std::collections::HashMap<String, String>,
        if_match_tags_version: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<Run, TygerError>;

    async fn get_run_counts(
        &self,
        since: Option<DateTime<Utc>>,
        tags: TagSet,
        cancel: &CancellationToken,
    ) -> Result<RunCounts, TygerError>;

    /// Bulk-window prune (spec §9 open question (a): "treated here as bulk
    /// window older than threshold").
    async fn prune_run_modified_at_index(
        &self,
        older_than: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<u64, TygerError>;

    async fn set_run_logs_archived_at(
        &self,
        id: i64,
        archived_at: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<(), TygerError>;
}

pub(crate) fn encode_cursor(created_at: DateTime<Utc>, id: i64, filter_hash: u64) -> String {
    ContinuationToken::new(created_at, id, filter_hash).encode()
}

pub(crate) fn decode_cursor(
    token: &str,
    filter_hash: u64,
) -> Result<ContinuationToken, TygerError> {
    let decoded = ContinuationToken::decode(token)?;
    decoded.check_filter(filter_hash)?;
    Ok(decoded)
}

/// Stable hash of a tag filter, used to bind a continuation token to the
/// filter it was issued under.
pub(crate) fn hash_tag_filter(tags: &TagSet) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    for (k, v) in tags.iter() {
        k.hash(&mut hasher);
        v.hash(&mut hasher);
    }
    hasher.finish()
}
