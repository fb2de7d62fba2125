//! Runs (spec §3): an execution of a codespec with concrete buffer bindings.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::codespec::CodespecRef;
use crate::error::{ErrorKind, TygerError};
use crate::quantity::Quantity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    User,
    System,
}

/// `status` transitions one-directionally toward a terminal state; the
/// terminal three are absorbing (spec §3, §8 property 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceling,
    Canceled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Canceled
        )
    }

    /// Whether `self -> next` is a legal single-step transition under the
    /// state machine in spec §4.4.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        match (self, next) {
            (a, b) if a == b => true,
            (Pending, Running) | (Pending, Failed) => true,
            (Running, Succeeded) | (Running, Failed) | (Running, Canceling) => true,
            (Canceling, Canceled) => true,
            _ => false,
        }
    }
}

/// A buffer binding argument: a concrete buffer ID, the ephemeral-buffer
/// sentinel `"_"`, or simply absent (spec §4.3).
///
/// Both variants are plain JSON strings on the wire, so this can't be a
/// `#[serde(untagged)]` enum: untagged variant matching tries `Id(String)`
/// first and it accepts any string, including the literal `"_"`, before
/// `Ephemeral` is ever considered. The sentinel has to be special-cased
/// ahead of the fallback to `Id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferArg {
    Id(String),
    Ephemeral,
}

impl BufferArg {
    pub const EPHEMERAL_SENTINEL: &'static str = "_";

    pub fn parse(raw: &str) -> Self {
        if raw == Self::EPHEMERAL_SENTINEL {
            BufferArg::Ephemeral
        } else {
            BufferArg::Id(raw.to_string())
        }
    }
}

impl Serialize for BufferArg {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            BufferArg::Id(id) => serializer.serialize_str(id),
            BufferArg::Ephemeral => serializer.serialize_str(Self::EPHEMERAL_SENTINEL),
        }
    }
}

impl<'de> Deserialize<'de> for BufferArg {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(BufferArg::parse(&raw))
    }
}

/// One half of a run's `job`/`worker` target (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunCodeTarget {
    pub codespec_ref: CodespecRef,
    #[serde(default)]
    pub buffers: HashMap<String, BufferArg>,
    #[serde(default)]
    pub node_pool: Option<String>,
    #[serde(default = "default_replicas")]
    pub replicas: u32,
}

fn default_replicas() -> u32 {
    1
}

fn default_timeout_seconds() -> i64 {
    12 * 3600
}

/// A run row as persisted by the repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: i64,
    pub kind: RunKind,
    pub job: RunCodeTarget,
    #[serde(default)]
    pub worker: Option<RunCodeTarget>,
    /// Buffer parameter name → resolved buffer ID, after Run Creator
    /// materialization (spec §4.3 step 3); ephemeral buffers appear here
    /// under their `temp-<uniqueId>` name.
    #[serde(default)]
    pub buffers: HashMap<String, String>,
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: i64,
    pub status: RunStatus,
    #[serde(default)]
    pub status_reason: Option<String>,
    #[serde(default)]
    pub running_count: Option<u32>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Nullable; pruned after finalization + grace period (spec §4.5 step
    /// 4, `PruneRunModifiedAtIndex`).
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub logs_archived_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub tags_version: u64,
}

impl Run {
    /// Attempt the transition; rejects any move that is not one step
    /// forward on the state machine (spec §8 property 2: no backtracking).
    pub fn transition_to(&mut self, next: RunStatus, now: DateTime<Utc>) -> Result<(), TygerError> {
        if !self.status.can_transition_to(next) {
            return Err(TygerError::new(
                ErrorKind::Invalid,
                format!("illegal run transition {:?} -> {next:?}", self.status),
            ));
        }
        if self.status == next {
            return Ok(());
        }
        self.status = next;
        self.modified_at = Some(now);
        if next == RunStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        Ok(())
    }
}

/// Per-parameter resource request paired with its limit, attached to a
/// `BackendWorkloadSpec` (spec §4.3 step 6).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequestLimit {
    pub request: Option<Quantity>,
    pub limit: Option<Quantity>,
}
