//! Backend observation model (SPEC_FULL.md §B.3): the richer event shape
//! the reconciler (spec §4.5) needs beyond the flattened `status`/
//! `runningCount` on [`crate::run::Run`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque handle returned by `Backend::submit`, threaded through `watch`,
/// `stream_logs`, and `delete` (spec §4.4).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendHandle(pub String);

impl BackendHandle {
    pub fn for_run(run_id: i64) -> Self {
        Self(format!("run-{run_id}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// Per-replica state, folded by the reconciler into the run's
/// `runningCount` and eventual terminal status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaState {
    pub phase: BackendPhase,
    pub restart_count: u32,
    pub exit_code: Option<i32>,
    pub reason: Option<String>,
}

/// One observation emitted by `Backend::watch` (spec §4.4).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendEvent {
    pub handle: BackendHandle,
    pub phase: BackendPhase,
    pub replica_states: Vec<ReplicaState>,
    pub terminated_at: Option<DateTime<Utc>>,
    pub exit_reasons: Vec<String>,
}

impl BackendEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, BackendPhase::Succeeded | BackendPhase::Failed)
    }

    /// Any replica failed and there's no retry budget left, per spec
    /// §4.4's "any replica failed & retries exhausted" transition.
    pub fn any_replica_failed(&self) -> bool {
        self.replica_states
            .iter()
            .any(|r| r.phase == BackendPhase::Failed)
    }

    pub fn all_replicas_succeeded(&self) -> bool {
        !self.replica_states.is_empty()
            && self
                .replica_states
                .iter()
                .all(|r| r.phase == BackendPhase::Succeeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica(phase: BackendPhase) -> ReplicaState {
        ReplicaState {
            phase,
            restart_count: 0,
            exit_code: None,
            reason: None,
        }
    }

    #[test]
    fn all_succeeded_requires_nonempty() {
        let event = BackendEvent {
            handle: BackendHandle::for_run(1),
            phase: BackendPhase::Running,
            replica_states: vec![],
            terminated_at: None,
            exit_reasons: vec![],
        };
        assert!(!event.all_replicas_succeeded());
    }

    #[test]
    fn detects_any_failed() {
        let event = BackendEvent {
            handle: BackendHandle::for_run(1),
            phase: BackendPhase::Running,
            replica_states: vec![replica(BackendPhase::Succeeded), replica(BackendPhase::Failed)],
            terminated_at: None,
            exit_reasons: vec!["oomkilled".into()],
        };
        assert!(event.any_replica_failed());
        assert!(!event.all_replicas_succeeded());
    }
}
