//! # tyger-types
//!
//! Core domain types shared across every Tyger control-plane component:
//! codespecs, buffers, runs, and the kind-tagged error taxonomy.
//!
//! - [`Codespec`], [`CodespecRef`], [`CodespecRecord`] — immutable,
//!   versioned container specs
//! - [`Buffer`], [`TagSet`] — append-only blob-stream metadata
//! - [`Run`], [`RunStatus`], [`RunCodeTarget`] — the run state machine
//! - [`Quantity`] — Kubernetes-style resource quantities
//! - [`ContinuationToken`] — opaque list-paging cursors
//! - [`BackendEvent`], [`ReplicaState`] — the backend observation model
//! - [`TygerError`], [`ErrorKind`] — the error taxonomy every component agrees on
//!
//! None of these types talk to storage or the network; that's the job of
//! the crates built on top of this one.

pub mod backend_event;
pub mod buffer;
pub mod codespec;
pub mod continuation;
pub mod error;
pub mod idempotency;
pub mod quantity;
pub mod run;

pub use backend_event::{BackendEvent, BackendHandle, BackendPhase, ReplicaState};
pub use buffer::{Buffer, BufferAccessPermissions, BufferState, TagSet};
pub use codespec::{
    BufferParameters, Codespec, CodespecKind, CodespecRecord, CodespecRef, Endpoints, Resources,
    Socket,
};
pub use continuation::{ContinuationToken, FilterHash};
pub use error::{ErrorKind, Result, TygerError};
pub use idempotency::IdempotencyRecord;
pub use quantity::Quantity;
pub use run::{BufferArg, ResourceRequestLimit, Run, RunCodeTarget, RunKind, RunStatus};
