//! Backend Adapter (C4, spec §4.4): translates a [`BackendWorkloadSpec`]
//! into a concrete scheduler primitive and folds its status back into a
//! uniform [`tyger_types::BackendEvent`] stream, behind one capability set:
//!
//! - [`Backend::submit`] — idempotent per run.
//! - [`Backend::watch`] — a live stream of every observed state change.
//! - [`Backend::stream_logs`] — live or historical log bytes.
//! - [`Backend::delete`] — foreground or background cascade teardown.
//!
//! Two variants implement it: [`cluster::ClusterBackend`] (Kubernetes, via
//! `kube`) and [`local::LocalBackend`] (a local container engine, via
//! `bollard`). [`stub::StubBackend`] is a third, in-memory variant used by
//! tests that need a full submit -> watch -> delete loop without either.

pub mod backend;
pub mod cluster;
pub mod local;
pub mod stub;
pub mod workload;

pub use backend::{Backend, DeleteCascade, LogStream};
pub use stub::StubBackend;
pub use workload::{BackendWorkloadSpec, RelayBinding, ResolvedCodespec};
