//! The `BackendWorkloadSpec` Run Creator (C3) emits and every Backend
//! Adapter variant (C4) consumes (spec §4.3 step 6, §4.4).

use std::collections::HashMap;

use tyger_types::{Codespec, Quantity};

/// A resolved codespec plus the concrete resources bound to it. Both the
/// job and, if present, worker target get one of these.
#[derive(Debug, Clone)]
pub struct ResolvedCodespec {
    pub name: Option<String>,
    pub version: Option<u32>,
    pub body: Codespec,
    pub replicas: u32,
    pub node_pool: Option<String>,
}

/// A single socket relay binding (spec §3, §4.8's relay topology: "listens
/// on one or more addresses (TCP or Unix-domain socket)").
#[derive(Debug, Clone)]
pub struct RelayBinding {
    pub port: u16,
    pub input_buffer_url: Option<String>,
    pub output_buffer_url: Option<String>,
    /// Listen on TCP `127.0.0.1:port` when true, a Unix-domain socket
    /// otherwise.
    pub prefer_tcp: bool,
}

/// Everything the Backend Adapter needs to schedule a run (spec §4.3 step
/// 6: "codespec(s), the URL map, a relay topology for sockets, resource
/// requests, replicas, node-pool selector, per-run secrets, timeout").
#[derive(Debug, Clone)]
pub struct BackendWorkloadSpec {
    pub run_id: i64,
    pub job: ResolvedCodespec,
    pub worker: Option<ResolvedCodespec>,
    /// Buffer parameter name -> signed access URL.
    pub buffer_urls: HashMap<String, String>,
    pub relay_topology: Vec<RelayBinding>,
    pub timeout_seconds: i64,
    /// Per-run secrets (signing keys, env) threaded to the sidecar and
    /// main containers. Opaque to the Backend Adapter beyond key names.
    pub secrets: HashMap<String, String>,
}

impl BackendWorkloadSpec {
    pub fn gpu_requested(&self) -> Option<Quantity> {
        self.job.body.resources.gpu
    }
}
