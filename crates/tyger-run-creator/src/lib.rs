//! Run Creator (C3, spec §4.3): validates a submitted run, materializes
//! implicit buffers, resolves codespec refs, and hands the Backend Adapter
//! a [`BackendWorkloadSpec`].
//!
//! Validation happens before any buffer is created, except for
//! implicit-buffer allocation, which happens after parameter validation —
//! a failure after that point leaks the newly created buffer, reclaimed
//! later by the buffer deleter's TTL sweep (spec §4.3's stated tie-break).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tyger_backend::{BackendWorkloadSpec, RelayBinding, ResolvedCodespec};
use tyger_buffers::{BufferAccessRequest, BufferManager};
use tyger_repository::Repository;
use tyger_types::{
    BufferArg, Codespec, CodespecRef, ErrorKind, Run, RunCodeTarget, RunKind, RunStatus, TagSet,
    TygerError,
};

const DEFAULT_TIMEOUT_SECONDS: i64 = 12 * 3600;

pub struct SubmittedRunRequest {
    pub job: RunCodeTarget,
    pub worker: Option<RunCodeTarget>,
    pub timeout_seconds: Option<i64>,
    pub tags: HashMap<String, String>,
    pub cluster: Option<String>,
    pub idempotency_key: Option<String>,
}

pub struct RunCreator {
    repository: Arc<dyn Repository>,
    buffers: Arc<BufferManager>,
    idempotency_ttl: chrono::Duration,
}

impl RunCreator {
    pub fn new(
        repository: Arc<dyn Repository>,
        buffers: Arc<BufferManager>,
        idempotency_ttl: chrono::Duration,
    ) -> Self {
        Self {
            repository,
            buffers,
            idempotency_ttl,
        }
    }

    /// Runs the full submission pipeline and returns the persisted row plus
    /// the spec the Backend Adapter should submit.
    pub async fn create_run(
        &self,
        request: SubmittedRunRequest,
        cancel: &CancellationToken,
    ) -> Result<(Run, BackendWorkloadSpec), TygerError> {
        let job_codespec = self.resolve_codespec(&request.job.codespec_ref, cancel).await?;
        job_codespec.validate()?;

        let worker_codespec = match &request.worker {
            Some(target) => {
                let body = self.resolve_codespec(&target.codespec_ref, cancel).await?;
                body.validate()?;
                Some(body)
            }
            None => None,
        };

        let run_tags = TagSet::from_iter(request.tags.clone());
        let (resolved_buffers, buffer_urls) = self
            .materialize_buffers(&job_codespec, &request.job.buffers, &run_tags, cancel)
            .await?;

        let relay_topology = worker_codespec
            .as_ref()
            .map(|w| self.relay_topology(w, &buffer_urls))
            .unwrap_or_default();

        let now = Utc::now();
        let timeout_seconds = request.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECONDS);
        let run = Run {
            id: 0,
            kind: RunKind::User,
            job: request.job.clone(),
            worker: request.worker.clone(),
            buffers: resolved_buffers,
            cluster: request.cluster.clone(),
            timeout_seconds,
            status: RunStatus::Pending,
            status_reason: None,
            running_count: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            modified_at: None,
            logs_archived_at: None,
            tags: request.tags.clone(),
            tags_version: 0,
        };

        let persisted = match &request.idempotency_key {
            Some(key) => {
                self.repository
                    .create_run_with_idempotency_key_guard(key, self.idempotency_ttl, run, cancel)
                    .await?
            }
            None => self.repository.create_run(run, cancel).await?,
        };

        let workload_spec = BackendWorkloadSpec {
            run_id: persisted.id,
            job: ResolvedCodespec {
                name: named_ref(&request.job.codespec_ref),
                version: versioned_ref(&request.job.codespec_ref),
                body: job_codespec,
                replicas: request.job.replicas,
                node_pool: request.job.node_pool.clone(),
            },
            worker: worker_codespec.map(|body| ResolvedCodespec {
                name: request.worker.as_ref().and_then(|w| named_ref(&w.codespec_ref)),
                version: request.worker.as_ref().and_then(|w| versioned_ref(&w.codespec_ref)),
                body,
                replicas: request.worker.as_ref().map(|w| w.replicas).unwrap_or(1),
                node_pool: request.worker.as_ref().and_then(|w| w.node_pool.clone()),
            }),
            buffer_urls,
            relay_topology,
            timeout_seconds,
            secrets: HashMap::new(),
        };

        Ok((persisted, workload_spec))
    }

    async fn resolve_codespec(
        &self,
        codespec_ref: &CodespecRef,
        cancel: &CancellationToken,
    ) -> Result<Codespec, TygerError> {
        match codespec_ref {
            CodespecRef::Inline { body } => Ok(body.clone()),
            CodespecRef::Named { name, version: None } => {
                Ok(self.repository.get_latest_codespec(name, cancel).await?.body)
            }
            CodespecRef::Named {
                name,
                version: Some(version),
            } => Ok(self
                .repository
                .get_codespec_at_version(name, *version, cancel)
                .await?
                .body),
        }
    }

    /// Implements spec §4.3 step 3's three argument shapes per declared
    /// buffer parameter, plus rejection of arguments that don't match any
    /// declared parameter. Returns the resolved parameter->buffer-id map and
    /// the buffer->URL map (write=true for outputs, false for inputs).
    async fn materialize_buffers(
        &self,
        job_codespec: &Codespec,
        args: &HashMap<String, BufferArg>,
        run_tags: &TagSet,
        cancel: &CancellationToken,
    ) -> Result<(HashMap<String, String>, HashMap<String, String>), TygerError> {
        for param in args.keys() {
            if !job_codespec.buffers.contains(param) {
                return Err(TygerError::invalid(format!(
                    "buffer argument `{param}` does not match any declared parameter"
                )));
            }
        }

        let mut resolved = HashMap::new();
        let mut access_requests = Vec::new();

        for (param, writable) in job_codespec.buffers.all() {
            let buffer_id = match args.get(param) {
                None => {
                    let mut tags = run_tags.clone();
                    tags.insert("bufferName", param);
                    let buffer = self.buffers.create_buffer(tags, cancel).await?;
                    buffer.id
                }
                Some(BufferArg::Ephemeral) => format!("temp-{}", uuid::Uuid::new_v4().simple()),
                Some(BufferArg::Id(id)) => {
                    self.buffers.check_buffers_exist(std::slice::from_ref(id), cancel).await?;
                    id.clone()
                }
            };
            resolved.insert(param.to_string(), buffer_id.clone());
            if !buffer_id.starts_with("temp-") {
                access_requests.push(BufferAccessRequest::new(buffer_id.clone(), writable));
            }
        }

        let mut urls = HashMap::new();
        if !access_requests.is_empty() {
            let issued = self
                .buffers
                .create_buffer_access_urls(&access_requests, false, cancel)
                .await?;
            let by_id: HashMap<_, _> = issued.into_iter().map(|u| (u.id, u.url)).collect();
            for (param, id) in &resolved {
                if let Some(url) = by_id.get(id) {
                    urls.insert(param.clone(), url.clone());
                }
            }
        }

        Ok((resolved, urls))
    }

    fn relay_topology(
        &self,
        worker: &Codespec,
        buffer_urls: &HashMap<String, String>,
    ) -> Vec<RelayBinding> {
        worker
            .sockets
            .iter()
            .map(|socket| RelayBinding {
                port: socket.port,
                input_buffer_url: socket
                    .input_buffer
                    .as_ref()
                    .and_then(|name| buffer_urls.get(name).cloned()),
                output_buffer_url: socket
                    .output_buffer
                    .as_ref()
                    .and_then(|name| buffer_urls.get(name).cloned()),
                prefer_tcp: true,
            })
            .collect()
    }
}

fn named_ref(codespec_ref: &CodespecRef) -> Option<String> {
    match codespec_ref {
        CodespecRef::Named { name, .. } => Some(name.clone()),
        CodespecRef::Inline { .. } => None,
    }
}

fn versioned_ref(codespec_ref: &CodespecRef) -> Option<u32> {
    match codespec_ref {
        CodespecRef::Named { version, .. } => *version,
        CodespecRef::Inline { .. } => None,
    }
}

/// Rejects a `kind = system` submission before any other work happens
/// (spec §4.3 step 1). System runs are created internally by the
/// reconciler/sidecar, never accepted from a client submission.
pub fn reject_system_kind(kind: RunKind) -> Result<(), TygerError> {
    if kind == RunKind::System {
        return Err(TygerError::new(
            ErrorKind::Invalid,
            "system runs cannot be submitted directly",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tyger_buffers::InMemoryBufferStore;
    use tyger_config::BufferConfig;
    use tyger_repository::InMemoryRepository;
    use tyger_sign::{SignatureService, SigningKey};
    use tyger_types::{BufferParameters, CodespecKind, Resources};

    fn creator() -> (RunCreator, Arc<InMemoryRepository>) {
        let repo = Arc::new(InMemoryRepository::new());
        let store = Arc::new(InMemoryBufferStore::default());
        let signer = Arc::new(tokio::sync::RwLock::new(SignatureService::new(
            SigningKey::from_bytes(b"test-key".to_vec()),
        )));
        let buffers = Arc::new(BufferManager::new(
            repo.clone(),
            store,
            signer,
            BufferConfig::default(),
            "http://localhost:8080",
        ));
        (
            RunCreator::new(repo.clone(), buffers, chrono::Duration::hours(24)),
            repo,
        )
    }

    fn job_codespec(inputs: &[&str], outputs: &[&str]) -> Codespec {
        Codespec {
            kind: CodespecKind::Job,
            image: "busybox".into(),
            command: vec!["echo".into()],
            args: vec![],
            env: HashMap::new(),
            resources: Resources::default(),
            max_replicas: 1,
            buffers: BufferParameters {
                inputs: inputs.iter().map(|s| s.to_string()).collect(),
                outputs: outputs.iter().map(|s| s.to_string()).collect(),
            },
            endpoints: HashMap::new(),
            sockets: vec![],
        }
    }

    fn job_target(codespec_ref: CodespecRef, args: HashMap<String, BufferArg>) -> RunCodeTarget {
        RunCodeTarget {
            codespec_ref,
            buffers: args,
            node_pool: None,
            replicas: 1,
        }
    }

    #[tokio::test]
    async fn rejects_unmatched_buffer_argument() {
        let (creator, _repo) = creator();
        let cancel = CancellationToken::new();
        let mut args = HashMap::new();
        args.insert("bogus".to_string(), BufferArg::Ephemeral);
        let request = SubmittedRunRequest {
            job: job_target(
                CodespecRef::Inline {
                    body: job_codespec(&["in"], &["out"]),
                },
                args,
            ),
            worker: None,
            timeout_seconds: None,
            tags: HashMap::new(),
            cluster: None,
            idempotency_key: None,
        };
        let result = creator.create_run(request, &cancel).await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Invalid);
    }

    #[tokio::test]
    async fn ephemeral_buffer_is_not_persisted() {
        let (creator, repo) = creator();
        let cancel = CancellationToken::new();
        let mut args = HashMap::new();
        args.insert("in".to_string(), BufferArg::Ephemeral);
        let request = SubmittedRunRequest {
            job: job_target(
                CodespecRef::Inline {
                    body: job_codespec(&["in"], &[]),
                },
                args,
            ),
            worker: None,
            timeout_seconds: None,
            tags: HashMap::new(),
            cluster: None,
            idempotency_key: None,
        };
        let (run, spec) = creator.create_run(request, &cancel).await.unwrap();
        let buffer_id = run.buffers.get("in").unwrap();
        assert!(buffer_id.starts_with("temp-"));
        assert!(!spec.buffer_urls.contains_key("in"));
        assert!(repo.get_buffer(buffer_id, &cancel).await.is_err());
    }

    #[tokio::test]
    async fn missing_argument_creates_tagged_buffer() {
        let (creator, repo) = creator();
        let cancel = CancellationToken::new();
        let request = SubmittedRunRequest {
            job: job_target(
                CodespecRef::Inline {
                    body: job_codespec(&[], &["out"]),
                },
                HashMap::new(),
            ),
            worker: None,
            timeout_seconds: None,
            tags: HashMap::new(),
            cluster: None,
            idempotency_key: None,
        };
        let (run, spec) = creator.create_run(request, &cancel).await.unwrap();
        let buffer_id = run.buffers.get("out").unwrap();
        let buffer = repo.get_buffer(buffer_id, &cancel).await.unwrap();
        assert_eq!(buffer.tags.get("bufferName"), Some("out"));
        assert!(spec.buffer_urls.contains_key("out"));
    }

    #[tokio::test]
    async fn idempotency_key_returns_same_run() {
        let (creator, _repo) = creator();
        let cancel = CancellationToken::new();
        let make_request = || SubmittedRunRequest {
            job: job_target(
                CodespecRef::Inline {
                    body: job_codespec(&[], &[]),
                },
                HashMap::new(),
            ),
            worker: None,
            timeout_seconds: None,
            tags: HashMap::new(),
            cluster: None,
            idempotency_key: Some("key-1".to_string()),
        };
        let (run1, _) = creator.create_run(make_request(), &cancel).await.unwrap();
        let (run2, _) = creator.create_run(make_request(), &cancel).await.unwrap();
        assert_eq!(run1.id, run2.id);
    }

    #[test]
    fn rejects_system_kind() {
        assert!(reject_system_kind(RunKind::System).is_err());
        assert!(reject_system_kind(RunKind::User).is_ok());
    }
}
