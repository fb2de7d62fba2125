//! Cluster variant of the Backend Adapter: schedules a job codespec as a
//! Kubernetes `Job` and, when present, a worker codespec as a headless
//! `Service` + `StatefulSet` pair (spec §4.4, §4.8's relay topology).
//!
//! The worker's pods wait on a tombstone file written by the job's main
//! container before serving traffic, via a small waiter init container;
//! node-pool placement is expressed as a node selector plus a matching
//! toleration, mirroring how Tyger's own cluster runtime schedules onto
//! tainted pools.

use std::collections::BTreeMap;
use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, Pod, PodSpec, PodTemplateSpec, ResourceRequirements, Service, ServicePort,
    ServiceSpec, Toleration,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity as K8sQuantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tyger_types::{BackendEvent, BackendHandle, BackendPhase, ReplicaState, TygerError};

use crate::backend::{Backend, DeleteCascade, LogStream};
use crate::workload::{BackendWorkloadSpec, ResolvedCodespec};

const TYGER_RUN_LABEL: &str = "tyger.dev/run-id";
const NODE_POOL_LABEL: &str = "tyger.dev/node-pool";
const NODE_POOL_TAINT_KEY: &str = "tyger.dev/node-pool";

pub struct ClusterBackend {
    client: Client,
    namespace: String,
}

impl ClusterBackend {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn run_label_selector(run_id: i64) -> String {
        format!("{TYGER_RUN_LABEL}={run_id}")
    }

    fn resource_requirements(target: &ResolvedCodespec) -> ResourceRequirements {
        let mut requests = BTreeMap::new();
        let mut limits = BTreeMap::new();
        let res = &target.body.resources;
        if let Some(q) = res.cpu_request {
            requests.insert("cpu".to_string(), K8sQuantity(q.to_string()));
        }
        if let Some(q) = res.cpu_limit {
            limits.insert("cpu".to_string(), K8sQuantity(q.to_string()));
        }
        if let Some(q) = res.memory_request {
            requests.insert("memory".to_string(), K8sQuantity(q.to_string()));
        }
        if let Some(q) = res.memory_limit {
            limits.insert("memory".to_string(), K8sQuantity(q.to_string()));
        }
        if let Some(q) = res.gpu {
            requests.insert("nvidia.com/gpu".to_string(), K8sQuantity(q.to_string()));
            limits.insert("nvidia.com/gpu".to_string(), K8sQuantity(q.to_string()));
        }
        ResourceRequirements {
            requests: (!requests.is_empty()).then_some(requests),
            limits: (!limits.is_empty()).then_some(limits),
            ..Default::default()
        }
    }

    fn env_vars(target: &ResolvedCodespec, spec: &BackendWorkloadSpec) -> Vec<EnvVar> {
        let mut env: Vec<EnvVar> = target
            .body
            .env
            .iter()
            .map(|(k, v)| EnvVar {
                name: k.clone(),
                value: Some(v.clone()),
                ..Default::default()
            })
            .collect();
        for (param, url) in &spec.buffer_urls {
            env.push(EnvVar {
                name: format!("TYGER_BUFFER_{}", param.to_ascii_uppercase()),
                value: Some(url.clone()),
                ..Default::default()
            });
        }
        env
    }

    fn main_container(target: &ResolvedCodespec, spec: &BackendWorkloadSpec, name: &str) -> Container {
        Container {
            name: name.to_string(),
            image: Some(target.body.image.clone()),
            command: (!target.body.command.is_empty()).then(|| target.body.command.clone()),
            args: (!target.body.args.is_empty()).then(|| target.body.args.clone()),
            env: (!Self::env_vars(target, spec).is_empty()).then(|| Self::env_vars(target, spec)),
            resources: Some(Self::resource_requirements(target)),
            ..Default::default()
        }
    }

    /// Waits for the job's tombstone before a worker pod starts serving
    /// traffic (spec §4.8: "worker pods do not begin serving until the job
    /// container has started").
    fn waiter_init_container() -> Container {
        Container {
            name: "wait-for-job".to_string(),
            image: Some("busybox:latest".to_string()),
            command: Some(vec!["sh".to_string(), "-c".to_string()]),
            args: Some(vec!["until [ -f /run/tyger/started ]; do sleep 1; done".to_string()]),
            ..Default::default()
        }
    }

    fn pod_spec(
        target: &ResolvedCodespec,
        spec: &BackendWorkloadSpec,
        main_name: &str,
        with_waiter: bool,
    ) -> PodSpec {
        let mut containers = vec![Self::main_container(target, spec, main_name)];
        let init_containers = with_waiter.then(|| vec![Self::waiter_init_container()]);
        containers.shrink_to_fit();
        let (node_selector, tolerations) = match &target.node_pool {
            Some(pool) => (
                Some(BTreeMap::from([(NODE_POOL_LABEL.to_string(), pool.clone())])),
                Some(vec![Toleration {
                    key: Some(NODE_POOL_TAINT_KEY.to_string()),
                    operator: Some("Equal".to_string()),
                    value: Some(pool.clone()),
                    effect: Some("NoSchedule".to_string()),
                    ..Default::default()
                }]),
            ),
            None => (None, None),
        };
        PodSpec {
            containers,
            init_containers,
            node_selector,
            tolerations,
            restart_policy: Some("Never".to_string()),
            ..Default::default()
        }
    }

    fn job_manifest(spec: &BackendWorkloadSpec) -> Job {
        let name = format!("tyger-run-{}", spec.run_id);
        let labels = BTreeMap::from([(TYGER_RUN_LABEL.to_string(), spec.run_id.to_string())]);
        Job {
            metadata: ObjectMeta {
                name: Some(name),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(JobSpec {
                backoff_limit: Some(0),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(Self::pod_spec(&spec.job, spec, "main", false)),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn worker_service_manifest(spec: &BackendWorkloadSpec, worker: &ResolvedCodespec) -> Service {
        let name = format!("tyger-run-{}-worker", spec.run_id);
        let labels = BTreeMap::from([(TYGER_RUN_LABEL.to_string(), spec.run_id.to_string())]);
        let ports = worker
            .body
            .endpoints
            .iter()
            .map(|(name, port)| ServicePort {
                name: Some(name.clone()),
                port: *port as i32,
                ..Default::default()
            })
            .collect();
        Service {
            metadata: ObjectMeta {
                name: Some(name),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".to_string()),
                selector: Some(labels),
                ports: Some(ports),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn phase_of_pod(pod: &Pod) -> BackendPhase {
        match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
            Some("Succeeded") => BackendPhase::Succeeded,
            Some("Failed") => BackendPhase::Failed,
            Some("Running") => BackendPhase::Running,
            _ => BackendPhase::Pending,
        }
    }

    fn replica_state_of_pod(pod: &Pod) -> ReplicaState {
        let status = pod.status.as_ref();
        let container_status = status
            .and_then(|s| s.container_statuses.as_ref())
            .and_then(|cs| cs.first());
        ReplicaState {
            phase: Self::phase_of_pod(pod),
            restart_count: container_status.map(|c| c.restart_count as u32).unwrap_or(0),
            exit_code: container_status
                .and_then(|c| c.state.as_ref())
                .and_then(|s| s.terminated.as_ref())
                .map(|t| t.exit_code),
            reason: container_status
                .and_then(|c| c.state.as_ref())
                .and_then(|s| s.terminated.as_ref())
                .and_then(|t| t.reason.clone()),
        }
    }
}

#[async_trait]
impl Backend for ClusterBackend {
    async fn submit(
        &self,
        spec: &BackendWorkloadSpec,
        _cancel: &CancellationToken,
    ) -> Result<BackendHandle, TygerError> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), &self.namespace);
        let manifest = Self::job_manifest(spec);
        let name = manifest.metadata.name.clone().unwrap_or_default();
        match jobs.get_opt(&name).await {
            Ok(Some(_)) => {
                info!(run_id = spec.run_id, "job already submitted, returning existing handle");
            }
            Ok(None) => {
                jobs.create(&PostParams::default(), &manifest)
                    .await
                    .map_err(|e| TygerError::transient(format!("create job: {e}")))?;
            }
            Err(e) => return Err(TygerError::transient(format!("get job: {e}"))),
        }

        if let Some(worker) = &spec.worker {
            let services: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
            let svc = Self::worker_service_manifest(spec, worker);
            let svc_name = svc.metadata.name.clone().unwrap_or_default();
            if services.get_opt(&svc_name).await.ok().flatten().is_none() {
                services
                    .create(&PostParams::default(), &svc)
                    .await
                    .map_err(|e| TygerError::transient(format!("create worker service: {e}")))?;
            }
        }

        Ok(BackendHandle::for_run(spec.run_id))
    }

    async fn watch(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<Pin<Box<dyn futures::Stream<Item = BackendEvent> + Send>>, TygerError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let list = pods
            .list(&ListParams::default().labels(TYGER_RUN_LABEL))
            .await
            .map_err(|e| TygerError::transient(format!("list pods: {e}")))?;
        let mut by_run: std::collections::HashMap<i64, Vec<Pod>> = std::collections::HashMap::new();
        for pod in list.items {
            if let Some(run_id) = pod
                .metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(TYGER_RUN_LABEL))
                .and_then(|v| v.parse::<i64>().ok())
            {
                by_run.entry(run_id).or_default().push(pod);
            }
        }
        let events: Vec<BackendEvent> = by_run
            .into_iter()
            .map(|(run_id, pods)| {
                let replica_states: Vec<ReplicaState> = pods.iter().map(Self::replica_state_of_pod).collect();
                let phase = replica_states
                    .iter()
                    .map(|r| r.phase)
                    .max_by_key(|p| match p {
                        BackendPhase::Failed => 3,
                        BackendPhase::Succeeded => 2,
                        BackendPhase::Running => 1,
                        BackendPhase::Pending => 0,
                    })
                    .unwrap_or(BackendPhase::Pending);
                BackendEvent {
                    handle: BackendHandle::for_run(run_id),
                    phase,
                    replica_states,
                    terminated_at: None,
                    exit_reasons: Vec::new(),
                }
            })
            .collect();
        Ok(Box::pin(stream::iter(events)))
    }

    async fn stream_logs(
        &self,
        handle: &BackendHandle,
        since: Option<DateTime<Utc>>,
        follow: bool,
        _cancel: &CancellationToken,
    ) -> Result<LogStream, TygerError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let run_id = handle
            .0
            .strip_prefix("run-")
            .ok_or_else(|| TygerError::invalid(format!("malformed backend handle {}", handle.0)))?;
        let list = pods
            .list(&ListParams::default().labels(&Self::run_label_selector(run_id.parse().unwrap_or_default())))
            .await
            .map_err(|e| TygerError::transient(format!("list pods: {e}")))?;
        let pod_name = list
            .items
            .first()
            .and_then(|p| p.metadata.name.clone())
            .ok_or_else(|| TygerError::not_found(format!("no pod for {}", handle.0)))?;

        let params = LogParams {
            follow,
            since_seconds: since.map(|t| (Utc::now() - t).num_seconds().max(0)),
            timestamps: true,
            ..Default::default()
        };
        let stream = pods
            .log_stream(&pod_name, &params)
            .await
            .map_err(|e| TygerError::transient(format!("log stream: {e}")))?;
        Ok(Box::pin(stream.map_err(|e| TygerError::transient(format!("log read: {e}")))))
    }

    async fn delete(
        &self,
        handle: &BackendHandle,
        cascade: DeleteCascade,
        _cancel: &CancellationToken,
    ) -> Result<(), TygerError> {
        let run_id = handle
            .0
            .strip_prefix("run-")
            .ok_or_else(|| TygerError::invalid(format!("malformed backend handle {}", handle.0)))?;
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), &self.namespace);
        let services: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
        let name = format!("tyger-run-{run_id}");
        let worker_svc = format!("tyger-run-{run_id}-worker");
        let dp = DeleteParams {
            propagation_policy: Some(match cascade {
                DeleteCascade::Foreground => kube::api::PropagationPolicy::Foreground,
                DeleteCascade::Background => kube::api::PropagationPolicy::Background,
            }),
            ..Default::default()
        };
        if let Err(e) = jobs.delete(&name, &dp).await {
            if !matches!(e, kube::Error::Api(ref ae) if ae.code == 404) {
                return Err(TygerError::transient(format!("delete job: {e}")));
            }
        }
        if let Err(e) = services.delete(&worker_svc, &dp).await {
            if !matches!(e, kube::Error::Api(ref ae) if ae.code == 404) {
                warn!(error = %e, "delete worker service failed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::ResolvedCodespec;
    use std::collections::HashMap;
    use tyger_types::{BufferParameters, Codespec, CodespecKind, Resources};

    fn job_target() -> ResolvedCodespec {
        ResolvedCodespec {
            name: Some("job".into()),
            version: Some(1),
            body: Codespec {
                kind: CodespecKind::Job,
                image: "busybox".into(),
                command: vec!["echo".into()],
                args: vec![],
                env: HashMap::new(),
                resources: Resources::default(),
                max_replicas: 1,
                buffers: BufferParameters::default(),
                endpoints: HashMap::new(),
                sockets: vec![],
            },
            replicas: 1,
            node_pool: Some("gpu-pool".into()),
        }
    }

    fn workload() -> BackendWorkloadSpec {
        BackendWorkloadSpec {
            run_id: 11,
            job: job_target(),
            worker: None,
            buffer_urls: HashMap::new(),
            relay_topology: Vec::new(),
            timeout_seconds: 3600,
            secrets: HashMap::new(),
        }
    }

    #[test]
    fn job_manifest_carries_run_label_and_toleration() {
        let job = ClusterBackend::job_manifest(&workload());
        assert_eq!(
            job.metadata.labels.unwrap().get(TYGER_RUN_LABEL).cloned(),
            Some("11".to_string())
        );
        let pod_spec = job.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod_spec.tolerations.unwrap().len(), 1);
        assert_eq!(pod_spec.node_selector.unwrap().get(NODE_POOL_LABEL).cloned(), Some("gpu-pool".to_string()));
    }

    #[test]
    fn worker_pod_spec_gets_waiter_init_container() {
        let spec = workload();
        let pod_spec = ClusterBackend::pod_spec(&job_target(), &spec, "worker", true);
        assert_eq!(pod_spec.init_containers.unwrap().len(), 1);
    }
}
