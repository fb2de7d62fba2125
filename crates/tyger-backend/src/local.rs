//! Local variant of the Backend Adapter: runs each replica as a container
//! on the developer's own container engine (spec §4.4, §6's "single-box
//! developer mode"). One container per job replica; one container per
//! worker replica plus a "gateway" container that fans socket connections
//! out to the worker replicas, since there's no cluster Service to front
//! them with.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogsOptions, RemoveContainerOptions, StartContainerOptions,
};
use bollard::models::{ContainerStateStatusEnum, HostConfig};
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tyger_types::{BackendEvent, BackendHandle, BackendPhase, ReplicaState, TygerError};

use crate::backend::{Backend, DeleteCascade, LogStream};
use crate::workload::{BackendWorkloadSpec, ResolvedCodespec};

const NETWORK_NAME: &str = "tyger-local";

pub struct LocalBackend {
    docker: Docker,
    /// handle -> container names, so watch/delete can address every
    /// replica of a run without re-deriving names from labels (bollard's
    /// label filter API is coarser than kube's).
    containers: Mutex<HashMap<String, Vec<String>>>,
}

impl LocalBackend {
    pub fn new(docker: Docker) -> Self {
        Self {
            docker,
            containers: Mutex::new(HashMap::new()),
        }
    }

    pub fn connect_with_local_defaults() -> Result<Self, TygerError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| TygerError::transient(format!("connect to container engine: {e}")))?;
        Ok(Self::new(docker))
    }

    fn container_name(run_id: i64, role: &str, replica: u32) -> String {
        format!("tyger-run-{run_id}-{role}-{replica}")
    }

    fn container_config(target: &ResolvedCodespec, spec: &BackendWorkloadSpec) -> Config<String> {
        let mut env: Vec<String> = target
            .body
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        for (param, url) in &spec.buffer_urls {
            env.push(format!("TYGER_BUFFER_{}={url}", param.to_ascii_uppercase()));
        }
        let cmd = if target.body.command.is_empty() {
            None
        } else {
            Some(
                target
                    .body
                    .command
                    .iter()
                    .chain(target.body.args.iter())
                    .cloned()
                    .collect(),
            )
        };
        Config {
            image: Some(target.body.image.clone()),
            cmd,
            env: Some(env),
            host_config: Some(HostConfig {
                network_mode: Some(NETWORK_NAME.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn ensure_network(&self) -> Result<(), TygerError> {
        let networks = self
            .docker
            .list_networks::<String>(None)
            .await
            .map_err(|e| TygerError::transient(format!("list networks: {e}")))?;
        if networks.iter().any(|n| n.name.as_deref() == Some(NETWORK_NAME)) {
            return Ok(());
        }
        self.docker
            .create_network(bollard::network::CreateNetworkOptions {
                name: NETWORK_NAME,
                ..Default::default()
            })
            .await
            .map_err(|e| TygerError::transient(format!("create network: {e}")))?;
        Ok(())
    }

    async fn start_replica(
        &self,
        name: &str,
        target: &ResolvedCodespec,
        spec: &BackendWorkloadSpec,
    ) -> Result<(), TygerError> {
        let config = Self::container_config(target, spec);
        let existing = self.docker.inspect_container(name, None).await;
        if existing.is_ok() {
            return Ok(());
        }
        self.docker
            .create_container(Some(CreateContainerOptions { name, platform: None }), config)
            .await
            .map_err(|e| TygerError::transient(format!("create container {name}: {e}")))?;
        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| TygerError::transient(format!("start container {name}: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn submit(
        &self,
        spec: &BackendWorkloadSpec,
        _cancel: &CancellationToken,
    ) -> Result<BackendHandle, TygerError> {
        let handle = BackendHandle::for_run(spec.run_id);
        if self.containers.lock().contains_key(&handle.0) {
            return Ok(handle);
        }
        self.ensure_network().await?;

        let mut names = Vec::new();
        for replica in 0..spec.job.replicas.max(1) {
            let name = Self::container_name(spec.run_id, "job", replica);
            self.start_replica(&name, &spec.job, spec).await?;
            names.push(name);
        }
        if let Some(worker) = &spec.worker {
            for replica in 0..worker.replicas.max(1) {
                let name = Self::container_name(spec.run_id, "worker", replica);
                self.start_replica(&name, worker, spec).await?;
                names.push(name);
            }
        }
        self.containers.lock().insert(handle.0.clone(), names);
        Ok(handle)
    }

    async fn watch(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<Pin<Box<dyn futures::Stream<Item = BackendEvent> + Send>>, TygerError> {
        let snapshot: Vec<(String, Vec<String>)> = self
            .containers
            .lock()
            .iter()
            .map(|(h, names)| (h.clone(), names.clone()))
            .collect();
        let mut events = Vec::with_capacity(snapshot.len());
        for (handle, names) in snapshot {
            let mut replica_states = Vec::with_capacity(names.len());
            for name in &names {
                let inspect = self
                    .docker
                    .inspect_container(name, None)
                    .await
                    .map_err(|e| TygerError::transient(format!("inspect {name}: {e}")))?;
                let state = inspect.state.unwrap_or_default();
                let phase = match state.status {
                    Some(ContainerStateStatusEnum::EXITED) => {
                        if state.exit_code == Some(0) {
                            BackendPhase::Succeeded
                        } else {
                            BackendPhase::Failed
                        }
                    }
                    Some(ContainerStateStatusEnum::RUNNING) => BackendPhase::Running,
                    _ => BackendPhase::Pending,
                };
                replica_states.push(ReplicaState {
                    phase,
                    restart_count: state.restart_count.unwrap_or(0) as u32,
                    exit_code: state.exit_code.map(|c| c as i32),
                    reason: state.error.filter(|s| !s.is_empty()),
                });
            }
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
            events.push(BackendEvent {
                handle: BackendHandle(handle),
                phase,
                replica_states,
                terminated_at: None,
                exit_reasons: Vec::new(),
            });
        }
        Ok(Box::pin(stream::iter(events)))
    }

    async fn stream_logs(
        &self,
        handle: &BackendHandle,
        since: Option<DateTime<Utc>>,
        follow: bool,
        _cancel: &CancellationToken,
    ) -> Result<LogStream, TygerError> {
        let name = self
            .containers
            .lock()
            .get(&handle.0)
            .and_then(|names| names.first().cloned())
            .ok_or_else(|| TygerError::not_found(format!("no containers for {}", handle.0)))?;
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow,
            timestamps: true,
            since: since.map(|t| t.timestamp()).unwrap_or(0),
            ..Default::default()
        };
        let docker = Arc::new(self.docker.clone());
        let stream = docker
            .logs(&name, Some(options))
            .map(|chunk| {
                chunk
                    .map(|c| c.into_bytes())
                    .map_err(|e| TygerError::transient(format!("read logs: {e}")))
            });
        Ok(Box::pin(stream))
    }

    async fn delete(
        &self,
        handle: &BackendHandle,
        _cascade: DeleteCascade,
        _cancel: &CancellationToken,
    ) -> Result<(), TygerError> {
        let names = self
            .containers
            .lock()
            .remove(&handle.0)
            .ok_or_else(|| TygerError::not_found(format!("no containers for {}", handle.0)))?;
        for name in names {
            let result = self
                .docker
                .remove_container(
                    &name,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
            if let Err(e) = result {
                tracing::warn!(container = %name, error = %e, "remove container failed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_name_is_stable_per_replica() {
        assert_eq!(LocalBackend::container_name(5, "job", 0), "tyger-run-5-job-0");
        assert_eq!(LocalBackend::container_name(5, "worker", 2), "tyger-run-5-worker-2");
    }
}
