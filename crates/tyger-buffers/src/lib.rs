//! Buffer Manager (spec §4.2): buffer namespace, tag indexing, signed
//! access-URL issuance, and the background soft-delete/purge sweeper.

mod deleter;
mod store;

pub use deleter::BufferDeleter;
pub use store::{BufferStore, InMemoryBufferStore};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tyger_config::BufferConfig;
use tyger_repository::Repository;
use tyger_sign::{ActionMask, ResourceType, SignatureService};
use tyger_types::{Buffer, BufferAccessPermissions, ErrorKind, TagSet, TygerError};

/// A single signed access-URL request (spec §4.2, §4.8's `preferTcp`/
/// `fromInternalNetwork`).
#[derive(Debug, Clone)]
pub struct BufferAccessRequest {
    pub id: String,
    pub writable: bool,
    /// Caller prefers a TCP endpoint over the local Unix-domain socket.
    pub prefer_tcp: bool,
    /// Caller is on the same node as the data-plane server, so a
    /// Unix-domain socket endpoint is reachable at all.
    pub from_internal_network: bool,
}

impl BufferAccessRequest {
    pub fn new(id: impl Into<String>, writable: bool) -> Self {
        Self {
            id: id.into(),
            writable,
            prefer_tcp: true,
            from_internal_network: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BufferAccessUrl {
    pub id: String,
    pub url: String,
}

pub struct BufferManager {
    repository: Arc<dyn Repository>,
    store: Arc<dyn BufferStore>,
    signer: Arc<tokio::sync::RwLock<SignatureService>>,
    config: BufferConfig,
    /// Base URL of the local data-plane server's TCP listener that signed
    /// URLs resolve against (spec §6, "Local data-plane server").
    data_plane_base_url: String,
    /// Filesystem path of the same server's Unix-domain socket listener,
    /// used when a request prefers it and is on the same node (spec §4.8).
    data_plane_socket_path: String,
}

impl BufferManager {
    pub fn new(
        repository: Arc<dyn Repository>,
        store: Arc<dyn BufferStore>,
        signer: Arc<tokio::sync::RwLock<SignatureService>>,
        config: BufferConfig,
        data_plane_base_url: impl Into<String>,
    ) -> Self {
        Self::with_socket_path(repository, store, signer, config, data_plane_base_url, "/var/run/tyger/data-plane.sock")
    }

    pub fn with_socket_path(
        repository: Arc<dyn Repository>,
        store: Arc<dyn BufferStore>,
        signer: Arc<tokio::sync::RwLock<SignatureService>>,
        config: BufferConfig,
        data_plane_base_url: impl Into<String>,
        data_plane_socket_path: impl Into<String>,
    ) -> Self {
        Self {
            repository,
            store,
            signer,
            config,
            data_plane_base_url: data_plane_base_url.into(),
            data_plane_socket_path: data_plane_socket_path.into(),
        }
    }

    pub async fn create_buffer(
        &self,
        tags: TagSet,
        cancel: &CancellationToken,
    ) -> Result<Buffer, TygerError> {
        let id = uuid::Uuid::new_v4().simple().to_string()[..12].to_string();
        let mut buffer = Buffer::new(id, "default", Utc::now());
        buffer.tags = tags;
        self.repository.create_buffer(buffer, cancel).await
    }

    /// Issues a time-bounded signed URL per request (spec §4.2). When
    /// `check_exists` is false, issuance skips the existence probe so a
    /// batch of URLs can be produced for buffers the caller already knows
    /// exist (e.g. ones it just created).
    pub async fn create_buffer_access_urls(
        &self,
        requests: &[BufferAccessRequest],
        check_exists: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<BufferAccessUrl>, TygerError> {
        if check_exists {
            let ids: Vec<String> = requests.iter().map(|r| r.id.clone()).collect();
            self.check_buffers_exist(&ids, cancel).await?;
        }

        let now = Utc::now();
        let validity = chrono::Duration::seconds(self.config.access_url_validity_secs);
        let signer = self.signer.read().await;

        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            let actions = if request.writable {
                ActionMask::read_write()
            } else {
                ActionMask::read_only()
            };
            let token = signer.sign(ResourceType::Container, &request.id, actions, validity, now)?;
            // A Unix socket is only reachable from the same node as the
            // data-plane server; an external caller always gets TCP
            // regardless of its stated preference.
            let use_unix_socket = !request.prefer_tcp && request.from_internal_network;
            let url = if use_unix_socket {
                format!("unix://{}/containers/{}?sig={}", self.data_plane_socket_path, request.id, token)
            } else {
                format!("{}/containers/{}?sig={}", self.data_plane_base_url, request.id, token)
            };
            results.push(BufferAccessUrl {
                id: request.id.clone(),
                url,
            });
        }
        Ok(results)
    }

    pub async fn check_buffers_exist(
        &self,
        ids: &[String],
        cancel: &CancellationToken,
    ) -> Result<(), TygerError> {
        for id in ids {
            self.repository.get_buffer(id, cancel).await?;
        }
        Ok(())
    }

    pub async fn soft_delete_buffer_by_id(
        &self,
        id: &str,
        if_match_etag: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<Buffer, TygerError> {
        self.repository.soft_delete_buffer(id, if_match_etag, cancel).await
    }

    pub fn permissions_for(writable: bool) -> BufferAccessPermissions {
        if writable {
            BufferAccessPermissions::read_write()
        } else {
            BufferAccessPermissions::read_only()
        }
    }

    /// One synchronous sweep pass, exposed for tests and for the
    /// background [`BufferDeleter`] loop.
    pub async fn sweep_once(&self, now: DateTime<Utc>, cancel: &CancellationToken) -> Result<(), TygerError> {
        let active_lifetime = chrono_duration(self.config.active_lifetime_secs);
        let soft_lifetime = chrono_duration(self.config.soft_lifetime_secs);

        let to_soft_delete = self
            .repository
            .get_expired_buffer_ids(false, active_lifetime, soft_lifetime, now, cancel)
            .await?;
        for id in &to_soft_delete {
            if let Err(err) = self.repository.soft_delete_buffer(id, None, cancel).await {
                tracing::warn!(buffer_id = %id, error = %err, "soft-delete failed, retrying next sweep");
            }
        }

        let to_purge = self
            .repository
            .get_expired_buffer_ids(true, active_lifetime, soft_lifetime, now, cancel)
            .await?;
        if !to_purge.is_empty() {
            if let Err(err) = self.store.delete_buffers(&to_purge).await {
                tracing::warn!(error = %err, "object-store delete failed, retrying next sweep");
                return Ok(());
            }
            if let Err(err) = self.repository.hard_delete_buffers(&to_purge, cancel).await {
                tracing::warn!(error = %err, "repository hard-delete failed, retrying next sweep");
            } else {
                info!(count = to_purge.len(), "buffers purged");
            }
        }
        Ok(())
    }
}

fn chrono_duration(secs: i64) -> chrono::Duration {
    chrono::Duration::seconds(secs.max(0))
}

pub(crate) fn unauthorized_overwrite(blob: &str) -> TygerError {
    TygerError::new(
        ErrorKind::Forbidden,
        format!("blob `{blob}` already exists in this buffer (UnauthorizedBlobOverwrite)"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tyger_repository::InMemoryRepository;
    use tyger_sign::SigningKey;

    fn manager() -> BufferManager {
        let repo = Arc::new(InMemoryRepository::new());
        let store = Arc::new(InMemoryBufferStore::default());
        let signer = Arc::new(tokio::sync::RwLock::new(SignatureService::new(
            SigningKey::from_bytes(b"test-key".to_vec()),
        )));
        BufferManager::new(repo, store, signer, BufferConfig::default(), "http://localhost:8080")
    }

    #[tokio::test]
    async fn create_and_access_url_round_trip() {
        let mgr = manager();
        let cancel = CancellationToken::new();
        let buffer = mgr.create_buffer(TagSet::new(), &cancel).await.unwrap();

        let urls = mgr
            .create_buffer_access_urls(
                &[BufferAccessRequest::new(buffer.id.clone(), true)],
                true,
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(urls.len(), 1);
        assert!(urls[0].url.contains(&buffer.id));
    }

    #[tokio::test]
    async fn prefers_unix_socket_only_from_internal_network() {
        let mgr = manager();
        let cancel = CancellationToken::new();
        let buffer = mgr.create_buffer(TagSet::new(), &cancel).await.unwrap();

        let mut request = BufferAccessRequest::new(buffer.id.clone(), true);
        request.prefer_tcp = false;
        request.from_internal_network = true;
        let urls = mgr.create_buffer_access_urls(&[request], true, &cancel).await.unwrap();
        assert!(urls[0].url.starts_with("unix://"), "internal caller not preferring TCP should get a socket URL: {}", urls[0].url);

        let mut external_request = BufferAccessRequest::new(buffer.id.clone(), true);
        external_request.prefer_tcp = false;
        external_request.from_internal_network = false;
        let urls = mgr.create_buffer_access_urls(&[external_request], true, &cancel).await.unwrap();
        assert!(urls[0].url.starts_with("http://"), "an external caller can't reach a local socket, so it still gets TCP: {}", urls[0].url);
    }

    #[tokio::test]
    async fn access_url_for_missing_buffer_fails_when_checked() {
        let mgr = manager();
        let cancel = CancellationToken::new();
        let result = mgr
            .create_buffer_access_urls(
                &[BufferAccessRequest::new("nope", false)],
                true,
                &cancel,
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn sweep_soft_deletes_then_purges() {
        let mgr = manager();
        let cancel = CancellationToken::new();
        let buffer = mgr.create_buffer(TagSet::new(), &cancel).await.unwrap();

        let future = Utc::now() + chrono::Duration::days(2);
        mgr.sweep_once(future, &cancel).await.unwrap();
        let after_soft = mgr.check_buffers_exist(&[buffer.id.clone()], &cancel).await;
        assert!(after_soft.is_ok());

        let far_future = Utc::now() + chrono::Duration::days(30);
        mgr.sweep_once(far_future, &cancel).await.unwrap();
    }
}
