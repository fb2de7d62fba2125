//! relay input/output mode (spec §4.8): listens on the run's socket relay
//! topology, accepts exactly one client per buffer direction, validates
//! the connection's signed token against the buffer ID and requested
//! action, then tunnels bytes to/from the buffer via C7.

use std::sync::Arc;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UnixListener};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tyger_backend::RelayBinding;
use tyger_dataplane::DataPlaneClient;
use tyger_sign::{ActionMask, ResourceType, SignatureService, ValidationOutcome};
use tyger_types::{ErrorKind, TygerError};

/// A relay binding carries a signed buffer URL in the form
/// `<scheme>://<host>/<container>?sig=<token>`; splits out the container
/// name and token so [`SignatureService::validate`] can check them.
fn parse_signed_url(url: &str) -> Result<(String, String), TygerError> {
    let (path_part, query) = url
        .split_once('?')
        .ok_or_else(|| TygerError::invalid("signed URL missing query string"))?;
    let container = path_part
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| TygerError::invalid("signed URL missing container path segment"))?
        .to_string();
    let token = query
        .split('&')
        .find_map(|kv| kv.strip_prefix("sig="))
        .ok_or_else(|| TygerError::invalid("signed URL missing sig parameter"))?
        .to_string();
    Ok((container, token))
}

/// Either transport `serve_binding` accepts a connection on.
trait AsyncReadWrite: AsyncRead + AsyncWrite + Send {}
impl<T: AsyncRead + AsyncWrite + Send> AsyncReadWrite for T {}

pub struct SocketRelay {
    client: Arc<DataPlaneClient>,
    sign: Arc<SignatureService>,
}

impl SocketRelay {
    pub fn new(client: Arc<DataPlaneClient>, sign: Arc<SignatureService>) -> Self {
        Self { client, sign }
    }

    /// Path a Unix-domain relay socket is bound at for a given binding
    /// (spec §4.8: "listens on one or more addresses (TCP or Unix-domain
    /// socket)").
    fn unix_socket_path(port: u16) -> std::path::PathBuf {
        std::path::PathBuf::from(format!("/var/run/tyger/relay-{port}.sock"))
    }

    /// Serves one `RelayBinding` on TCP `127.0.0.1:port` or a Unix-domain
    /// socket per `binding.prefer_tcp`, accepts exactly one client, and
    /// tunnels in the direction the binding names (input: buffer ->
    /// socket; output: socket -> buffer).
    pub async fn serve_binding(&self, binding: &RelayBinding, cancel: &CancellationToken) -> Result<(), TygerError> {
        let mut socket: std::pin::Pin<Box<dyn AsyncReadWrite>> = if binding.prefer_tcp {
            let listener = TcpListener::bind(("127.0.0.1", binding.port))
                .await
                .map_err(|e| TygerError::transient(format!("bind relay port {}: {e}", binding.port)))?;
            let (accepted, _) = tokio::select! {
                accepted = listener.accept() => accepted.map_err(|e| TygerError::transient(format!("accept relay connection: {e}")))?,
                _ = cancel.cancelled() => return Err(TygerError::cancelled()),
            };
            Box::pin(accepted)
        } else {
            let path = Self::unix_socket_path(binding.port);
            let _ = std::fs::remove_file(&path);
            let listener = UnixListener::bind(&path)
                .map_err(|e| TygerError::transient(format!("bind relay socket {}: {e}", path.display())))?;
            let (accepted, _) = tokio::select! {
                accepted = listener.accept() => accepted.map_err(|e| TygerError::transient(format!("accept relay connection: {e}")))?,
                _ = cancel.cancelled() => return Err(TygerError::cancelled()),
            };
            Box::pin(accepted)
        };

        if let Some(url) = &binding.input_buffer_url {
            let (container, token) = parse_signed_url(url)?;
            self.validate(&token, &container, ActionMask::read_only())?;
            info!(container, port = binding.port, "relaying buffer input to socket");
            let mut stream = self.client.read_buffer(&container, cancel).await?;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                socket
                    .write_all(&chunk)
                    .await
                    .map_err(|e| TygerError::transient(format!("write relay socket: {e}")))?;
            }
            socket
                .shutdown()
                .await
                .map_err(|e| TygerError::transient(format!("close relay socket: {e}")))?;
        }

        if let Some(url) = &binding.output_buffer_url {
            let (container, token) = parse_signed_url(url)?;
            self.validate(&token, &container, ActionMask::read_write())?;
            info!(container, port = binding.port, "relaying socket output to buffer");
            self.client.write_buffer(&container, socket, cancel).await?;
        }

        Ok(())
    }

    fn validate(&self, token: &str, container: &str, requested: ActionMask) -> Result<(), TygerError> {
        match self
            .sign
            .validate(token, container, requested, chrono::Utc::now())
        {
            ValidationOutcome::Ok => Ok(()),
            ValidationOutcome::InvalidSas => Err(TygerError::new(ErrorKind::Unauthorized, "invalid or expired relay token")),
            ValidationOutcome::ActionNotAllowed => {
                Err(TygerError::new(ErrorKind::Forbidden, "relay token does not permit this action"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_container_and_token_from_signed_url() {
        let (container, token) = parse_signed_url("https://data.tyger/buf-123?sig=abcdef&se=2026").unwrap();
        assert_eq!(container, "buf-123");
        assert_eq!(token, "abcdef");
    }

    #[test]
    fn rejects_url_without_query_string() {
        assert!(parse_signed_url("https://data.tyger/buf-123").is_err());
    }

    #[test]
    fn validate_rejects_token_signed_for_a_different_resource() {
        let sign = SignatureService::new(tyger_sign::SigningKey::generate());
        let token = sign
            .sign(ResourceType::Container, "buf-a", ActionMask::read_only(), chrono::Duration::minutes(5), chrono::Utc::now())
            .unwrap();
        let client = Arc::new(DataPlaneClient::new(
            Arc::new(tyger_dataplane::InMemoryObjectStore::default()),
            tyger_config::DataPlaneConfig::default(),
        ));
        let relay = SocketRelay::new(client, Arc::new(sign));
        let err = relay.validate(&token, "buf-b", ActionMask::read_only()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }
}
