//! socket-adapt mode (spec §4.8): dials a TCP destination with a bounded
//! connection timeout, retrying at a fixed interval, then bidirectionally
//! copies bytes to/from a pair of files until either side's EOF, at which
//! point that half is closed cleanly.

use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tyger_types::TygerError;

const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const DIAL_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Dials `addr`, retrying every second until `DEFAULT_DIAL_TIMEOUT`
/// elapses or `cancel` fires.
pub async fn dial_with_retry(addr: &str, cancel: &CancellationToken) -> Result<TcpStream, TygerError> {
    dial_with_retry_timeout(addr, DEFAULT_DIAL_TIMEOUT, DIAL_RETRY_INTERVAL, cancel).await
}

async fn dial_with_retry_timeout(
    addr: &str,
    timeout: Duration,
    retry_interval: Duration,
    cancel: &CancellationToken,
) -> Result<TcpStream, TygerError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                if tokio::time::Instant::now() >= deadline {
                    return Err(TygerError::transient(format!("dial {addr} timed out: {err}")));
                }
                tokio::select! {
                    _ = cancel.cancelled() => return Err(TygerError::cancelled()),
                    _ = tokio::time::sleep(retry_interval) => {}
                }
            }
        }
    }
}

/// Bidirectionally copies `socket` <-> the pair of files at `read_from`
/// (socket reads this file's contents to forward outbound) and
/// `write_to` (inbound bytes from the socket are written here). Either
/// side's EOF triggers a clean half-close rather than tearing down the
/// whole connection.
pub async fn adapt(
    mut socket: TcpStream,
    read_from: &Path,
    write_to: &Path,
    cancel: &CancellationToken,
) -> Result<(), TygerError> {
    let mut outbound_file = tokio::fs::File::open(read_from)
        .await
        .map_err(|e| TygerError::transient(format!("open {}: {e}", read_from.display())))?;
    let mut inbound_file = tokio::fs::File::create(write_to)
        .await
        .map_err(|e| TygerError::transient(format!("open {}: {e}", write_to.display())))?;

    let (mut socket_read, mut socket_write) = socket.split();
    let outbound = copy_then_close(&mut outbound_file, &mut socket_write);
    let inbound = copy_then_close(&mut socket_read, &mut inbound_file);

    tokio::select! {
        result = futures::future::try_join(outbound, inbound) => { result?; }
        _ = cancel.cancelled() => {
            info!("socket-adapt cancelled, closing both halves");
            return Err(TygerError::cancelled());
        }
    }
    Ok(())
}

async fn copy_then_close<R, W>(reader: &mut R, writer: &mut W) -> Result<(), TygerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    tokio::io::copy(reader, writer)
        .await
        .map_err(|e| TygerError::transient(format!("socket-adapt copy: {e}")))?;
    tokio::io::AsyncWriteExt::shutdown(writer)
        .await
        .map_err(|e| TygerError::transient(format!("socket-adapt shutdown: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn dial_succeeds_once_listener_is_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });
        let cancel = CancellationToken::new();
        let result = dial_with_retry_timeout(&addr.to_string(), Duration::from_secs(2), Duration::from_millis(10), &cancel).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn dial_times_out_against_a_closed_port() {
        let cancel = CancellationToken::new();
        let result = dial_with_retry_timeout("127.0.0.1:1", Duration::from_millis(50), Duration::from_millis(10), &cancel).await;
        assert!(result.is_err());
    }
}
