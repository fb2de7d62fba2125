//! Data-Plane Client (C7, spec §4.7): splits a stream into fixed-size
//! blocks, uploads them in parallel with a terminator marking the end;
//! reads probe for the terminator and download blocks back in order.

use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use md5::Digest;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tyger_config::DataPlaneConfig;
use tyger_retry::{RetryExecutor, RetryPolicy};
use tyger_types::{ErrorKind, TygerError};

use crate::store::{ObjectStore, PutOutcome};

const TERMINATOR_PREFIX: &str = "_end_";

fn md5_of(data: &[u8]) -> [u8; 16] {
    md5::Md5::digest(data).into()
}

/// Blob name for sequence `seq` (spec §6's wire format): zero-padded so a
/// plain lexicographic container listing sorts in write order.
fn block_name(seq: u64) -> String {
    format!("{seq:010}")
}

fn check_cancelled(cancel: &CancellationToken) -> Result<(), TygerError> {
    if cancel.is_cancelled() {
        return Err(TygerError::cancelled());
    }
    Ok(())
}

pub struct DataPlaneClient {
    store: Arc<dyn ObjectStore>,
    config: DataPlaneConfig,
    /// §4.7's "mismatch retries up to K times with jitter" — the
    /// aggressive preset matches the per-block retry cadence the teacher's
    /// data-plane-analog client uses for its own chunked transfers.
    retry: RetryPolicy,
}

impl DataPlaneClient {
    pub fn new(store: Arc<dyn ObjectStore>, config: DataPlaneConfig) -> Self {
        Self {
            store,
            config,
            retry: RetryPolicy::Aggressive,
        }
    }

    /// Reads `reader` to completion, writing fixed-size blocks to
    /// `container` with up to `dop` concurrent uploads, then writes the
    /// `_end_<N>` terminator. Returns the number of blocks written.
    pub async fn write_buffer<R>(
        &self,
        container: &str,
        mut reader: R,
        cancel: &CancellationToken,
    ) -> Result<u64, TygerError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let block_size = self.config.block_size_bytes;
        let dop = self.config.degree_of_parallelism.max(1);
        let mut in_flight = futures::stream::FuturesUnordered::new();
        let mut next_seq = 0u64;

        loop {
            check_cancelled(cancel)?;
            let mut buf = vec![0u8; block_size];
            let n = read_fill(&mut reader, &mut buf).await?;
            if n == 0 {
                break;
            }
            buf.truncate(n);
            let data = Bytes::from(buf);
            let seq = next_seq;
            next_seq += 1;

            let store = self.store.clone();
            let retry = self.retry.clone();
            let container = container.to_string();
            in_flight.push(async move { upload_block(store, retry, &container, seq, data).await });

            if in_flight.len() >= dop {
                if let Some(result) = in_flight.next().await {
                    result?;
                }
            }
        }
        while let Some(result) = in_flight.next().await {
            result?;
        }

        let terminator = format!("{TERMINATOR_PREFIX}{next_seq}");
        match self.store.put_block(container, &terminator, Bytes::new(), md5_of(&[])).await? {
            PutOutcome::Created | PutOutcome::AlreadyExists => {}
        }
        Ok(next_seq)
    }

    /// Probes for the `_end_<N>` terminator, then streams blocks `0..N` in
    /// order, downloading up to `dop` ahead (spec §4.7's read algorithm).
    pub async fn read_buffer(
        &self,
        container: &str,
        cancel: &CancellationToken,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<Bytes, TygerError>> + Send>>, TygerError> {
        check_cancelled(cancel)?;
        let total_blocks = self.discover_length(container).await?;
        let store = self.store.clone();
        let retry = self.retry.clone();
        let container = container.to_string();
        let dop = self.config.degree_of_parallelism.max(1);

        let s = stream::iter(0..total_blocks).map(move |seq| {
            let store = store.clone();
            let retry = retry.clone();
            let container = container.clone();
            async move { download_block(store, retry, &container, seq).await }
        });
        Ok(Box::pin(s.buffered(dop)))
    }

    async fn discover_length(&self, container: &str) -> Result<u64, TygerError> {
        let names = self.store.list_blob_names(container, TERMINATOR_PREFIX).await?;
        names
            .iter()
            .find_map(|name| name.strip_prefix(TERMINATOR_PREFIX))
            .and_then(|n| n.parse::<u64>().ok())
            .ok_or_else(|| TygerError::not_found(format!("no terminator blob for buffer `{container}`")))
    }
}

async fn read_fill<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<usize, TygerError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader
            .read(&mut buf[filled..])
            .await
            .map_err(|e| TygerError::transient(format!("read input: {e}")))?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

async fn upload_block(
    store: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
    container: &str,
    seq: u64,
    data: Bytes,
) -> Result<(), TygerError> {
    let executor = RetryExecutor::from_policy(retry);
    let name = block_name(seq);
    executor
        .run(|_attempt| {
            let store = store.clone();
            let data = data.clone();
            let name = name.clone();
            let container = container.to_string();
            async move {
                let md5 = md5_of(&data);
                store.put_block(&container, &name, data, md5).await.map(|_| ())
            }
        })
        .await
}

async fn download_block(
    store: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
    container: &str,
    seq: u64,
) -> Result<Bytes, TygerError> {
    let executor = RetryExecutor::from_policy(retry);
    let name = block_name(seq);
    executor
        .run(|_attempt| {
            let store = store.clone();
            let name = name.clone();
            let container = container.to_string();
            async move {
                let (data, stored_md5) = store.get_block(&container, &name).await?;
                if md5_of(&data) != stored_md5 {
                    warn!(container = %container, seq, "block checksum mismatch, retrying");
                    return Err(TygerError::new(ErrorKind::Transient, "block checksum mismatch"));
                }
                Ok(data)
            }
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryObjectStore;

    fn client(block_size: usize) -> DataPlaneClient {
        DataPlaneClient::new(
            Arc::new(InMemoryObjectStore::default()),
            DataPlaneConfig {
                block_size_bytes: block_size,
                degree_of_parallelism: 4,
                max_block_retries: 3,
            },
        )
    }

    #[tokio::test]
    async fn round_trips_multi_block_payload() {
        let client = client(4);
        let cancel = CancellationToken::new();
        let payload = b"hello world, this is more than four bytes".to_vec();
        let blocks = client
            .write_buffer("buf1", std::io::Cursor::new(payload.clone()), &cancel)
            .await
            .unwrap();
        assert_eq!(blocks, (payload.len() as u64).div_ceil(4));

        let mut read_back = Vec::new();
        let mut stream = client.read_buffer("buf1", &cancel).await.unwrap();
        while let Some(chunk) = stream.next().await {
            read_back.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(read_back, payload);
    }

    #[tokio::test]
    async fn read_missing_buffer_errors() {
        let client = client(4);
        let cancel = CancellationToken::new();
        assert!(client.read_buffer("nope", &cancel).await.is_err());
    }

    #[tokio::test]
    async fn empty_payload_writes_only_terminator() {
        let client = client(4);
        let cancel = CancellationToken::new();
        let blocks = client
            .write_buffer("empty", std::io::Cursor::new(Vec::new()), &cancel)
            .await
            .unwrap();
        assert_eq!(blocks, 0);
        let mut stream = client.read_buffer("empty", &cancel).await.unwrap();
        assert!(stream.next().await.is_none());
    }
}
