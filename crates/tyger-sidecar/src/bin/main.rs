//! CLI entry point for the Buffer Sidecar / Relay (C8). One process, one
//! mode per invocation, matching how the Backend Adapter (C4) injects this
//! binary as a sidecar container alongside the user's main container.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tyger_backend::RelayBinding;
use tyger_config::DataPlaneConfig;
use tyger_dataplane::{DataPlaneClient, LocalFilesystemObjectStore, ObjectStore};
use tyger_sidecar::{presence::MainContainerPresence, socket_adapt, PipeBridge, SocketRelay};
use tyger_sign::{SignatureService, SigningKey};

#[derive(Parser, Debug)]
#[command(name = "tyger-sidecar", version)]
#[command(about = "Bridges named pipes and relay sockets in a run's pod to buffer URLs")]
struct Cli {
    /// Directory backing the local object store (dev-mode default; a
    /// cluster deployment points this at the mounted data-plane volume).
    #[arg(long, env = "TYGER_DATA_PLANE_DIR", default_value = "/var/run/tyger/data")]
    data_plane_dir: PathBuf,

    /// Directory containing the `started`/`exited` tombstone files written
    /// for the main container.
    #[arg(long, env = "TYGER_TOMBSTONE_DIR", default_value = "/run/tyger")]
    tombstone_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Push a buffer's contents into a named pipe the main container reads.
    Read {
        #[arg(long)]
        pipe: PathBuf,
        #[arg(long)]
        container: String,
    },
    /// Drain a named pipe the main container writes into a buffer.
    Write {
        #[arg(long)]
        pipe: PathBuf,
        #[arg(long)]
        container: String,
    },
    /// Serve one socket relay binding, tunneling to/from a buffer.
    Relay {
        #[arg(long)]
        port: u16,
        #[arg(long)]
        input_buffer_url: Option<String>,
        #[arg(long)]
        output_buffer_url: Option<String>,
        /// Listen on TCP instead of a Unix-domain socket.
        #[arg(long)]
        prefer_tcp: bool,
        /// Base64 HMAC signing key used to validate relay tokens.
        #[arg(long, env = "TYGER_SIGNING_KEY")]
        signing_key: String,
    },
    /// Dial a TCP destination and bridge it to a pair of files.
    SocketAdapt {
        #[arg(long)]
        addr: String,
        #[arg(long)]
        read_from: PathBuf,
        #[arg(long)]
        write_to: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let cancel = CancellationToken::new();

    let store: Arc<dyn ObjectStore> = Arc::new(LocalFilesystemObjectStore::new(cli.data_plane_dir));
    let client = Arc::new(DataPlaneClient::new(store, DataPlaneConfig::default()));
    let presence = MainContainerPresence::new(cli.tombstone_dir, Duration::from_secs(1));

    match cli.command {
        Commands::Read { pipe, container } => {
            PipeBridge::new(client)
                .bridge_read(&presence, &pipe, &container, &cancel)
                .await
                .context("read-mode pipe bridge failed")?;
        }
        Commands::Write { pipe, container } => {
            PipeBridge::new(client)
                .bridge_write(&presence, &pipe, &container, &cancel)
                .await
                .context("write-mode pipe bridge failed")?;
        }
        Commands::Relay {
            port,
            input_buffer_url,
            output_buffer_url,
            prefer_tcp,
            signing_key,
        } => {
            let key_bytes = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, signing_key)
                .context("decoding TYGER_SIGNING_KEY")?;
            let sign = Arc::new(SignatureService::new(SigningKey::from_bytes(key_bytes)));
            let binding = RelayBinding {
                port,
                input_buffer_url,
                output_buffer_url,
                prefer_tcp,
            };
            SocketRelay::new(client, sign)
                .serve_binding(&binding, &cancel)
                .await
                .context("socket relay failed")?;
        }
        Commands::SocketAdapt { addr, read_from, write_to } => {
            let socket = socket_adapt::dial_with_retry(&addr, &cancel)
                .await
                .context("dialing socket-adapt destination")?;
            socket_adapt::adapt(socket, &read_from, &write_to, &cancel)
                .await
                .context("socket-adapt bridging failed")?;
        }
    }

    Ok(())
}
