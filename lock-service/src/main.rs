//! `flow-lock-service` entry point.
//!
//! ## Modes
//!
//! - **Service mode** (default): load configuration, open the state file,
//!   start the IPC server and wait for the browser host to attach.
//! - **`--ping`**: connect to the running service socket as a ping client, send a
//!   hello handshake, verify the response, then exit. Useful to trigger
//!   socket activation or as a liveness check.

use std::io::{BufRead, Write};
use std::os::unix::io::FromRawFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use flow_core::clock::SystemClock;
use flow_core::config::{ConfigLoader, FlowConfig};
use flow_core::{Engine, FileStore, StateStore};
use flow_lock_service::host::{HostLink, RemoteBrowser};
use flow_lock_service::ipc::{self, ServiceContext};
use tokio::net::UnixListener;

/// Poll interval for the idle timer.
const IDLE_POLL_INTERVAL_SECS: u64 = 10;

fn socket_path(config: &FlowConfig) -> PathBuf {
    config
        .service
        .socket_path
        .clone()
        .unwrap_or_else(flow_lock_service::default_socket_path)
}

/// Connect to the service socket, send a ping hello, verify the response,
/// then exit.
fn ping() -> anyhow::Result<()> {
    let config = ConfigLoader::new().load().unwrap_or_default();
    let path = socket_path(&config);
    let mut stream = std::os::unix::net::UnixStream::connect(&path)
        .with_context(|| format!("ping: cannot connect to {}", path.display()))?;
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;
    stream.set_write_timeout(Some(Duration::from_secs(5)))?;

    let hello = serde_json::json!({
        "id": 0,
        "method": "hello",
        "params": {
            "protocolVersion": flow_lock_service::PROTOCOL_VERSION,
            "clientVersion": "ping",
            "role": "ping",
        }
    });
    stream.write_all(hello.to_string().as_bytes())?;
    stream.write_all(b"\n")?;
    stream.flush()?;

    let mut reader = std::io::BufReader::new(&stream);
    let mut line = String::new();
    reader.read_line(&mut line)?;

    let resp: serde_json::Value =
        serde_json::from_str(line.trim()).context("ping: invalid response JSON")?;
    if resp.get("result").is_some() {
        eprintln!("ping: service is alive");
        Ok(())
    } else {
        let msg = resp
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
            .unwrap_or("unknown error");
        anyhow::bail!("ping: hello failed: {msg}")
    }
}

/// Create a Unix listener, preferring systemd socket activation.
///
/// If `LISTEN_FDS` is set to >= 1, uses fd 3 (the first passed fd).
/// Otherwise, binds at the configured socket path.
fn create_listener(path: &std::path::Path) -> std::io::Result<UnixListener> {
    if let Ok(val) = std::env::var("LISTEN_FDS")
        && let Ok(n) = val.parse::<u32>()
        && n >= 1
    {
        tracing::info!("Socket activation: using fd 3 from LISTEN_FDS={n}");
        // SAFETY: fd 3 is guaranteed by systemd socket activation protocol
        let std_listener = unsafe { std::os::unix::net::UnixListener::from_raw_fd(3) };
        std_listener.set_nonblocking(true)?;
        return UnixListener::from_std(std_listener);
    }
    ipc::bind_listener(path)
}

fn main() -> anyhow::Result<()> {
    if std::env::args().nth(1).as_deref() == Some("--ping") {
        return ping();
    }
    run_service()
}

#[tokio::main]
async fn run_service() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("flow-lock-service v{} starting", env!("CARGO_PKG_VERSION"));

    let config = ConfigLoader::new()
        .load()
        .context("failed to load configuration")?;

    let state_path = match config.service.state_file.clone() {
        Some(path) => path,
        None => FileStore::default_path()?,
    };
    let store: Arc<dyn StateStore> = Arc::new(
        FileStore::open(&state_path)
            .with_context(|| format!("failed to open state file {}", state_path.display()))?,
    );
    tracing::info!("State file at {}", state_path.display());

    let host = HostLink::new(config.service.host_call_timeout());
    let engine = Engine::new(
        Arc::new(RemoteBrowser::new(Arc::clone(&host))),
        store,
        Arc::new(SystemClock),
        config.engine.clone(),
    );
    engine.install_defaults().await;
    let _store_listener = engine.spawn_store_listener();

    let ctx = Arc::new(ServiceContext::new(engine.clone(), host));
    let _storage_forwarder = ipc::spawn_storage_forwarder(Arc::clone(&ctx));

    let path = socket_path(&config);
    let listener = create_listener(&path)?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let shutdown_tx_signal = shutdown_tx.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Signal received, shutting down");
        let _ = shutdown_tx_signal.send(true);
    });

    let idle_timeout_secs = config.service.idle_timeout_secs;
    if idle_timeout_secs > 0 {
        let ctx_idle = Arc::clone(&ctx);
        tokio::spawn(async move {
            let poll_interval = Duration::from_secs(IDLE_POLL_INTERVAL_SECS);
            let idle_timeout = Duration::from_secs(idle_timeout_secs);
            loop {
                tokio::time::sleep(poll_interval).await;

                let locked = ctx_idle.engine().snapshot().await.is_locked;
                let connections = ctx_idle.connection_count();
                let elapsed = ctx_idle.last_activity_elapsed().await;

                if !locked && connections == 0 && elapsed >= idle_timeout {
                    tracing::info!(
                        "Idle timeout ({idle_timeout_secs}s): no connections, no lock held. Exiting."
                    );
                    let _ = shutdown_tx.send(true);
                    break;
                }
            }
        });
    }

    ipc::serve(ctx, listener, shutdown_rx).await?;

    engine.settle().await;
    if path.exists()
        && let Err(e) = std::fs::remove_file(&path)
    {
        tracing::warn!("Failed to remove socket {}: {e}", path.display());
    }

    tracing::info!("flow-lock-service exiting cleanly");
    Ok(())
}
