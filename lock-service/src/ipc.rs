//! Unix domain socket IPC listener.
//!
//! Each connection gets a writer task fed by a line queue and a read loop.
//! Replies to the service's own host calls are resolved inline by the read
//! loop; requests and notifications go through an ordered dispatcher task,
//! so a handler awaiting a host reply never blocks the reader that delivers
//! it.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use flow_core::browser::BrowserError;
use flow_core::router::Command;
use flow_core::store::{StateStore, StorageItems, StorageKey};
use flow_core::{CommandRouter, Engine};
use serde::de::DeserializeOwned;
use serde_json::Value;
use strum::IntoEnumIterator;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;

use crate::PROTOCOL_VERSION;
use crate::host::{HostLink, LineSender};
use crate::protocol::*;

type RpcResult = Result<Value, (i64, String)>;

/// Pushed values remembered per key while waiting for the host's echo.
const MAX_PENDING_ECHOES: usize = 32;

/// Values pushed to the host that it has not echoed back yet, per key.
///
/// The host mirrors every push into browser storage, whose change event
/// comes back to us. Such an echo may arrive after a newer local write, so
/// comparing against the store alone would roll the store back and start a
/// ping-pong between the two values.
#[derive(Default)]
struct PendingEchoes {
    by_key: HashMap<StorageKey, VecDeque<Value>>,
}

impl PendingEchoes {
    fn record(&mut self, items: &StorageItems) {
        for (key, value) in items {
            let queue = self.by_key.entry(*key).or_default();
            if queue.len() == MAX_PENDING_ECHOES {
                queue.pop_front();
            }
            queue.push_back(value.clone());
        }
    }

    /// True when `value` is the echo of one of our pushes for `key`. The
    /// echo and every older push for the key are consumed.
    fn take(&mut self, key: StorageKey, value: &Value) -> bool {
        let Some(queue) = self.by_key.get_mut(&key) else {
            return false;
        };
        match queue.iter().position(|pushed| pushed == value) {
            Some(index) => {
                queue.drain(..=index);
                true
            }
            None => false,
        }
    }

    fn clear(&mut self) {
        self.by_key.clear();
    }
}

/// Shared state behind every connection.
pub struct ServiceContext {
    engine: Engine,
    router: CommandRouter,
    host: Arc<HostLink>,
    started_at: Instant,
    connections: AtomicU32,
    next_connection_id: AtomicU64,
    last_activity: Mutex<Instant>,
    echoes: Mutex<PendingEchoes>,
}

impl ServiceContext {
    pub fn new(engine: Engine, host: Arc<HostLink>) -> Self {
        Self {
            router: CommandRouter::new(engine.clone()),
            engine,
            host,
            started_at: Instant::now(),
            connections: AtomicU32::new(0),
            next_connection_id: AtomicU64::new(1),
            last_activity: Mutex::new(Instant::now()),
            echoes: Mutex::new(PendingEchoes::default()),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn host(&self) -> &Arc<HostLink> {
        &self.host
    }

    fn store(&self) -> &Arc<dyn StateStore> {
        self.engine.storage().store()
    }

    pub fn connection_count(&self) -> u32 {
        self.connections.load(Ordering::Relaxed)
    }

    pub async fn last_activity_elapsed(&self) -> Duration {
        self.last_activity.lock().await.elapsed()
    }

    async fn touch_activity(&self) {
        *self.last_activity.lock().await = Instant::now();
    }
}

enum Inbound {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
}

/// Bind the listener at `path`, replacing a stale socket file.
pub fn bind_listener(path: &Path) -> std::io::Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(path)?;
    tracing::info!("Flow lock service listening on {}", path.display());
    Ok(listener)
}

/// Accept connections until `shutdown` flips to true.
pub async fn serve(
    ctx: Arc<ServiceContext>,
    listener: UnixListener,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let ctx = Arc::clone(&ctx);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(ctx, stream).await {
                            tracing::warn!("Connection error: {e}");
                        }
                    });
                }
                Err(e) => tracing::error!("Accept error: {e}"),
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    tracing::info!("Shutdown requested; no longer accepting connections");
                    break;
                }
            }
        }
    }
    Ok(())
}

/// Handle a single client connection.
async fn handle_connection(ctx: Arc<ServiceContext>, stream: UnixStream) -> std::io::Result<()> {
    let connection_id = ctx.next_connection_id.fetch_add(1, Ordering::Relaxed);
    ctx.connections.fetch_add(1, Ordering::Relaxed);
    ctx.touch_activity().await;
    tracing::debug!("Connection {connection_id} opened");

    let (reader, writer) = stream.into_split();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_lines(writer, out_rx));
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let dispatcher = tokio::spawn(dispatch_inbound(
        Arc::clone(&ctx),
        connection_id,
        out_tx.clone(),
        in_rx,
    ));

    let result = read_lines(&ctx, reader, &out_tx, &in_tx).await;

    // Detach first so queued handlers fail their host calls fast.
    ctx.host.detach(connection_id).await;
    drop(in_tx);
    let _ = dispatcher.await;
    drop(out_tx);
    let _ = writer_task.await;

    ctx.connections.fetch_sub(1, Ordering::Relaxed);
    ctx.touch_activity().await;
    tracing::debug!("Connection {connection_id} closed");
    result
}

async fn write_lines(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<String>,
) -> std::io::Result<()> {
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
    }
    Ok(())
}

async fn read_lines(
    ctx: &ServiceContext,
    reader: OwnedReadHalf,
    out: &LineSender,
    inbound: &mpsc::UnboundedSender<Inbound>,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            break; // EOF
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        ctx.touch_activity().await;

        let queued = match serde_json::from_str::<JsonRpcMessage>(trimmed) {
            Ok(JsonRpcMessage::Response(response)) => {
                ctx.host.resolve(&response.id, Ok(response.result)).await;
                Ok(())
            }
            Ok(JsonRpcMessage::Error(error)) => {
                let reply = Err(BrowserError::from_host_message(error.error.message));
                ctx.host.resolve(&error.id, reply).await;
                Ok(())
            }
            Ok(JsonRpcMessage::Request(request)) => {
                inbound.send(Inbound::Request(request)).map_err(|_| ())
            }
            Ok(JsonRpcMessage::Notification(note)) => {
                inbound.send(Inbound::Notification(note)).map_err(|_| ())
            }
            Err(e) => {
                let _ = out.send(error_line(
                    RequestId::Integer(0),
                    ERR_INVALID_REQUEST,
                    format!("Invalid JSON-RPC: {e}"),
                ));
                Ok(())
            }
        };
        if queued.is_err() {
            tracing::warn!("Dispatcher gone; closing connection");
            break;
        }
    }

    Ok(())
}

/// Handle requests and notifications strictly in arrival order.
async fn dispatch_inbound(
    ctx: Arc<ServiceContext>,
    connection_id: u64,
    out: LineSender,
    mut rx: mpsc::UnboundedReceiver<Inbound>,
) {
    while let Some(item) = rx.recv().await {
        match item {
            Inbound::Request(request) => {
                let id = request.id.clone();
                let line = match dispatch_method(
                    &ctx,
                    connection_id,
                    &out,
                    &request.method,
                    request.params,
                )
                .await
                {
                    Ok(result) => response_line(id, result),
                    Err((code, message)) => error_line(id, code, message),
                };
                if out.send(line).is_err() {
                    break;
                }
            }
            Inbound::Notification(note) => handle_event(&ctx, &note.method, note.params).await,
        }
    }
}

fn response_line(id: RequestId, result: Value) -> String {
    serde_json::to_string(&JsonRpcResponse { id, result }).unwrap_or_else(|_| "{}".to_string())
}

fn error_line(id: RequestId, code: i64, message: String) -> String {
    serde_json::to_string(&JsonRpcError {
        id,
        error: JsonRpcErrorBody {
            code,
            message,
            data: None,
        },
    })
    .unwrap_or_else(|_| "{}".to_string())
}

fn parse_params<T: DeserializeOwned>(method: &str, params: Option<Value>) -> Result<T, (i64, String)> {
    params
        .ok_or_else(|| (ERR_INVALID_PARAMS, "Missing params".to_string()))
        .and_then(|v| {
            serde_json::from_value(v)
                .map_err(|e| (ERR_INVALID_PARAMS, format!("Invalid {method} params: {e}")))
        })
}

fn to_result<T: serde::Serialize>(value: T) -> RpcResult {
    serde_json::to_value(value).map_err(|e| (ERR_INFRA, format!("Serialize error: {e}")))
}

/// Dispatch to the appropriate handler based on method name.
async fn dispatch_method(
    ctx: &Arc<ServiceContext>,
    connection_id: u64,
    out: &LineSender,
    method: &str,
    params: Option<Value>,
) -> RpcResult {
    match method {
        METHOD_HELLO => handle_hello(ctx, connection_id, out, params).await,
        METHOD_COMMAND => handle_command(ctx, params).await,
        METHOD_SERVICE_STATUS => handle_service_status(ctx).await,
        _ => Err((ERR_METHOD_NOT_FOUND, format!("Unknown method: {method}"))),
    }
}

/// Handle the `hello` handshake. A host connection becomes the browser
/// link; the engine then restores its lock and the host receives the full
/// store contents.
async fn handle_hello(
    ctx: &Arc<ServiceContext>,
    connection_id: u64,
    out: &LineSender,
    params: Option<Value>,
) -> RpcResult {
    let hello: HelloParams = parse_params(METHOD_HELLO, params)?;

    if hello.protocol_version != PROTOCOL_VERSION {
        return Err((
            ERR_INVALID_PARAMS,
            format!(
                "Incompatible protocol version: client={}, service={}",
                hello.protocol_version, PROTOCOL_VERSION
            ),
        ));
    }

    if hello.role == ClientRole::Host {
        tracing::info!(
            "Host {} connected on connection {connection_id}",
            hello.client_version
        );
        ctx.echoes.lock().await.clear();
        ctx.host.attach(connection_id, out.clone()).await;
        let on_attach = Arc::clone(ctx);
        ctx.engine.spawn(async move {
            push_storage_snapshot(&on_attach).await;
            on_attach.engine.initialize().await;
        });
    }

    to_result(HelloResult {
        protocol_version: PROTOCOL_VERSION.to_string(),
        service_version: env!("CARGO_PKG_VERSION").to_string(),
        capabilities: vec![
            METHOD_COMMAND.to_string(),
            METHOD_SERVICE_STATUS.to_string(),
            HOST_STORAGE_CHANGED.to_string(),
        ],
    })
}

/// Handle `command`: a router intent from a page or the popup.
async fn handle_command(ctx: &ServiceContext, params: Option<Value>) -> RpcResult {
    let raw = params.ok_or_else(|| (ERR_INVALID_PARAMS, "Missing params".to_string()))?;
    let command = Command::from_json(raw).map_err(|e| (ERR_INVALID_PARAMS, e.to_string()))?;
    to_result(ctx.router.dispatch(command).await)
}

/// Handle `service.status`.
async fn handle_service_status(ctx: &ServiceContext) -> RpcResult {
    to_result(ServiceStatusResult {
        uptime_s: ctx.started_at.elapsed().as_secs(),
        host_attached: ctx.host.is_attached().await,
        connections: ctx.connection_count(),
        state: ctx.engine.snapshot().await,
    })
}

/// Route a browser event notification to the engine.
async fn handle_event(ctx: &ServiceContext, method: &str, params: Option<Value>) {
    if let Err((_, message)) = route_event(ctx, method, params).await {
        tracing::warn!("{message}");
    }
}

async fn route_event(
    ctx: &ServiceContext,
    method: &str,
    params: Option<Value>,
) -> Result<(), (i64, String)> {
    match method {
        EVENT_TAB_ACTIVATED => {
            let p: TabActivatedParams = parse_params(method, params)?;
            ctx.engine.on_tab_activated(p.tab_id).await;
        }
        EVENT_TAB_CREATED => {
            let p: TabCreatedParams = parse_params(method, params)?;
            ctx.engine.on_tab_created(p.tab).await;
        }
        EVENT_TAB_REMOVED => {
            let p: TabRemovedParams = parse_params(method, params)?;
            ctx.engine.on_tab_removed(p.tab_id).await;
        }
        EVENT_WINDOW_FOCUS_CHANGED => {
            let p: WindowFocusParams = parse_params(method, params)?;
            ctx.engine.on_window_focus_changed(p.window_id).await;
        }
        EVENT_COMMAND => {
            let p: ShortcutParams = parse_params(method, params)?;
            ctx.engine.on_command(&p.command).await;
        }
        EVENT_STORAGE_CHANGED => {
            let p: HostStorageChangedParams = parse_params(method, params)?;
            apply_host_storage(ctx, p).await;
        }
        _ => tracing::debug!("Ignoring unknown notification {method}"),
    }
    Ok(())
}

/// Write host-side storage changes into the store. Echoes of our own
/// pushes are dropped; anything else is a write made on the browser side.
async fn apply_host_storage(ctx: &ServiceContext, params: HostStorageChangedParams) {
    let mut items = StorageItems::new();
    {
        let mut echoes = ctx.echoes.lock().await;
        for (name, change) in params.changes {
            let Ok(key) = name.parse::<StorageKey>() else {
                tracing::debug!("Ignoring unknown storage key {name}");
                continue;
            };
            let value = change.new_value.unwrap_or(Value::Null);
            if echoes.take(key, &value) {
                continue;
            }
            items.insert(key, value);
        }
    }
    if items.is_empty() {
        return;
    }
    if let Err(e) = ctx.store().set(items).await {
        tracing::warn!("Failed to apply host storage change: {e}");
    }
}

fn snapshot_params(items: StorageItems) -> StorageSnapshotParams {
    StorageSnapshotParams {
        changes: items
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect::<BTreeMap<_, _>>(),
    }
}

/// Send `items` to the host, remembering them so their echo is recognized.
async fn push_to_host(ctx: &ServiceContext, items: StorageItems) {
    if items.is_empty() || !ctx.host.is_attached().await {
        return;
    }
    ctx.echoes.lock().await.record(&items);
    ctx.host
        .notify(HOST_STORAGE_CHANGED, snapshot_params(items))
        .await;
}

async fn push_storage_snapshot(ctx: &ServiceContext) {
    let keys: Vec<StorageKey> = StorageKey::iter().collect();
    match ctx.store().get(&keys).await {
        Ok(items) => push_to_host(ctx, items).await,
        Err(e) => tracing::warn!("Failed to read store for host snapshot: {e}"),
    }
}

/// Forward every effective store write to the attached host.
pub fn spawn_storage_forwarder(ctx: Arc<ServiceContext>) -> JoinHandle<()> {
    let mut rx = ctx.store().subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(changes) => {
                    let items = changes
                        .into_iter()
                        .map(|change| (change.key, change.new_value.unwrap_or(Value::Null)))
                        .collect();
                    push_to_host(&ctx, items).await;
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Storage forwarder lagged by {skipped}; pushing full snapshot");
                    push_storage_snapshot(&ctx).await;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
