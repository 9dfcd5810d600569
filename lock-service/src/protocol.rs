//! Wire types for the host socket.
//!
//! Newline-delimited JSON-RPC-lite: one object per line, requests carry an
//! `id`, notifications do not. Both sides issue requests: the host calls
//! `hello`, `command` and `service.status`; the service calls the browser
//! methods below and the host answers with `result` or `error`.

use std::collections::BTreeMap;

use flow_core::LockState;
use flow_core::browser::Tab;
use flow_core::ids::{TabId, WindowId};
use flow_core::notify::{ContentMessage, Notification};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─────────────────────────────────────────────────────────────────────────────
// Error codes (JSON-RPC error.code)
// ─────────────────────────────────────────────────────────────────────────────

pub const ERR_INVALID_REQUEST: i64 = -32600;
pub const ERR_METHOD_NOT_FOUND: i64 = -32601;
pub const ERR_INVALID_PARAMS: i64 = -32602;
pub const ERR_INFRA: i64 = 300;

// ─────────────────────────────────────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Integer(i64),
    String(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub id: RequestId,
    pub result: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcErrorBody {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub id: RequestId,
    pub error: JsonRpcErrorBody,
}

/// Any inbound line. Variant order matters: a request is tried before a
/// notification because both carry `method`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Error(JsonRpcError),
    Notification(JsonRpcNotification),
}

// ─────────────────────────────────────────────────────────────────────────────
// Method names
// ─────────────────────────────────────────────────────────────────────────────

/// Host → service requests.
pub const METHOD_HELLO: &str = "hello";
pub const METHOD_COMMAND: &str = "command";
pub const METHOD_SERVICE_STATUS: &str = "service.status";

/// Host → service notifications (browser events).
pub const EVENT_TAB_ACTIVATED: &str = "tabs.onActivated";
pub const EVENT_TAB_CREATED: &str = "tabs.onCreated";
pub const EVENT_TAB_REMOVED: &str = "tabs.onRemoved";
pub const EVENT_WINDOW_FOCUS_CHANGED: &str = "windows.onFocusChanged";
pub const EVENT_COMMAND: &str = "commands.onCommand";
pub const EVENT_STORAGE_CHANGED: &str = "storage.onChanged";

/// Service → host requests (browser control).
pub const HOST_TABS_GET: &str = "tabs.get";
pub const HOST_TABS_UPDATE: &str = "tabs.update";
pub const HOST_TABS_REMOVE: &str = "tabs.remove";
pub const HOST_TABS_QUERY: &str = "tabs.query";
pub const HOST_TABS_CREATE: &str = "tabs.create";
pub const HOST_TABS_SEND_MESSAGE: &str = "tabs.sendMessage";
pub const HOST_WINDOWS_UPDATE: &str = "windows.update";
pub const HOST_WINDOWS_GET_LAST_FOCUSED: &str = "windows.getLastFocused";
pub const HOST_EXECUTE_SCRIPT: &str = "scripting.executeScript";
pub const HOST_SHOW_NOTIFICATION: &str = "notifications.show";
pub const HOST_SET_LOCK_INDICATOR: &str = "action.setLockIndicator";

/// Service → host notification carrying effective store writes.
pub const HOST_STORAGE_CHANGED: &str = "storage.changed";

/// Content script injected into the locked tab.
pub const MODAL_SCRIPT: &str = "modal.bundle.js";

// ─────────────────────────────────────────────────────────────────────────────
// Handshake
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloParams {
    pub protocol_version: String,
    pub client_version: String,
    #[serde(default)]
    pub role: ClientRole,
}

/// Only a `host` connection becomes the browser link; a `ping` client just checks
/// that the service answers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientRole {
    #[default]
    Host,
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloResult {
    pub protocol_version: String,
    pub service_version: String,
    pub capabilities: Vec<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// service.status
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatusResult {
    pub uptime_s: u64,
    pub host_attached: bool,
    pub connections: u32,
    pub state: LockState,
}

// ─────────────────────────────────────────────────────────────────────────────
// Browser events
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabActivatedParams {
    pub tab_id: TabId,
    #[serde(default)]
    pub window_id: Option<WindowId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabCreatedParams {
    pub tab: Tab,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabRemovedParams {
    pub tab_id: TabId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowFocusParams {
    pub window_id: WindowId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShortcutParams {
    pub command: String,
}

/// One key of an extension-storage change, as the host reports it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageValueChange {
    #[serde(default)]
    pub old_value: Option<Value>,
    #[serde(default)]
    pub new_value: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostStorageChangedParams {
    pub changes: BTreeMap<String, StorageValueChange>,
}

/// Store keys and their new values, pushed to the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSnapshotParams {
    pub changes: BTreeMap<String, Value>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Browser control (service → host)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabRefParams {
    pub tab_id: TabId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabUpdateParams {
    pub tab_id: TabId,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabQueryParams {
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_window: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_id: Option<WindowId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabCreateParams {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageParams {
    pub tab_id: TabId,
    pub message: ContentMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowUpdateParams {
    pub window_id: WindowId,
    pub focused: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowInfo {
    pub id: WindowId,
    #[serde(default)]
    pub focused: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteScriptParams {
    pub tab_id: TabId,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShowNotificationParams {
    pub tab_id: TabId,
    pub notification: Notification,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockIndicatorParams {
    pub locked: bool,
}
