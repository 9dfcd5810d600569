//! Browser control over the host connection.
//!
//! [`HostLink`] tracks the attached host and correlates the service's
//! outbound requests with the host's replies. [`RemoteBrowser`] implements
//! the engine's [`BrowserControl`] seam on top of it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use flow_core::browser::{BrowserControl, BrowserError, BrowserErrorKind, Tab, WindowScope};
use flow_core::ids::{TabId, WindowId};
use flow_core::notify::{ContentMessage, ExtensionPage, Notification};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc, oneshot};

use crate::protocol::*;

type Reply = Result<Value, BrowserError>;

/// Outbound half of one connection: serialized lines queued for its writer.
pub type LineSender = mpsc::UnboundedSender<String>;

struct Attached {
    connection_id: u64,
    outbound: LineSender,
}

/// Correlates service → host requests with host replies.
pub struct HostLink {
    attached: Mutex<Option<Attached>>,
    pending: Mutex<HashMap<i64, oneshot::Sender<Reply>>>,
    next_id: AtomicI64,
    call_timeout: Duration,
}

impl HostLink {
    pub fn new(call_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            attached: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            call_timeout,
        })
    }

    /// Make `connection_id` the browser host. A previously attached host is
    /// replaced and its outstanding calls fail.
    pub async fn attach(&self, connection_id: u64, outbound: LineSender) {
        let previous = self.attached.lock().await.replace(Attached {
            connection_id,
            outbound,
        });
        if let Some(previous) = previous {
            tracing::info!(
                "Host connection {} replaced by {connection_id}",
                previous.connection_id
            );
            self.fail_pending().await;
        } else {
            tracing::info!("Host attached on connection {connection_id}");
        }
    }

    /// Drop the host if `connection_id` is still the attached one.
    pub async fn detach(&self, connection_id: u64) {
        let mut attached = self.attached.lock().await;
        if attached
            .as_ref()
            .is_some_and(|a| a.connection_id == connection_id)
        {
            *attached = None;
            drop(attached);
            tracing::info!("Host on connection {connection_id} detached");
            self.fail_pending().await;
        }
    }

    pub async fn is_attached(&self) -> bool {
        self.attached.lock().await.is_some()
    }

    async fn outbound(&self) -> Option<LineSender> {
        self.attached
            .lock()
            .await
            .as_ref()
            .map(|a| a.outbound.clone())
    }

    async fn fail_pending(&self) {
        let drained: Vec<_> = self.pending.lock().await.drain().collect();
        for (_, waiter) in drained {
            let _ = waiter.send(Err(BrowserError::host_unavailable()));
        }
    }

    /// Issue `method` to the host and wait for its reply.
    pub async fn call(&self, method: &str, params: impl Serialize) -> Reply {
        let params = serde_json::to_value(params).map_err(|e| encode_error(method, &e))?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = serde_json::to_string(&JsonRpcRequest {
            id: RequestId::Integer(id),
            method: method.to_string(),
            params: Some(params),
        })
        .map_err(|e| encode_error(method, &e))?;

        // Register under the attachment lock so a concurrent detach either
        // sees this call in `pending` or this call sees no host.
        let (tx, rx) = oneshot::channel();
        let outbound = {
            let attached = self.attached.lock().await;
            let Some(attached) = attached.as_ref() else {
                return Err(BrowserError::host_unavailable());
            };
            self.pending.lock().await.insert(id, tx);
            attached.outbound.clone()
        };
        if outbound.send(line).is_err() {
            self.pending.lock().await.remove(&id);
            return Err(BrowserError::host_unavailable());
        }

        match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(BrowserError::host_unavailable()),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                tracing::warn!("Host call {method} (id {id}) timed out");
                Err(BrowserError::timeout(method))
            }
        }
    }

    /// Deliver a host reply. Returns false when nobody waits for `id` any
    /// more (timed out, or never issued).
    pub async fn resolve(&self, id: &RequestId, reply: Reply) -> bool {
        let RequestId::Integer(id) = id else {
            return false;
        };
        match self.pending.lock().await.remove(id) {
            Some(waiter) => waiter.send(reply).is_ok(),
            None => {
                tracing::debug!("Late or unknown host reply for id {id}");
                false
            }
        }
    }

    /// Fire-and-forget notification to the host. Returns false when no host
    /// is attached.
    pub async fn notify(&self, method: &str, params: impl Serialize) -> bool {
        let Some(outbound) = self.outbound().await else {
            return false;
        };
        let line = serde_json::to_value(params).and_then(|params| {
            serde_json::to_string(&JsonRpcNotification {
                method: method.to_string(),
                params: Some(params),
            })
        });
        match line {
            Ok(line) => outbound.send(line).is_ok(),
            Err(e) => {
                tracing::warn!("Failed to encode {method} notification: {e}");
                false
            }
        }
    }
}

fn encode_error(method: &str, err: &serde_json::Error) -> BrowserError {
    BrowserError::new(
        BrowserErrorKind::Other,
        format!("failed to encode {method}: {err}"),
    )
}

fn decode<T: DeserializeOwned>(method: &str, value: Value) -> Result<T, BrowserError> {
    serde_json::from_value(value).map_err(|e| {
        BrowserError::new(
            BrowserErrorKind::Other,
            format!("unexpected {method} result: {e}"),
        )
    })
}

/// [`BrowserControl`] backed by the attached host.
pub struct RemoteBrowser {
    link: Arc<HostLink>,
}

impl RemoteBrowser {
    pub fn new(link: Arc<HostLink>) -> Self {
        Self { link }
    }

    async fn call_unit(&self, method: &str, params: impl Serialize) -> Result<(), BrowserError> {
        self.link.call(method, params).await.map(|_| ())
    }
}

#[async_trait]
impl BrowserControl for RemoteBrowser {
    async fn get_tab(&self, tab_id: TabId) -> Result<Tab, BrowserError> {
        let value = self
            .link
            .call(HOST_TABS_GET, TabRefParams { tab_id })
            .await?;
        decode(HOST_TABS_GET, value)
    }

    async fn activate_tab(&self, tab_id: TabId) -> Result<(), BrowserError> {
        self.call_unit(
            HOST_TABS_UPDATE,
            TabUpdateParams {
                tab_id,
                active: true,
            },
        )
        .await
    }

    async fn remove_tab(&self, tab_id: TabId) -> Result<(), BrowserError> {
        self.call_unit(HOST_TABS_REMOVE, TabRefParams { tab_id })
            .await
    }

    async fn focus_window(&self, window_id: WindowId) -> Result<(), BrowserError> {
        self.call_unit(
            HOST_WINDOWS_UPDATE,
            WindowUpdateParams {
                window_id,
                focused: true,
            },
        )
        .await
    }

    async fn focused_window(&self) -> Result<Option<WindowId>, BrowserError> {
        let value = self
            .link
            .call(HOST_WINDOWS_GET_LAST_FOCUSED, serde_json::json!({}))
            .await?;
        let window: Option<WindowInfo> = decode(HOST_WINDOWS_GET_LAST_FOCUSED, value)?;
        Ok(window.map(|w| w.id))
    }

    async fn active_tab(&self, scope: WindowScope) -> Result<Option<Tab>, BrowserError> {
        let params = match scope {
            WindowScope::Current => TabQueryParams {
                active: true,
                current_window: Some(true),
                window_id: None,
            },
            WindowScope::Window(window_id) => TabQueryParams {
                active: true,
                current_window: None,
                window_id: Some(window_id),
            },
        };
        let value = self.link.call(HOST_TABS_QUERY, params).await?;
        let tabs: Vec<Tab> = decode(HOST_TABS_QUERY, value)?;
        Ok(tabs.into_iter().next())
    }

    async fn send_to_tab(
        &self,
        tab_id: TabId,
        message: ContentMessage,
    ) -> Result<(), BrowserError> {
        self.call_unit(HOST_TABS_SEND_MESSAGE, SendMessageParams { tab_id, message })
            .await
    }

    async fn inject_content_script(&self, tab_id: TabId) -> Result<(), BrowserError> {
        self.call_unit(
            HOST_EXECUTE_SCRIPT,
            ExecuteScriptParams {
                tab_id,
                files: vec![MODAL_SCRIPT.to_string()],
            },
        )
        .await
    }

    async fn show_notification(
        &self,
        tab_id: TabId,
        notification: Notification,
    ) -> Result<(), BrowserError> {
        self.call_unit(
            HOST_SHOW_NOTIFICATION,
            ShowNotificationParams {
                tab_id,
                notification,
            },
        )
        .await
    }

    async fn open_page(&self, page: ExtensionPage) -> Result<(), BrowserError> {
        self.call_unit(
            HOST_TABS_CREATE,
            TabCreateParams {
                url: page.path().to_string(),
            },
        )
        .await
    }

    async fn set_lock_indicator(&self, locked: bool) -> Result<(), BrowserError> {
        self.call_unit(HOST_SET_LOCK_INDICATOR, LockIndicatorParams { locked })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn request_of(line: &str) -> JsonRpcRequest {
        serde_json::from_str(line).unwrap()
    }

    #[tokio::test]
    async fn call_without_host_is_unavailable() {
        let link = HostLink::new(Duration::from_secs(1));
        let err = link.call(HOST_TABS_GET, json!({"tabId": 1})).await.unwrap_err();
        assert_eq!(err.kind, BrowserErrorKind::HostUnavailable);
    }

    #[tokio::test]
    async fn reply_is_routed_to_the_caller() {
        let link = HostLink::new(Duration::from_secs(5));
        let (tx, mut rx) = mpsc::unbounded_channel();
        link.attach(1, tx).await;
        let browser = RemoteBrowser::new(Arc::clone(&link));

        let call = tokio::spawn(async move { browser.get_tab(TabId(5)).await });
        let request = request_of(&rx.recv().await.unwrap());
        assert_eq!(request.method, HOST_TABS_GET);
        assert_eq!(request.params, Some(json!({"tabId": 5})));

        let delivered = link
            .resolve(
                &request.id,
                Ok(json!({"id": 5, "windowId": 1, "url": "https://example.com", "active": true})),
            )
            .await;
        assert!(delivered);
        let tab = call.await.unwrap().unwrap();
        assert_eq!(tab.id, TabId(5));
        assert_eq!(tab.window_id, WindowId(1));
    }

    #[tokio::test]
    async fn host_error_messages_are_classified() {
        let link = HostLink::new(Duration::from_secs(5));
        let (tx, mut rx) = mpsc::unbounded_channel();
        link.attach(1, tx).await;
        let browser = RemoteBrowser::new(Arc::clone(&link));

        let call = tokio::spawn(async move { browser.activate_tab(TabId(5)).await });
        let request = request_of(&rx.recv().await.unwrap());
        assert_eq!(request.params, Some(json!({"tabId": 5, "active": true})));
        link.resolve(
            &request.id,
            Err(BrowserError::from_host_message(
                "Tabs cannot be edited right now (user may be dragging a tab).",
            )),
        )
        .await;
        assert!(call.await.unwrap().unwrap_err().is_dragging());
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_call_times_out() {
        let link = HostLink::new(Duration::from_millis(200));
        let (tx, _rx) = mpsc::unbounded_channel();
        link.attach(1, tx).await;
        let err = link
            .call(HOST_TABS_REMOVE, json!({"tabId": 3}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, BrowserErrorKind::Timeout);
        assert!(!link.resolve(&RequestId::Integer(1), Ok(Value::Null)).await);
    }

    #[tokio::test]
    async fn detach_fails_outstanding_calls() {
        let link = HostLink::new(Duration::from_secs(30));
        let (tx, mut rx) = mpsc::unbounded_channel();
        link.attach(9, tx).await;

        let caller = Arc::clone(&link);
        let call =
            tokio::spawn(async move { caller.call(HOST_TABS_GET, json!({"tabId": 1})).await });
        rx.recv().await.unwrap();

        link.detach(8).await;
        assert!(link.is_attached().await);
        link.detach(9).await;
        assert!(!link.is_attached().await);
        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.kind, BrowserErrorKind::HostUnavailable);
    }

    #[tokio::test(start_paused = true)]
    async fn detach_racing_a_call_being_registered_fails_it() {
        let link = HostLink::new(Duration::from_secs(30));
        let (tx, _rx) = mpsc::unbounded_channel();
        link.attach(1, tx).await;

        let pending = link.pending.lock().await;
        let caller = Arc::clone(&link);
        let call =
            tokio::spawn(async move { caller.call(HOST_TABS_GET, json!({"tabId": 1})).await });
        tokio::task::yield_now().await;
        let detacher = Arc::clone(&link);
        let detach = tokio::spawn(async move { detacher.detach(1).await });
        tokio::task::yield_now().await;
        drop(pending);

        detach.await.unwrap();
        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.kind, BrowserErrorKind::HostUnavailable);
        assert!(link.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn active_tab_query_is_scoped() {
        let link = HostLink::new(Duration::from_secs(5));
        let (tx, mut rx) = mpsc::unbounded_channel();
        link.attach(1, tx).await;
        let browser = RemoteBrowser::new(Arc::clone(&link));

        let call =
            tokio::spawn(async move { browser.active_tab(WindowScope::Window(WindowId(2))).await });
        let request = request_of(&rx.recv().await.unwrap());
        assert_eq!(request.method, HOST_TABS_QUERY);
        assert_eq!(request.params, Some(json!({"active": true, "windowId": 2})));
        link.resolve(&request.id, Ok(json!([]))).await;
        assert_eq!(call.await.unwrap().unwrap(), None);
    }

    #[tokio::test]
    async fn notify_requires_a_host() {
        let link = HostLink::new(Duration::from_secs(5));
        assert!(!link.notify(HOST_STORAGE_CHANGED, json!({"changes": {}})).await);

        let (tx, mut rx) = mpsc::unbounded_channel();
        link.attach(1, tx).await;
        assert!(link.notify(HOST_STORAGE_CHANGED, json!({"changes": {}})).await);
        let line: JsonRpcNotification = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(line.method, HOST_STORAGE_CHANGED);
    }
}
