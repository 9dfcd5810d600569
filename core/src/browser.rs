//! Browser-control seam.
//!
//! Everything the engine asks of the browser goes through [`BrowserControl`].
//! Calls can fail; failures are classified into [`BrowserErrorKind`] once,
//! here, so enforcement code branches on kinds instead of message text.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::ids::{TabId, WindowId};
use crate::notify::{ContentMessage, ExtensionPage, Notification};

/// Snapshot of a browser tab as reported by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tab {
    pub id: TabId,
    pub window_id: WindowId,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, rename = "favIconUrl")]
    pub fav_icon_url: Option<String>,
    #[serde(default)]
    pub active: bool,
}

impl Tab {
    pub fn new(id: TabId, window_id: WindowId) -> Self {
        Self {
            id,
            window_id,
            url: None,
            title: None,
            fav_icon_url: None,
            active: false,
        }
    }
}

/// Which window an active-tab query is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WindowScope {
    /// The window the host considers current (last focused).
    Current,
    Window(WindowId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BrowserErrorKind {
    /// The user is dragging a tab; tab edits are refused until they drop it.
    TabDragging,
    /// The tab or window no longer exists.
    NotFound,
    /// No host is attached to carry the call.
    HostUnavailable,
    /// The host did not answer in time.
    Timeout,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct BrowserError {
    pub kind: BrowserErrorKind,
    pub message: String,
}

impl BrowserError {
    pub fn new(kind: BrowserErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Classify a raw error message reported by the host.
    pub fn from_host_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = if message.contains("dragging") {
            BrowserErrorKind::TabDragging
        } else if message.contains("No tab with id") || message.contains("No window with id") {
            BrowserErrorKind::NotFound
        } else {
            BrowserErrorKind::Other
        };
        Self { kind, message }
    }

    pub fn tab_not_found(tab_id: TabId) -> Self {
        Self::new(BrowserErrorKind::NotFound, format!("No tab with id: {tab_id}."))
    }

    pub fn window_not_found(window_id: WindowId) -> Self {
        Self::new(
            BrowserErrorKind::NotFound,
            format!("No window with id: {window_id}."),
        )
    }

    pub fn dragging() -> Self {
        Self::new(
            BrowserErrorKind::TabDragging,
            "Tabs cannot be edited right now (user may be dragging a tab).",
        )
    }

    pub fn host_unavailable() -> Self {
        Self::new(BrowserErrorKind::HostUnavailable, "no browser host attached")
    }

    pub fn timeout(method: &str) -> Self {
        Self::new(
            BrowserErrorKind::Timeout,
            format!("host did not answer `{method}` in time"),
        )
    }

    pub fn is_dragging(&self) -> bool {
        self.kind == BrowserErrorKind::TabDragging
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == BrowserErrorKind::NotFound
    }
}

#[async_trait]
pub trait BrowserControl: Send + Sync {
    async fn get_tab(&self, tab_id: TabId) -> Result<Tab, BrowserError>;

    /// Make the tab the active tab of its window.
    async fn activate_tab(&self, tab_id: TabId) -> Result<(), BrowserError>;

    async fn remove_tab(&self, tab_id: TabId) -> Result<(), BrowserError>;

    async fn focus_window(&self, window_id: WindowId) -> Result<(), BrowserError>;

    /// The last-focused browser window, if any.
    async fn focused_window(&self) -> Result<Option<WindowId>, BrowserError>;

    async fn active_tab(&self, scope: WindowScope) -> Result<Option<Tab>, BrowserError>;

    async fn send_to_tab(&self, tab_id: TabId, message: ContentMessage)
    -> Result<(), BrowserError>;

    /// Inject the focus-modal content script into the tab.
    async fn inject_content_script(&self, tab_id: TabId) -> Result<(), BrowserError>;

    async fn show_notification(
        &self,
        tab_id: TabId,
        notification: Notification,
    ) -> Result<(), BrowserError>;

    async fn open_page(&self, page: ExtensionPage) -> Result<(), BrowserError>;

    /// Toolbar lock indicator.
    async fn set_lock_indicator(&self, locked: bool) -> Result<(), BrowserError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn host_messages_are_classified() {
        let drag =
            BrowserError::from_host_message("Tabs cannot be edited right now (user may be dragging a tab).");
        assert_eq!(drag.kind, BrowserErrorKind::TabDragging);
        assert!(drag.is_dragging());

        let gone = BrowserError::from_host_message("No tab with id: 12.");
        assert_eq!(gone.kind, BrowserErrorKind::NotFound);
        let window = BrowserError::from_host_message("No window with id: 3.");
        assert!(window.is_not_found());

        let other = BrowserError::from_host_message("Cannot access a chrome:// URL");
        assert_eq!(other.kind, BrowserErrorKind::Other);
    }

    #[test]
    fn tab_accepts_host_shape() {
        let tab: Tab = serde_json::from_value(json!({
            "id": "8",
            "windowId": 2,
            "url": "https://example.com/",
            "title": "Example",
            "favIconUrl": "https://example.com/favicon.ico",
            "active": true,
            "pinned": false
        }))
        .unwrap();
        assert_eq!(tab.id, TabId(8));
        assert_eq!(tab.window_id, WindowId(2));
        assert_eq!(tab.fav_icon_url.as_deref(), Some("https://example.com/favicon.ico"));
        assert!(tab.active);
    }
}
