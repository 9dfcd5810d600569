//! Messages the core sends towards the presentation layer.
//!
//! Content messages go to the in-page script of a specific tab; notifications
//! are rendered as transient toasts by whatever tab is active.

use serde::{Deserialize, Serialize};

use crate::session::Note;

/// Message delivered to the content script of one tab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ContentMessage {
    /// Display the focus modal over the locked tab.
    ShowModal,
    /// The lock on this tab has been released.
    TabUnlocked,
    ShowTutorial,
    DisplaySessionNotes {
        notes: Vec<Note>,
    },
    ShowFloatingNotes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Notification {
    Locked,
    #[serde(rename_all = "camelCase")]
    Unlocked {
        has_notes: bool,
        duration_text: String,
    },
    Toast {
        message: String,
    },
}

/// Pages bundled with the extension that the core can open in a new tab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExtensionPage {
    History,
}

impl ExtensionPage {
    pub fn path(self) -> &'static str {
        match self {
            ExtensionPage::History => "history.html",
        }
    }
}

/// Whole minutes for the unlock toast: `"Less than 1m"` under a minute.
pub fn duration_text(duration_ms: i64) -> String {
    let minutes = duration_ms.max(0) / 60_000;
    if minutes == 0 {
        "Less than 1m".to_string()
    } else {
        format!("{minutes}m")
    }
}

/// Human-readable elapsed time: `1h 5m`, `3m 20s` or `45s`.
pub fn format_duration(duration_ms: i64) -> String {
    let total_secs = duration_ms.max(0) / 1000;
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}
