use serde::Serialize;

use crate::ids::{TabId, WindowId};

/// In-memory mirror of the lock.
///
/// `locked_tab_id` is present whenever `is_locked` is true and absent
/// otherwise. `locked_window_id` is a cache of the locked tab's window and
/// may be unresolved (for example right after a restart, before the host has
/// answered a tab lookup).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockState {
    pub is_locked: bool,
    pub locked_tab_id: Option<TabId>,
    pub locked_window_id: Option<WindowId>,
}

impl LockState {
    pub fn locked(tab_id: TabId, window_id: Option<WindowId>) -> Self {
        Self {
            is_locked: true,
            locked_tab_id: Some(tab_id),
            locked_window_id: window_id,
        }
    }

    pub fn unlocked() -> Self {
        Self::default()
    }

    /// The tab the engine is enforcing, if any.
    pub fn target(&self) -> Option<TabId> {
        if self.is_locked {
            self.locked_tab_id
        } else {
            None
        }
    }

    pub fn is_locked_on(&self, tab_id: TabId) -> bool {
        self.target() == Some(tab_id)
    }
}
