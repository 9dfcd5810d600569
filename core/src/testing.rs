//! Test doubles for the browser and the clock.
//!
//! Available to this crate's unit tests and, through the `testing` feature,
//! to integration tests of dependent crates.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::browser::{BrowserControl, BrowserError, BrowserErrorKind, Tab, WindowScope};
use crate::clock::Clock;
use crate::ids::{TabId, WindowId};
use crate::notify::{ContentMessage, ExtensionPage, Notification};

/// Settable clock.
#[derive(Debug)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(now_ms),
        }
    }

    pub fn advance(&self, ms: i64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Every call the engine made, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowserCall {
    GetTab(TabId),
    ActivateTab(TabId),
    RemoveTab(TabId),
    FocusWindow(WindowId),
    FocusedWindow,
    ActiveTab(WindowScope),
    SendToTab(TabId, ContentMessage),
    InjectContentScript(TabId),
    ShowNotification(TabId, Notification),
    OpenPage(ExtensionPage),
    SetLockIndicator(bool),
}

struct ActivationFailure {
    error: BrowserError,
    /// `None` fails forever.
    remaining: Option<usize>,
}

#[derive(Default)]
struct FakeState {
    tabs: BTreeMap<TabId, Tab>,
    focused: Option<WindowId>,
    calls: Vec<BrowserCall>,
    activation_failure: Option<ActivationFailure>,
}

/// In-memory browser with a tab table, a focused window and scriptable
/// activation failures.
#[derive(Default)]
pub struct FakeBrowser {
    state: Mutex<FakeState>,
}

impl FakeBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_tab(&self, tab: Tab) {
        self.state().tabs.insert(tab.id, tab);
    }

    /// Drop a tab without any event, as if it vanished behind our back.
    pub fn forget_tab(&self, tab_id: TabId) {
        self.state().tabs.remove(&tab_id);
    }

    pub fn tab(&self, tab_id: TabId) -> Option<Tab> {
        self.state().tabs.get(&tab_id).cloned()
    }

    /// Mark `tab_id` active in its window (and every sibling inactive).
    pub fn set_active(&self, tab_id: TabId) {
        mark_active(&mut self.state(), tab_id);
    }

    pub fn set_focused(&self, window_id: Option<WindowId>) {
        self.state().focused = window_id;
    }

    /// Make the next `times` activations fail with `error`; `None` means
    /// every activation until replaced.
    pub fn fail_activations(&self, error: BrowserError, times: Option<usize>) {
        self.state().activation_failure = Some(ActivationFailure {
            error,
            remaining: times,
        });
    }

    pub fn calls(&self) -> Vec<BrowserCall> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Activation attempts for `tab_id`, failed ones included.
    pub fn activations_of(&self, tab_id: TabId) -> usize {
        self.count(|call| *call == BrowserCall::ActivateTab(tab_id))
    }

    pub fn lookups_of(&self, tab_id: TabId) -> usize {
        self.count(|call| *call == BrowserCall::GetTab(tab_id))
    }

    fn count(&self, pred: impl Fn(&BrowserCall) -> bool) -> usize {
        self.state().calls.iter().filter(|call| pred(call)).count()
    }

    fn record(&self, call: BrowserCall) -> MutexGuard<'_, FakeState> {
        let mut state = self.state();
        state.calls.push(call);
        state
    }
}

fn mark_active(state: &mut FakeState, tab_id: TabId) -> bool {
    let Some(window_id) = state.tabs.get(&tab_id).map(|tab| tab.window_id) else {
        return false;
    };
    for tab in state.tabs.values_mut() {
        if tab.window_id == window_id {
            tab.active = tab.id == tab_id;
        }
    }
    true
}

fn take_failure(state: &mut FakeState) -> Option<BrowserError> {
    let failure = state.activation_failure.as_mut()?;
    let error = failure.error.clone();
    let exhausted = match &mut failure.remaining {
        None => false,
        Some(n) => {
            *n = n.saturating_sub(1);
            *n == 0
        }
    };
    if exhausted {
        state.activation_failure = None;
    }
    Some(error)
}

#[async_trait]
impl BrowserControl for FakeBrowser {
    async fn get_tab(&self, tab_id: TabId) -> Result<Tab, BrowserError> {
        let state = self.record(BrowserCall::GetTab(tab_id));
        state
            .tabs
            .get(&tab_id)
            .cloned()
            .ok_or_else(|| BrowserError::tab_not_found(tab_id))
    }

    async fn activate_tab(&self, tab_id: TabId) -> Result<(), BrowserError> {
        let mut state = self.record(BrowserCall::ActivateTab(tab_id));
        if let Some(error) = take_failure(&mut state) {
            return Err(error);
        }
        if mark_active(&mut state, tab_id) {
            Ok(())
        } else {
            Err(BrowserError::tab_not_found(tab_id))
        }
    }

    async fn remove_tab(&self, tab_id: TabId) -> Result<(), BrowserError> {
        let mut state = self.record(BrowserCall::RemoveTab(tab_id));
        state
            .tabs
            .remove(&tab_id)
            .map(|_| ())
            .ok_or_else(|| BrowserError::tab_not_found(tab_id))
    }

    async fn focus_window(&self, window_id: WindowId) -> Result<(), BrowserError> {
        let mut state = self.record(BrowserCall::FocusWindow(window_id));
        if !state.tabs.values().any(|tab| tab.window_id == window_id) {
            return Err(BrowserError::window_not_found(window_id));
        }
        state.focused = Some(window_id);
        Ok(())
    }

    async fn focused_window(&self) -> Result<Option<WindowId>, BrowserError> {
        let state = self.record(BrowserCall::FocusedWindow);
        Ok(state.focused)
    }

    async fn active_tab(&self, scope: WindowScope) -> Result<Option<Tab>, BrowserError> {
        let state = self.record(BrowserCall::ActiveTab(scope));
        let window_id = match scope {
            WindowScope::Current => state.focused,
            WindowScope::Window(window_id) => Some(window_id),
        };
        Ok(window_id.and_then(|window_id| {
            state
                .tabs
                .values()
                .find(|tab| tab.window_id == window_id && tab.active)
                .cloned()
        }))
    }

    async fn send_to_tab(
        &self,
        tab_id: TabId,
        message: ContentMessage,
    ) -> Result<(), BrowserError> {
        let state = self.record(BrowserCall::SendToTab(tab_id, message));
        if state.tabs.contains_key(&tab_id) {
            Ok(())
        } else {
            Err(BrowserError::new(
                BrowserErrorKind::Other,
                "Could not establish connection. Receiving end does not exist.",
            ))
        }
    }

    async fn inject_content_script(&self, tab_id: TabId) -> Result<(), BrowserError> {
        let state = self.record(BrowserCall::InjectContentScript(tab_id));
        if state.tabs.contains_key(&tab_id) {
            Ok(())
        } else {
            Err(BrowserError::tab_not_found(tab_id))
        }
    }

    async fn show_notification(
        &self,
        tab_id: TabId,
        notification: Notification,
    ) -> Result<(), BrowserError> {
        drop(self.record(BrowserCall::ShowNotification(tab_id, notification)));
        Ok(())
    }

    async fn open_page(&self, page: ExtensionPage) -> Result<(), BrowserError> {
        drop(self.record(BrowserCall::OpenPage(page)));
        Ok(())
    }

    async fn set_lock_indicator(&self, locked: bool) -> Result<(), BrowserError> {
        drop(self.record(BrowserCall::SetLockIndicator(locked)));
        Ok(())
    }
}
