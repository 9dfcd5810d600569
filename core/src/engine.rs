//! Lock enforcement engine.
//!
//! The engine owns the in-memory [`LockState`] mirror and the switch-back
//! guard, feeds browser events through [`crate::policy`] and executes the
//! resulting effects against a [`BrowserControl`]. Long-running work
//! (switch-back chains, delayed toasts, attempt counting) runs on a
//! [`TaskTracker`] so callers never wait on it; [`Engine::settle`] does.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::browser::{BrowserControl, BrowserError, Tab, WindowScope};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::ids::{TabId, WindowId};
use crate::notify::{ContentMessage, ExtensionPage, Notification};
use crate::policy::{self, Effect};
use crate::retry::{Backoff, SwitchGuard};
use crate::session::{Note, SessionManager};
use crate::state::LockState;
use crate::store::{StateStore, StateUpdate, Storage, StorageChange};

/// Keyboard shortcut name that toggles the lock.
pub const TOGGLE_LOCK_COMMAND: &str = "toggle-lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEndReason {
    /// The user unlocked from the modal or the popup.
    UserUnlock,
    /// The locked tab was closed.
    TabClosed,
    /// The locked tab disappeared without a close event (restart, crash).
    TabMissing,
}

impl SessionEndReason {
    fn shows_toast(self) -> bool {
        !matches!(self, SessionEndReason::TabMissing)
    }
}

struct EngineState {
    lock: LockState,
    guard: SwitchGuard,
}

struct Inner {
    browser: Arc<dyn BrowserControl>,
    storage: Storage,
    sessions: SessionManager,
    config: EngineConfig,
    state: Mutex<EngineState>,
    tasks: TaskTracker,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    pub fn new(
        browser: Arc<dyn BrowserControl>,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        let storage = Storage::new(store);
        let guard = SwitchGuard::new(config.debounce());
        Self {
            inner: Arc::new(Inner {
                browser,
                sessions: SessionManager::new(storage.clone(), clock),
                storage,
                config,
                state: Mutex::new(EngineState {
                    lock: LockState::unlocked(),
                    guard,
                }),
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.inner.sessions
    }

    pub fn storage(&self) -> &Storage {
        &self.inner.storage
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub async fn snapshot(&self) -> LockState {
        self.inner.state.lock().await.lock
    }

    pub async fn switch_back_in_progress(&self) -> bool {
        self.inner.state.lock().await.guard.in_progress()
    }

    /// Run `task` in the background, tracked by [`Engine::settle`].
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.tasks.spawn(task);
    }

    /// Wait until every background task (including ones spawned while
    /// waiting) has finished.
    pub async fn settle(&self) {
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.tasks.reopen();
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    pub async fn install_defaults(&self) {
        if let Err(err) = self.inner.storage.install_defaults().await {
            warn!(error = %err, "failed to write default state");
        }
    }

    /// Restore the lock from the store and verify the locked tab still
    /// exists.
    pub async fn initialize(&self) {
        let persisted = {
            let mut st = self.inner.state.lock().await;
            let persisted = match self.inner.storage.load_lock().await {
                Ok(persisted) => persisted,
                Err(err) => {
                    warn!(error = %err, "failed to load lock state");
                    return;
                }
            };
            st.lock = match (persisted.is_locked, persisted.locked_tab_id) {
                (true, Some(tab_id)) => LockState::locked(tab_id, None),
                _ => LockState::unlocked(),
            };
            if persisted.is_locked && persisted.locked_tab_id.is_none() {
                warn!("persisted lock has no tab id; clearing it");
                if let Err(err) = self.inner.storage.write(StateUpdate::default().unlocked()).await
                {
                    warn!(error = %err, "failed to clear lock state");
                }
            }
            persisted
        };

        let Some(tab_id) = persisted.locked_tab_id.filter(|_| persisted.is_locked) else {
            debug!("no lock to restore");
            return;
        };
        match self.inner.browser.get_tab(tab_id).await {
            Ok(tab) => {
                self.remember_window(tab_id, tab.window_id).await;
                self.set_lock_indicator(true).await;
                info!(tab_id = %tab_id, window_id = %tab.window_id, "restored lock");
            }
            Err(err) if err.is_not_found() => {
                info!(tab_id = %tab_id, "locked tab no longer exists; unlocking");
                self.end_session(SessionEndReason::TabMissing).await;
            }
            Err(err) => {
                warn!(tab_id = %tab_id, error = %err, "could not verify locked tab; keeping lock");
            }
        }
    }

    /// Mirror lock-key changes written by other contexts.
    pub async fn apply_store_change(&self, changes: &[StorageChange]) {
        if changes.iter().any(|change| change.key.is_lock_key()) {
            self.resync_lock_state().await;
        }
    }

    /// Follow the store's change notifications until the store goes away.
    pub fn spawn_store_listener(&self) -> JoinHandle<()> {
        let mut rx = self.inner.storage.subscribe();
        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(changes) => engine.apply_store_change(&changes).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "store change listener lagged; resyncing");
                        engine.resync_lock_state().await;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    async fn resync_lock_state(&self) {
        let resolve = {
            let mut st = self.inner.state.lock().await;
            let persisted = match self.inner.storage.load_lock().await {
                Ok(persisted) => persisted,
                Err(err) => {
                    warn!(error = %err, "failed to reload lock state");
                    return;
                }
            };
            let next = match (persisted.is_locked, persisted.locked_tab_id) {
                (true, Some(tab_id)) if st.lock.locked_tab_id == Some(tab_id) => st.lock,
                (true, Some(tab_id)) => LockState::locked(tab_id, None),
                (true, None) => {
                    warn!("store reports a lock without a tab id; ignoring");
                    st.lock
                }
                (false, _) => LockState::unlocked(),
            };
            if next != st.lock {
                debug!(?next, "lock state changed externally");
            }
            st.lock = next;
            next.target().filter(|_| next.locked_window_id.is_none())
        };
        if let Some(tab_id) = resolve {
            match self.inner.browser.get_tab(tab_id).await {
                Ok(tab) => self.remember_window(tab_id, tab.window_id).await,
                Err(err) => warn!(tab_id = %tab_id, error = %err, "could not resolve locked window"),
            }
        }
    }

    async fn remember_window(&self, tab_id: TabId, window_id: WindowId) {
        let mut st = self.inner.state.lock().await;
        if st.lock.is_locked_on(tab_id) {
            st.lock.locked_window_id = Some(window_id);
        }
    }

    // ── Lock / unlock ────────────────────────────────────────────────────

    pub async fn lock(&self, tab: Tab) {
        if self.snapshot().await.is_locked {
            match self.inner.sessions.finalize(false).await {
                Ok(Some(summary)) => {
                    debug!(session_id = summary.session_id, "closed previous session before relocking");
                }
                Ok(None) => {}
                Err(err) => warn!(error = %err, "failed to close previous session"),
            }
        }

        let session = self.inner.sessions.create_session(&tab);
        {
            let mut st = self.inner.state.lock().await;
            st.lock = LockState::locked(tab.id, Some(tab.window_id));
            let update = StateUpdate::default()
                .locked(tab.id)
                .current_session(Some(session));
            if let Err(err) = self.inner.storage.write(update).await {
                warn!(tab_id = %tab.id, error = %err, "failed to persist lock");
            }
        }
        info!(
            tab_id = %tab.id,
            window_id = %tab.window_id,
            url = tab.url.as_deref().unwrap_or_default(),
            "tab locked"
        );

        if let Err(err) = self.inner.browser.inject_content_script(tab.id).await {
            debug!(tab_id = %tab.id, error = %err, "content script injection failed");
        }
        self.set_lock_indicator(true).await;
        self.notify_active_tab(Notification::Locked).await;

        match self.inner.storage.tutorial_seen().await {
            Ok(true) => {}
            Ok(false) => {
                if let Err(err) = self
                    .inner
                    .browser
                    .send_to_tab(tab.id, ContentMessage::ShowTutorial)
                    .await
                {
                    debug!(tab_id = %tab.id, error = %err, "tutorial request not delivered");
                }
            }
            Err(err) => warn!(error = %err, "failed to read tutorial flag"),
        }
    }

    /// Release the lock. Does nothing at all when already unlocked.
    pub async fn unlock(&self) {
        let previous = {
            let mut st = self.inner.state.lock().await;
            if !st.lock.is_locked {
                debug!("unlock requested while unlocked");
                return;
            }
            let previous = std::mem::take(&mut st.lock);
            if let Err(err) = self.inner.storage.write(StateUpdate::default().unlocked()).await {
                warn!(error = %err, "failed to persist unlock");
            }
            previous
        };
        info!(tab_id = ?previous.locked_tab_id, "tab unlocked");

        if let Some(tab_id) = previous.locked_tab_id
            && let Err(err) = self
                .inner
                .browser
                .send_to_tab(tab_id, ContentMessage::TabUnlocked)
                .await
        {
            debug!(tab_id = %tab_id, error = %err, "unlock message not delivered");
        }
        self.set_lock_indicator(false).await;
    }

    /// Finalize the active session, unlock, and (after a short delay) tell
    /// the user how long the session lasted.
    pub async fn end_session(&self, reason: SessionEndReason) {
        let summary = match self
            .inner
            .sessions
            .finalize(reason == SessionEndReason::UserUnlock)
            .await
        {
            Ok(summary) => summary,
            Err(err) => {
                warn!(error = %err, ?reason, "failed to finalize session");
                None
            }
        };
        self.unlock().await;

        if reason.shows_toast()
            && let Some(summary) = summary
        {
            let engine = self.clone();
            let delay = self.inner.config.unlock_toast_delay();
            self.spawn(async move {
                sleep(delay).await;
                engine
                    .notify_active_tab(Notification::Unlocked {
                        has_notes: summary.has_notes(),
                        duration_text: summary.duration_text(),
                    })
                    .await;
            });
        }
    }

    /// Re-activate the locked tab, or lock the active tab when unlocked.
    pub async fn toggle_lock(&self) {
        if let Some(target) = self.snapshot().await.target() {
            if let Err(err) = self.inner.browser.activate_tab(target).await {
                debug!(tab_id = %target, error = %err, "could not re-activate locked tab");
            }
            return;
        }
        match self.inner.browser.active_tab(WindowScope::Current).await {
            Ok(Some(tab)) => self.lock(tab).await,
            Ok(None) => debug!("no active tab to lock"),
            Err(err) => warn!(error = %err, "could not query active tab"),
        }
    }

    pub async fn on_command(&self, command: &str) {
        match command {
            TOGGLE_LOCK_COMMAND => self.toggle_lock().await,
            other => debug!(command = other, "ignoring unknown command"),
        }
    }

    // ── Browser events ───────────────────────────────────────────────────

    pub async fn on_tab_activated(&self, tab_id: TabId) {
        let effects = {
            let mut st = self.inner.state.lock().await;
            let now = Instant::now();
            let effects = policy::on_tab_activated(&st.lock, &st.guard, now, tab_id);
            if effects
                .iter()
                .any(|effect| matches!(effect, Effect::SwitchBack { .. }))
            {
                st.guard.begin(now);
                info!(
                    from = ?st.lock.locked_tab_id,
                    to = %tab_id,
                    "blocked tab switch"
                );
            } else if st.lock.is_locked && effects.is_empty() {
                debug!(tab_id = %tab_id, "switch-back already running; event dropped");
            }
            effects
        };
        self.run_effects(effects).await;
    }

    pub async fn on_tab_created(&self, tab: Tab) {
        let effects = policy::on_tab_created(&self.snapshot().await, &tab);
        if !effects.is_empty() {
            info!(tab_id = %tab.id, "closing tab opened while locked");
        }
        self.run_effects(effects).await;
    }

    pub async fn on_window_focus_changed(&self, window_id: WindowId) {
        let state = self.snapshot().await;
        if !window_id.is_none_sentinel()
            && let Some(target) = state.target()
            && state.locked_window_id != Some(window_id)
            && !self.refresh_locked_window(target).await
        {
            return;
        }
        let effects = policy::on_window_focus_changed(&self.snapshot().await, window_id);
        self.run_effects(effects).await;
    }

    /// Re-read the window of the locked tab, since dragging a tab into another
    /// window raises no event we listen to. Returns false once the tab is
    /// gone and the session has been ended.
    async fn refresh_locked_window(&self, target: TabId) -> bool {
        match self.inner.browser.get_tab(target).await {
            Ok(tab) => {
                self.remember_window(target, tab.window_id).await;
                true
            }
            Err(err) if err.is_not_found() => {
                info!(tab_id = %target, "locked tab no longer exists; unlocking");
                self.end_session(SessionEndReason::TabMissing).await;
                false
            }
            Err(err) => {
                debug!(tab_id = %target, error = %err, "could not look up locked tab; using last known window");
                true
            }
        }
    }

    pub async fn on_tab_removed(&self, tab_id: TabId) {
        let effects = policy::on_tab_removed(&self.snapshot().await, tab_id);
        self.run_effects(effects).await;
    }

    async fn run_effects(&self, effects: Vec<Effect>) {
        for effect in effects {
            if let Err(err) = self.apply_effect(effect).await {
                if effect.is_best_effort() {
                    debug!(?effect, error = %err, "best-effort step failed");
                    continue;
                }
                if err.is_not_found() && effect.needs_locked_tab() {
                    info!(?effect, error = %err, "locked tab or window is gone; unlocking");
                    self.end_session(SessionEndReason::TabMissing).await;
                    break;
                }
                warn!(?effect, error = %err, "enforcement step failed; skipping the rest");
                break;
            }
        }
    }

    async fn apply_effect(&self, effect: Effect) -> Result<(), BrowserError> {
        let browser = &self.inner.browser;
        match effect {
            Effect::ShowModal { tab } => browser.send_to_tab(tab, ContentMessage::ShowModal).await,
            Effect::SwitchBack { target } => {
                let engine = self.clone();
                self.spawn(async move { engine.switch_back(target).await });
                Ok(())
            }
            Effect::RemoveTab { tab } => browser.remove_tab(tab).await,
            Effect::FocusWindow { window } => browser.focus_window(window).await,
            Effect::ActivateTab { tab } => browser.activate_tab(tab).await,
            Effect::RecordAttemptedSwitch => {
                let engine = self.clone();
                self.spawn(async move {
                    if let Err(err) = engine.inner.sessions.record_attempted_switch().await {
                        warn!(error = %err, "failed to record attempted switch");
                    }
                });
                Ok(())
            }
            Effect::ShowModalIfActive { window, tab } => {
                match browser.active_tab(WindowScope::Window(window)).await? {
                    Some(active) if active.id == tab => {
                        browser.send_to_tab(tab, ContentMessage::ShowModal).await
                    }
                    _ => Ok(()),
                }
            }
            Effect::EndSession => {
                self.end_session(SessionEndReason::TabClosed).await;
                Ok(())
            }
        }
    }

    // ── Switch-back ──────────────────────────────────────────────────────

    async fn switch_back(self, target: TabId) {
        self.run_switch_back(target).await;
        self.inner.state.lock().await.guard.finish();
    }

    async fn run_switch_back(&self, target: TabId) {
        let browser = &self.inner.browser;
        let tab = match browser.get_tab(target).await {
            Ok(tab) => tab,
            Err(err) if err.is_not_found() => {
                info!(tab_id = %target, "locked tab no longer exists; unlocking");
                self.end_session(SessionEndReason::TabMissing).await;
                return;
            }
            Err(err) => {
                warn!(tab_id = %target, error = %err, "could not look up locked tab; abandoning switch-back");
                return;
            }
        };
        self.remember_window(target, tab.window_id).await;

        let mut backoff = Backoff::from_config(&self.inner.config);
        loop {
            match self.focus_and_activate(&tab).await {
                Ok(()) => {
                    if let Err(err) = browser.focus_window(tab.window_id).await {
                        debug!(window_id = %tab.window_id, error = %err, "could not refocus window");
                    }
                    debug!(tab_id = %target, retries = backoff.attempt(), "returned to locked tab");
                    return;
                }
                Err(err) if err.is_dragging() => {
                    let delay = backoff.next_delay();
                    debug!(
                        tab_id = %target,
                        attempt = backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        "tab drag in progress; retrying switch-back"
                    );
                    sleep(delay).await;
                    if !self.snapshot().await.is_locked_on(target) {
                        debug!(tab_id = %target, "lock released or moved; stopping retry");
                        return;
                    }
                }
                Err(err) if err.is_not_found() => {
                    info!(tab_id = %target, error = %err, "locked tab or window is gone; unlocking");
                    self.end_session(SessionEndReason::TabMissing).await;
                    return;
                }
                Err(err) => {
                    warn!(tab_id = %target, error = %err, "switch-back failed; trying window-first fallback");
                    self.fallback_switch_back(&tab).await;
                    return;
                }
            }
        }
    }

    async fn focus_and_activate(&self, tab: &Tab) -> Result<(), BrowserError> {
        let browser = &self.inner.browser;
        let focused = match browser.focused_window().await {
            Ok(focused) => focused,
            Err(err) => {
                debug!(error = %err, "could not query focused window");
                None
            }
        };
        if focused != Some(tab.window_id)
            && let Err(err) = browser.focus_window(tab.window_id).await
        {
            debug!(window_id = %tab.window_id, error = %err, "could not focus window");
        }
        browser.activate_tab(tab.id).await
    }

    async fn fallback_switch_back(&self, tab: &Tab) {
        let browser = &self.inner.browser;
        if let Err(err) = browser.focus_window(tab.window_id).await {
            debug!(window_id = %tab.window_id, error = %err, "fallback focus failed");
        }
        sleep(self.inner.config.fallback_delay()).await;
        match browser.activate_tab(tab.id).await {
            Ok(()) => debug!(tab_id = %tab.id, "returned to locked tab via window focus"),
            Err(err) => warn!(tab_id = %tab.id, error = %err, "fallback switch-back failed"),
        }
    }

    // ── Presentation ─────────────────────────────────────────────────────

    /// Show `notification` in the active tab of the current window.
    pub async fn notify_active_tab(&self, notification: Notification) {
        let browser = &self.inner.browser;
        match browser.active_tab(WindowScope::Current).await {
            Ok(Some(tab)) => {
                if let Err(err) = browser.show_notification(tab.id, notification).await {
                    debug!(tab_id = %tab.id, error = %err, "notification not shown");
                }
            }
            Ok(None) => debug!("no active tab for notification"),
            Err(err) => debug!(error = %err, "could not query active tab"),
        }
    }

    /// Forward notes to the active tab for display.
    pub async fn show_session_notes(&self, notes: Vec<Note>) {
        let browser = &self.inner.browser;
        match browser.active_tab(WindowScope::Current).await {
            Ok(Some(tab)) => {
                if let Err(err) = browser
                    .send_to_tab(tab.id, ContentMessage::DisplaySessionNotes { notes })
                    .await
                {
                    debug!(tab_id = %tab.id, error = %err, "session notes not delivered");
                }
            }
            Ok(None) => debug!("no active tab for session notes"),
            Err(err) => debug!(error = %err, "could not query active tab"),
        }
    }

    /// Ask the locked tab to show the floating notes widget.
    pub async fn show_floating_notes(&self) {
        let Some(tab_id) = self.snapshot().await.target() else {
            debug!("floating notes requested while unlocked");
            return;
        };
        if let Err(err) = self
            .inner
            .browser
            .send_to_tab(tab_id, ContentMessage::ShowFloatingNotes)
            .await
        {
            debug!(tab_id = %tab_id, error = %err, "floating notes request not delivered");
        }
    }

    pub async fn open_history(&self) {
        if let Err(err) = self.inner.browser.open_page(ExtensionPage::History).await {
            warn!(error = %err, "could not open history page");
        }
    }

    pub async fn set_lock_indicator(&self, locked: bool) {
        if let Err(err) = self.inner.browser.set_lock_indicator(locked).await {
            debug!(locked, error = %err, "could not update lock indicator");
        }
    }
}
