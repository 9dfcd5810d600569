//! Enforcement decisions.
//!
//! Each function maps the current lock state and one browser event to the
//! effects the engine should carry out, in order. Nothing here touches the
//! browser or the store.

use tokio::time::Instant;

use crate::browser::Tab;
use crate::ids::{TabId, WindowId};
use crate::retry::SwitchGuard;
use crate::state::LockState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Ask the locked tab's content script to show the focus modal.
    ShowModal { tab: TabId },
    /// Start a switch-back chain towards `target`.
    SwitchBack { target: TabId },
    RemoveTab { tab: TabId },
    FocusWindow { window: WindowId },
    ActivateTab { tab: TabId },
    RecordAttemptedSwitch,
    /// Show the modal only if `tab` is the active tab of `window`.
    ShowModalIfActive { window: WindowId, tab: TabId },
    /// The locked tab is gone; close the session and unlock.
    EndSession,
}

impl Effect {
    /// Failures of best-effort effects are logged and the batch continues.
    /// Failures of the others abort the remaining effects of the batch.
    pub fn is_best_effort(&self) -> bool {
        matches!(
            self,
            Effect::ShowModal { .. }
                | Effect::RemoveTab { .. }
                | Effect::RecordAttemptedSwitch
                | Effect::ShowModalIfActive { .. }
        )
    }

    /// A not-found failure of these means the locked tab or its window is
    /// gone for good.
    pub fn needs_locked_tab(&self) -> bool {
        matches!(self, Effect::FocusWindow { .. } | Effect::ActivateTab { .. })
    }
}

pub fn on_tab_activated(
    state: &LockState,
    guard: &SwitchGuard,
    now: Instant,
    activated: TabId,
) -> Vec<Effect> {
    let Some(target) = state.target() else {
        return Vec::new();
    };
    if activated == target {
        return vec![Effect::ShowModal { tab: target }];
    }
    if guard.should_debounce(now) {
        return Vec::new();
    }
    vec![
        Effect::SwitchBack { target },
        Effect::RecordAttemptedSwitch,
    ]
}

pub fn on_tab_created(state: &LockState, created: &Tab) -> Vec<Effect> {
    let Some(target) = state.target() else {
        return Vec::new();
    };
    if created.id == target {
        return Vec::new();
    }
    vec![
        Effect::RemoveTab { tab: created.id },
        Effect::ActivateTab { tab: target },
        Effect::RecordAttemptedSwitch,
    ]
}

pub fn on_window_focus_changed(state: &LockState, focused: WindowId) -> Vec<Effect> {
    if focused.is_none_sentinel() {
        return Vec::new();
    }
    let (Some(target), Some(locked_window)) = (state.target(), state.locked_window_id) else {
        return Vec::new();
    };
    if focused == locked_window {
        return vec![Effect::ShowModalIfActive {
            window: locked_window,
            tab: target,
        }];
    }
    vec![
        Effect::FocusWindow {
            window: locked_window,
        },
        Effect::ActivateTab { tab: target },
        Effect::RecordAttemptedSwitch,
    ]
}

pub fn on_tab_removed(state: &LockState, removed: TabId) -> Vec<Effect> {
    if state.is_locked_on(removed) {
        vec![Effect::EndSession]
    } else {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn locked() -> LockState {
        LockState::locked(TabId(5), Some(WindowId(1)))
    }

    fn idle_guard() -> SwitchGuard {
        SwitchGuard::new(Duration::from_millis(500))
    }

    #[tokio::test(start_paused = true)]
    async fn activating_another_tab_switches_back() {
        let effects = on_tab_activated(&locked(), &idle_guard(), Instant::now(), TabId(7));
        assert_eq!(
            effects,
            vec![
                Effect::SwitchBack { target: TabId(5) },
                Effect::RecordAttemptedSwitch
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn activating_the_locked_tab_shows_the_modal() {
        let effects = on_tab_activated(&locked(), &idle_guard(), Instant::now(), TabId(5));
        assert_eq!(effects, vec![Effect::ShowModal { tab: TabId(5) }]);
    }

    #[tokio::test(start_paused = true)]
    async fn activation_inside_debounce_window_is_dropped() {
        let start = Instant::now();
        let mut guard = idle_guard();
        guard.begin(start);
        let effects = on_tab_activated(
            &locked(),
            &guard,
            start + Duration::from_millis(200),
            TabId(7),
        );
        assert!(effects.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_happens_while_unlocked() {
        let state = LockState::unlocked();
        assert!(on_tab_activated(&state, &idle_guard(), Instant::now(), TabId(7)).is_empty());
        assert!(on_tab_created(&state, &Tab::new(TabId(9), WindowId(1))).is_empty());
        assert!(on_window_focus_changed(&state, WindowId(2)).is_empty());
        assert!(on_tab_removed(&state, TabId(5)).is_empty());
    }

    #[test]
    fn new_tabs_are_closed() {
        let effects = on_tab_created(&locked(), &Tab::new(TabId(9), WindowId(1)));
        assert_eq!(
            effects,
            vec![
                Effect::RemoveTab { tab: TabId(9) },
                Effect::ActivateTab { tab: TabId(5) },
                Effect::RecordAttemptedSwitch,
            ]
        );
    }

    #[test]
    fn focus_moves_back_to_the_locked_window() {
        assert_eq!(
            on_window_focus_changed(&locked(), WindowId(2)),
            vec![
                Effect::FocusWindow {
                    window: WindowId(1)
                },
                Effect::ActivateTab { tab: TabId(5) },
                Effect::RecordAttemptedSwitch,
            ]
        );
        assert_eq!(
            on_window_focus_changed(&locked(), WindowId(1)),
            vec![Effect::ShowModalIfActive {
                window: WindowId(1),
                tab: TabId(5)
            }]
        );
    }

    #[test]
    fn focus_leaving_the_browser_is_ignored() {
        assert!(on_window_focus_changed(&locked(), WindowId::NONE).is_empty());
    }

    #[test]
    fn unresolved_window_skips_focus_enforcement() {
        let state = LockState::locked(TabId(5), None);
        assert!(on_window_focus_changed(&state, WindowId(2)).is_empty());
    }

    #[test]
    fn closing_the_locked_tab_ends_the_session() {
        assert_eq!(on_tab_removed(&locked(), TabId(5)), vec![Effect::EndSession]);
        assert!(on_tab_removed(&locked(), TabId(6)).is_empty());
    }

    #[test]
    fn best_effort_classification() {
        assert!(Effect::RemoveTab { tab: TabId(1) }.is_best_effort());
        assert!(!Effect::ActivateTab { tab: TabId(1) }.is_best_effort());
        assert!(!Effect::FocusWindow { window: WindowId(1) }.is_best_effort());
    }
}
