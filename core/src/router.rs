//! Command router: intents from popup, modal and history surfaces.
//!
//! Intents arrive as JSON objects keyed by `action`. Every intent is
//! acknowledged with `success: true`; presentation-only intents are handed
//! to a background task so the caller never waits on the browser.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::browser::Tab;
use crate::engine::{Engine, SessionEndReason, TOGGLE_LOCK_COMMAND};
use crate::notify::Notification;
use crate::session::{HistoryStats, Note, Session, SessionError};
use crate::state::LockState;
use crate::store::StateUpdate;

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("malformed command: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Command {
    LockTab {
        tab: Tab,
    },
    UnlockTab,
    ToggleLock,
    /// Acknowledged only; the modal follows tab activation.
    RequestShowModal,
    ShowSessionNotes {
        #[serde(default)]
        notes: Vec<Note>,
    },
    CreateFloatingNotes,
    OpenHistory,
    #[serde(rename_all = "camelCase")]
    ShowUnlockNotification {
        #[serde(default)]
        has_notes: bool,
        duration_text: String,
    },
    ShowToast {
        message: String,
    },
    UpdateIcon {
        locked: bool,
    },
    GetLockState,
    /// Unlock from the focus modal: counts as a deliberate unlock.
    EndSession,
    AddNote {
        text: String,
    },
    DeleteNote {
        id: i64,
    },
    ClearHistory,
    #[serde(rename_all = "camelCase")]
    GetHistory {
        #[serde(default)]
        notes_only: bool,
    },
    MarkTutorialSeen {
        #[serde(default = "default_true")]
        seen: bool,
    },
}

fn default_true() -> bool {
    true
}

impl Command {
    pub fn from_json(value: serde_json::Value) -> Result<Self, RouterError> {
        Ok(serde_json::from_value(value)?)
    }

    /// Map a keyboard shortcut name to its intent.
    pub fn from_shortcut(name: &str) -> Option<Self> {
        (name == TOGGLE_LOCK_COMMAND).then_some(Command::ToggleLock)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryView {
    pub sessions: Vec<Session>,
    pub stats: HistoryStats,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<LockState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<Note>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<HistoryView>,
    /// Why the intent had no effect, when it did not.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CommandResponse {
    pub fn ack() -> Self {
        Self {
            success: true,
            state: None,
            note: None,
            history: None,
            detail: None,
        }
    }

    fn with_detail(detail: impl ToString) -> Self {
        Self {
            detail: Some(detail.to_string()),
            ..Self::ack()
        }
    }
}

#[derive(Clone)]
pub struct CommandRouter {
    engine: Engine,
}

impl CommandRouter {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    pub async fn dispatch(&self, command: Command) -> CommandResponse {
        debug!(?command, "dispatching command");
        let engine = &self.engine;
        match command {
            Command::LockTab { tab } => {
                engine.lock(tab).await;
                CommandResponse::ack()
            }
            Command::UnlockTab => {
                engine.unlock().await;
                CommandResponse::ack()
            }
            Command::ToggleLock => {
                engine.toggle_lock().await;
                CommandResponse::ack()
            }
            Command::RequestShowModal => CommandResponse::ack(),
            Command::ShowSessionNotes { notes } => {
                self.detach(move |engine| async move { engine.show_session_notes(notes).await });
                CommandResponse::ack()
            }
            Command::CreateFloatingNotes => {
                self.detach(|engine| async move { engine.show_floating_notes().await });
                CommandResponse::ack()
            }
            Command::OpenHistory => {
                self.detach(|engine| async move { engine.open_history().await });
                CommandResponse::ack()
            }
            Command::ShowUnlockNotification {
                has_notes,
                duration_text,
            } => {
                let notification = Notification::Unlocked {
                    has_notes,
                    duration_text,
                };
                self.detach(move |engine| async move { engine.notify_active_tab(notification).await });
                CommandResponse::ack()
            }
            Command::ShowToast { message } => {
                let notification = Notification::Toast { message };
                self.detach(move |engine| async move { engine.notify_active_tab(notification).await });
                CommandResponse::ack()
            }
            Command::UpdateIcon { locked } => {
                self.detach(move |engine| async move { engine.set_lock_indicator(locked).await });
                CommandResponse::ack()
            }
            Command::GetLockState => CommandResponse {
                state: Some(engine.snapshot().await),
                ..CommandResponse::ack()
            },
            Command::EndSession => {
                engine.end_session(SessionEndReason::UserUnlock).await;
                CommandResponse::ack()
            }
            Command::AddNote { text } => match engine.sessions().add_note(&text).await {
                Ok(note) => CommandResponse {
                    note: Some(note),
                    ..CommandResponse::ack()
                },
                Err(err) => note_failure(err),
            },
            Command::DeleteNote { id } => match engine.sessions().delete_note(id).await {
                Ok(()) => CommandResponse::ack(),
                Err(err) => note_failure(err),
            },
            Command::ClearHistory => match engine.sessions().clear_history().await {
                Ok(()) => CommandResponse::ack(),
                Err(err) => {
                    warn!(error = %err, "failed to clear history");
                    CommandResponse::with_detail(err)
                }
            },
            Command::GetHistory { notes_only } => {
                let sessions = engine.sessions().history_filtered(notes_only).await;
                let stats = engine.sessions().history_stats().await;
                match (sessions, stats) {
                    (Ok(sessions), Ok(stats)) => CommandResponse {
                        history: Some(HistoryView { sessions, stats }),
                        ..CommandResponse::ack()
                    },
                    (Err(err), _) | (_, Err(err)) => {
                        warn!(error = %err, "failed to read history");
                        CommandResponse::with_detail(err)
                    }
                }
            }
            Command::MarkTutorialSeen { seen } => {
                let update = StateUpdate::default().tutorial_seen(seen);
                match engine.storage().write(update).await {
                    Ok(()) => CommandResponse::ack(),
                    Err(err) => {
                        warn!(error = %err, "failed to store tutorial flag");
                        CommandResponse::with_detail(err)
                    }
                }
            }
        }
    }

    fn detach<F, Fut>(&self, task: F)
    where
        F: FnOnce(Engine) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.engine.spawn(task(self.engine.clone()));
    }
}

fn note_failure(err: SessionError) -> CommandResponse {
    match err {
        SessionError::Store(_) => warn!(error = %err, "note update failed"),
        _ => debug!(error = %err, "note update ignored"),
    }
    CommandResponse::with_detail(err)
}
