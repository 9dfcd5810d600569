//! Focus sessions: the record of one lock episode, its notes and counters,
//! and the archive of completed sessions.
//!
//! All writes are read-modify-write cycles against the store. They are
//! serialized inside one process by `SessionManager::write_lock`; concurrent
//! writers in other processes can still race (last write wins).

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::browser::Tab;
use crate::clock::Clock;
use crate::ids::TabId;
use crate::notify;
use crate::store::{StateUpdate, Storage, StoreError};

/// Errors from session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no focus session is active")]
    NoActiveSession,

    #[error("note text is empty")]
    EmptyNote,

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub id: i64,
    pub text: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Creation time in epoch milliseconds, doubling as the identifier.
    pub id: i64,
    pub tab_id: TabId,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub favicon: Option<String>,
    pub start_time: i64,
    #[serde(default)]
    pub end_time: Option<i64>,
    #[serde(default)]
    pub attempted_switches: u32,
    #[serde(default)]
    pub notes: Vec<Note>,
    #[serde(default)]
    pub unlocks: u32,
}

impl Session {
    pub fn duration_ms(&self, now_ms: i64) -> i64 {
        self.end_time.unwrap_or(now_ms) - self.start_time
    }

    pub fn has_notes(&self) -> bool {
        !self.notes.is_empty()
    }
}

/// What `finalize` reports about the session it closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub session_id: i64,
    pub duration_ms: i64,
    pub attempted_switches: u32,
    pub note_count: usize,
}

impl SessionSummary {
    pub fn has_notes(&self) -> bool {
        self.note_count > 0
    }

    pub fn duration_text(&self) -> String {
        notify::duration_text(self.duration_ms)
    }
}

/// Aggregates over the completed-session archive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryStats {
    pub total_sessions: usize,
    pub total_time_ms: i64,
    pub total_unlocks: u64,
    pub total_attempts: u64,
}

impl HistoryStats {
    pub fn from_sessions(sessions: &[Session]) -> Self {
        sessions.iter().fold(Self::default(), |mut stats, session| {
            stats.total_sessions += 1;
            if let Some(end) = session.end_time {
                stats.total_time_ms += (end - session.start_time).max(0);
            }
            stats.total_unlocks += u64::from(session.unlocks);
            stats.total_attempts += u64::from(session.attempted_switches);
            stats
        })
    }
}

pub struct SessionManager {
    storage: Storage,
    clock: Arc<dyn Clock>,
    write_lock: Mutex<()>,
    /// Highest session id handed out so far.
    last_id: AtomicI64,
}

impl SessionManager {
    pub fn new(storage: Storage, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            clock,
            write_lock: Mutex::new(()),
            last_id: AtomicI64::new(i64::MIN),
        }
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Build a fresh session for `tab`. Persisting it is the caller's job,
    /// together with the lock keys. Ids are the start time, bumped past the
    /// previous id when two sessions start within the same millisecond.
    pub fn create_session(&self, tab: &Tab) -> Session {
        let now = self.clock.now_ms();
        let id = next_id(&self.last_id, now);
        Session {
            id,
            tab_id: tab.id,
            url: tab.url.clone(),
            title: tab.title.clone(),
            favicon: tab.fav_icon_url.clone(),
            start_time: now,
            end_time: None,
            attempted_switches: 0,
            notes: Vec::new(),
            unlocks: 0,
        }
    }

    pub async fn current(&self) -> Result<Option<Session>, StoreError> {
        self.storage.current_session().await
    }

    /// Append a note to the current session. Text is trimmed; blank text is
    /// rejected.
    pub async fn add_note(&self, text: &str) -> Result<Note, SessionError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SessionError::EmptyNote);
        }
        let _guard = self.write_lock.lock().await;
        let mut session = self
            .storage
            .current_session()
            .await?
            .ok_or(SessionError::NoActiveSession)?;

        let now = self.clock.now_ms();
        let id = match session.notes.iter().map(|n| n.id).max() {
            Some(last) if last >= now => last + 1,
            _ => now,
        };
        let note = Note {
            id,
            text: text.to_string(),
            timestamp: now,
        };
        session.notes.push(note.clone());
        self.storage
            .write(StateUpdate::default().current_session(Some(session)))
            .await?;
        debug!(note_id = note.id, "note added");
        Ok(note)
    }

    /// Remove a note by id. Unknown ids are a no-op.
    pub async fn delete_note(&self, note_id: i64) -> Result<(), SessionError> {
        let _guard = self.write_lock.lock().await;
        let mut session = self
            .storage
            .current_session()
            .await?
            .ok_or(SessionError::NoActiveSession)?;
        let before = session.notes.len();
        session.notes.retain(|n| n.id != note_id);
        if session.notes.len() == before {
            return Ok(());
        }
        self.storage
            .write(StateUpdate::default().current_session(Some(session)))
            .await?;
        Ok(())
    }

    /// Count one blocked switch attempt. Silently does nothing when no
    /// session is active.
    pub async fn record_attempted_switch(&self) -> Result<(), SessionError> {
        self.bump(|session| session.attempted_switches += 1).await
    }

    /// Count a deliberate unlock on the current session.
    pub async fn record_unlock(&self) -> Result<(), SessionError> {
        self.bump(|session| session.unlocks += 1).await
    }

    async fn bump(&self, update: impl FnOnce(&mut Session) + Send) -> Result<(), SessionError> {
        let _guard = self.write_lock.lock().await;
        let Some(mut session) = self.storage.current_session().await? else {
            return Ok(());
        };
        update(&mut session);
        self.storage
            .write(StateUpdate::default().current_session(Some(session)))
            .await?;
        Ok(())
    }

    /// Close the current session: stamp its end time, append it to the
    /// archive and clear it. With `user_unlock` the unlock counter is bumped
    /// first. Returns `None` when no session was active.
    pub async fn finalize(&self, user_unlock: bool) -> Result<Option<SessionSummary>, StoreError> {
        let _guard = self.write_lock.lock().await;
        let Some(mut session) = self.storage.current_session().await? else {
            return Ok(None);
        };
        let now = self.clock.now_ms();
        if user_unlock {
            session.unlocks += 1;
        }
        session.end_time = Some(now);

        let summary = SessionSummary {
            session_id: session.id,
            duration_ms: session.duration_ms(now),
            attempted_switches: session.attempted_switches,
            note_count: session.notes.len(),
        };

        let mut history = self.storage.history().await?;
        history.push(session);
        self.storage
            .write(
                StateUpdate::default()
                    .session_history(history)
                    .current_session(None),
            )
            .await?;

        info!(
            session_id = summary.session_id,
            duration = %notify::format_duration(summary.duration_ms),
            attempted_switches = summary.attempted_switches,
            notes = summary.note_count,
            "focus session finalized"
        );
        Ok(Some(summary))
    }

    /// Completed sessions, newest first.
    pub async fn history(&self) -> Result<Vec<Session>, StoreError> {
        let mut history = self.storage.history().await?;
        history.reverse();
        Ok(history)
    }

    /// Completed sessions, newest first, optionally only those with notes.
    pub async fn history_filtered(&self, notes_only: bool) -> Result<Vec<Session>, StoreError> {
        let mut history = self.history().await?;
        if notes_only {
            history.retain(Session::has_notes);
        }
        Ok(history)
    }

    pub async fn history_stats(&self) -> Result<HistoryStats, StoreError> {
        let history = self.storage.history().await?;
        Ok(HistoryStats::from_sessions(&history))
    }

    pub async fn clear_history(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.storage
            .write(StateUpdate::default().session_history(Vec::new()))
            .await
    }
}

fn next_id(last: &AtomicI64, now: i64) -> i64 {
    let bump = |prev: i64| prev.saturating_add(1).max(now);
    match last.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| Some(bump(prev))) {
        Ok(prev) | Err(prev) => bump(prev),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::WindowId;
    use crate::store::MemoryStore;
    use crate::testing::ManualClock;
    use pretty_assertions::assert_eq;

    fn manager() -> (SessionManager, Storage, Arc<ManualClock>) {
        let storage = Storage::new(Arc::new(MemoryStore::new()));
        let clock = Arc::new(ManualClock::new(1_000_000));
        (SessionManager::new(storage.clone(), clock.clone()), storage, clock)
    }

    async fn start(manager: &SessionManager, storage: &Storage) -> Session {
        let mut tab = Tab::new(TabId(5), WindowId(1));
        tab.url = Some("https://docs.rs/".to_string());
        tab.title = Some("Docs.rs".to_string());
        let session = manager.create_session(&tab);
        storage
            .write(
                StateUpdate::default()
                    .locked(tab.id)
                    .current_session(Some(session.clone())),
            )
            .await
            .unwrap();
        session
    }

    #[tokio::test]
    async fn create_session_copies_tab_metadata() {
        let (manager, storage, _clock) = manager();
        let session = start(&manager, &storage).await;
        assert_eq!(session.id, 1_000_000);
        assert_eq!(session.start_time, 1_000_000);
        assert_eq!(session.title.as_deref(), Some("Docs.rs"));
        assert_eq!(session.end_time, None);
        assert_eq!(session.attempted_switches, 0);
    }

    #[tokio::test]
    async fn sessions_started_in_the_same_millisecond_get_distinct_ids() {
        let (manager, _storage, _clock) = manager();
        let tab = Tab::new(TabId(5), WindowId(1));
        let first = manager.create_session(&tab);
        let second = manager.create_session(&Tab::new(TabId(8), WindowId(2)));
        assert_eq!(first.id, 1_000_000);
        assert_eq!(second.id, 1_000_001);
        assert_eq!(second.start_time, 1_000_000);
    }

    #[tokio::test]
    async fn note_add_then_delete_restores_notes() {
        let (manager, storage, clock) = manager();
        start(&manager, &storage).await;

        let kept = manager.add_note("  outline the intro ").await.unwrap();
        assert_eq!(kept.text, "outline the intro");
        clock.advance(10);
        let note = manager.add_note("check citations").await.unwrap();

        manager.delete_note(note.id).await.unwrap();
        let session = manager.current().await.unwrap().unwrap();
        assert_eq!(session.notes, vec![kept]);

        manager.delete_note(424242).await.unwrap();
        assert_eq!(manager.current().await.unwrap().unwrap().notes.len(), 1);
    }

    #[tokio::test]
    async fn notes_in_the_same_millisecond_get_distinct_ids() {
        let (manager, storage, _clock) = manager();
        start(&manager, &storage).await;
        let a = manager.add_note("one").await.unwrap();
        let b = manager.add_note("two").await.unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(b.id, a.id + 1);
    }

    #[tokio::test]
    async fn blank_notes_and_missing_sessions_are_rejected() {
        let (manager, storage, _clock) = manager();
        assert!(matches!(
            manager.add_note("hello").await,
            Err(SessionError::NoActiveSession)
        ));
        start(&manager, &storage).await;
        assert!(matches!(
            manager.add_note("   ").await,
            Err(SessionError::EmptyNote)
        ));
    }

    #[tokio::test]
    async fn counters_are_noops_without_a_session() {
        let (manager, _storage, _clock) = manager();
        manager.record_attempted_switch().await.unwrap();
        manager.record_unlock().await.unwrap();
        assert_eq!(manager.current().await.unwrap(), None);
        assert_eq!(manager.finalize(false).await.unwrap(), None);
    }

    #[tokio::test]
    async fn finalize_archives_and_clears() {
        let (manager, storage, clock) = manager();
        start(&manager, &storage).await;
        manager.record_attempted_switch().await.unwrap();
        manager.record_attempted_switch().await.unwrap();
        manager.add_note("draft").await.unwrap();
        clock.advance(25 * 60_000);

        let summary = manager.finalize(true).await.unwrap().unwrap();
        assert_eq!(summary.duration_ms, 25 * 60_000);
        assert_eq!(summary.attempted_switches, 2);
        assert!(summary.has_notes());
        assert_eq!(summary.duration_text(), "25m");

        assert_eq!(manager.current().await.unwrap(), None);
        let history = manager.history().await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].end_time, Some(1_000_000 + 25 * 60_000));
        assert_eq!(history[0].unlocks, 1);
    }

    #[tokio::test]
    async fn history_is_newest_first_with_stats_and_filter() {
        let (manager, storage, clock) = manager();

        start(&manager, &storage).await;
        manager.record_attempted_switch().await.unwrap();
        clock.advance(60_000);
        manager.finalize(false).await.unwrap();

        clock.advance(1_000);
        start(&manager, &storage).await;
        manager.add_note("remember this").await.unwrap();
        clock.advance(120_000);
        manager.finalize(true).await.unwrap();

        let history = manager.history().await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].start_time > history[1].start_time);

        let with_notes = manager.history_filtered(true).await.unwrap();
        assert_eq!(with_notes.len(), 1);
        assert_eq!(with_notes[0].notes[0].text, "remember this");

        assert_eq!(
            manager.history_stats().await.unwrap(),
            HistoryStats {
                total_sessions: 2,
                total_time_ms: 180_000,
                total_unlocks: 1,
                total_attempts: 1,
            }
        );

        manager.clear_history().await.unwrap();
        assert!(manager.history().await.unwrap().is_empty());
    }
}
