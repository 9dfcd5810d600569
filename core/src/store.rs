//! Durable key-value state and change notification.
//!
//! The engine and the session manager talk to a [`StateStore`], a small
//! async key-value seam modeled on extension local storage: values are JSON,
//! writes are batched per call, and every write that actually changes a key
//! is broadcast to subscribers as a batch of [`StorageChange`]s.
//!
//! ## Layout
//!
//! ```text
//! ~/.local/share/flow/state.json
//!   {
//!     "isLocked": true,
//!     "lockedTabId": 42,
//!     "currentSession": { ... },
//!     "sessionHistory": [ ... ],
//!     "tutorialSeen": true
//!   }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};
use tokio::sync::{Mutex, broadcast};
use tracing::debug;

use crate::ids::{self, TabId};
use crate::session::Session;

const STATE_FILENAME: &str = "state.json";
const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Errors from the state store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("malformed value for `{key}`: {source}")]
    Malformed {
        key: StorageKey,
        #[source]
        source: serde_json::Error,
    },

    #[error("could not determine data directory")]
    NoDataDir,
}

/// Keys the store understands. The serialized names are the ones the
/// presentation layer reads.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, AsRefStr, EnumIter,
)]
#[strum(serialize_all = "camelCase")]
pub enum StorageKey {
    IsLocked,
    LockedTabId,
    CurrentSession,
    SessionHistory,
    /// Legacy history key, read only when `sessionHistory` is absent.
    FocusSessions,
    TutorialSeen,
}

impl StorageKey {
    pub fn is_lock_key(self) -> bool {
        matches!(self, StorageKey::IsLocked | StorageKey::LockedTabId)
    }
}

pub type StorageItems = BTreeMap<StorageKey, Value>;

#[derive(Debug, Clone, PartialEq)]
pub struct StorageChange {
    pub key: StorageKey,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read the given keys. Missing keys are simply absent from the result.
    async fn get(&self, keys: &[StorageKey]) -> Result<StorageItems, StoreError>;

    /// Write a batch. Keys whose value is unchanged produce no notification.
    async fn set(&self, items: StorageItems) -> Result<(), StoreError>;

    fn subscribe(&self) -> broadcast::Receiver<Vec<StorageChange>>;
}

fn merge(data: &mut StorageItems, items: StorageItems) -> Vec<StorageChange> {
    let mut changes = Vec::new();
    for (key, value) in items {
        if data.get(&key) == Some(&value) {
            continue;
        }
        let old_value = data.insert(key, value.clone());
        changes.push(StorageChange {
            key,
            old_value,
            new_value: Some(value),
        });
    }
    changes
}

fn select(data: &StorageItems, keys: &[StorageKey]) -> StorageItems {
    keys.iter()
        .filter_map(|key| data.get(key).map(|value| (*key, value.clone())))
        .collect()
}

// ── In-memory store ──────────────────────────────────────────────────────

/// Process-local store, used by tests and by hosts that persist elsewhere.
pub struct MemoryStore {
    data: Mutex<StorageItems>,
    changes: broadcast::Sender<Vec<StorageChange>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_items(StorageItems::new())
    }

    pub fn with_items(items: StorageItems) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            data: Mutex::new(items),
            changes,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, keys: &[StorageKey]) -> Result<StorageItems, StoreError> {
        let data = self.data.lock().await;
        Ok(select(&data, keys))
    }

    async fn set(&self, items: StorageItems) -> Result<(), StoreError> {
        let changes = {
            let mut data = self.data.lock().await;
            merge(&mut data, items)
        };
        if !changes.is_empty() {
            // No subscribers is fine.
            let _ = self.changes.send(changes);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Vec<StorageChange>> {
        self.changes.subscribe()
    }
}

// ── JSON file store ──────────────────────────────────────────────────────

/// Store backed by a single JSON document, rewritten atomically on every
/// effective write.
pub struct FileStore {
    path: PathBuf,
    data: Mutex<StorageItems>,
    changes: broadcast::Sender<Vec<StorageChange>>,
}

impl FileStore {
    /// Open (or lazily create) the store at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let data = load_document(&path)?;
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self {
            path,
            data: Mutex::new(data),
            changes,
        })
    }

    /// `~/.local/share/flow/state.json` (XDG data directory).
    pub fn default_path() -> Result<PathBuf, StoreError> {
        dirs::data_dir()
            .map(|dir| dir.join("flow").join(STATE_FILENAME))
            .ok_or(StoreError::NoDataDir)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn load_document(path: &Path) -> Result<StorageItems, StoreError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(StorageItems::new()),
        Err(e) => return Err(e.into()),
    };
    let doc: serde_json::Map<String, Value> = serde_json::from_str(&raw)?;
    let mut items = StorageItems::new();
    for (name, value) in doc {
        match name.parse::<StorageKey>() {
            Ok(key) => {
                items.insert(key, value);
            }
            Err(_) => debug!(key = %name, "ignoring unknown state key"),
        }
    }
    Ok(items)
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[async_trait]
impl StateStore for FileStore {
    async fn get(&self, keys: &[StorageKey]) -> Result<StorageItems, StoreError> {
        let data = self.data.lock().await;
        Ok(select(&data, keys))
    }

    async fn set(&self, items: StorageItems) -> Result<(), StoreError> {
        let changes = {
            let mut data = self.data.lock().await;
            let mut next = data.clone();
            let changes = merge(&mut next, items);
            if changes.is_empty() {
                return Ok(());
            }
            let doc: serde_json::Map<String, Value> = next
                .iter()
                .map(|(key, value)| (key.as_ref().to_string(), value.clone()))
                .collect();
            let json = serde_json::to_string_pretty(&doc)?;
            atomic_write(&self.path, json.as_bytes())?;
            *data = next;
            changes
        };
        let _ = self.changes.send(changes);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Vec<StorageChange>> {
        self.changes.subscribe()
    }
}

// ── Typed facade ─────────────────────────────────────────────────────────

/// Lock keys as persisted, after id canonicalization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistedLock {
    pub is_locked: bool,
    pub locked_tab_id: Option<TabId>,
}

/// A batch of typed writes, converted to JSON in one place.
#[derive(Debug, Clone, Default)]
pub struct StateUpdate {
    lock: Option<PersistedLock>,
    current_session: Option<Option<Session>>,
    session_history: Option<Vec<Session>>,
    tutorial_seen: Option<bool>,
}

impl StateUpdate {
    pub fn locked(mut self, tab_id: TabId) -> Self {
        self.lock = Some(PersistedLock {
            is_locked: true,
            locked_tab_id: Some(tab_id),
        });
        self
    }

    pub fn unlocked(mut self) -> Self {
        self.lock = Some(PersistedLock::default());
        self
    }

    pub fn current_session(mut self, session: Option<Session>) -> Self {
        self.current_session = Some(session);
        self
    }

    pub fn session_history(mut self, history: Vec<Session>) -> Self {
        self.session_history = Some(history);
        self
    }

    pub fn tutorial_seen(mut self, seen: bool) -> Self {
        self.tutorial_seen = Some(seen);
        self
    }

    fn into_items(self) -> Result<StorageItems, StoreError> {
        let mut items = StorageItems::new();
        if let Some(lock) = self.lock {
            items.insert(StorageKey::IsLocked, Value::Bool(lock.is_locked));
            items.insert(
                StorageKey::LockedTabId,
                serde_json::to_value(lock.locked_tab_id)?,
            );
        }
        if let Some(session) = self.current_session {
            items.insert(StorageKey::CurrentSession, serde_json::to_value(session)?);
        }
        if let Some(history) = self.session_history {
            items.insert(StorageKey::SessionHistory, serde_json::to_value(history)?);
        }
        if let Some(seen) = self.tutorial_seen {
            items.insert(StorageKey::TutorialSeen, Value::Bool(seen));
        }
        Ok(items)
    }
}

/// Typed access to the state keys, shared by the engine and the session
/// manager.
#[derive(Clone)]
pub struct Storage {
    store: Arc<dyn StateStore>,
}

impl Storage {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Vec<StorageChange>> {
        self.store.subscribe()
    }

    pub async fn load_lock(&self) -> Result<PersistedLock, StoreError> {
        let items = self
            .store
            .get(&[StorageKey::IsLocked, StorageKey::LockedTabId])
            .await?;
        Ok(PersistedLock {
            is_locked: items
                .get(&StorageKey::IsLocked)
                .and_then(Value::as_bool)
                .unwrap_or(false),
            locked_tab_id: ids::tab_id_from_value(items.get(&StorageKey::LockedTabId)),
        })
    }

    pub async fn current_session(&self) -> Result<Option<Session>, StoreError> {
        let items = self.store.get(&[StorageKey::CurrentSession]).await?;
        decode_optional(&items, StorageKey::CurrentSession)
    }

    /// Completed sessions, oldest first. Falls back to the legacy
    /// `focusSessions` key when `sessionHistory` has never been written.
    pub async fn history(&self) -> Result<Vec<Session>, StoreError> {
        let items = self
            .store
            .get(&[StorageKey::SessionHistory, StorageKey::FocusSessions])
            .await?;
        if let Some(history) = decode_optional(&items, StorageKey::SessionHistory)? {
            return Ok(history);
        }
        Ok(decode_optional(&items, StorageKey::FocusSessions)?.unwrap_or_default())
    }

    pub async fn tutorial_seen(&self) -> Result<bool, StoreError> {
        let items = self.store.get(&[StorageKey::TutorialSeen]).await?;
        Ok(items
            .get(&StorageKey::TutorialSeen)
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    pub async fn write(&self, update: StateUpdate) -> Result<(), StoreError> {
        let items = update.into_items()?;
        if items.is_empty() {
            return Ok(());
        }
        self.store.set(items).await
    }

    /// First-install defaults. Keys that already hold a value are kept.
    pub async fn install_defaults(&self) -> Result<(), StoreError> {
        let defaults = [
            (StorageKey::IsLocked, Value::Bool(false)),
            (StorageKey::LockedTabId, Value::Null),
            (StorageKey::CurrentSession, Value::Null),
            (StorageKey::SessionHistory, Value::Array(Vec::new())),
            (StorageKey::TutorialSeen, Value::Bool(false)),
        ];
        let keys: Vec<StorageKey> = defaults.iter().map(|(key, _)| *key).collect();
        let existing = self.store.get(&keys).await?;
        let missing: StorageItems = defaults
            .into_iter()
            .filter(|(key, _)| !existing.contains_key(key))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        self.store.set(missing).await
    }
}

fn decode_optional<T: DeserializeOwned>(
    items: &StorageItems,
    key: StorageKey,
) -> Result<Option<T>, StoreError> {
    match items.get(&key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|source| StoreError::Malformed { key, source }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn items(pairs: &[(StorageKey, Value)]) -> StorageItems {
        pairs.iter().cloned().collect()
    }

    #[test]
    fn storage_keys_use_camel_case_names() {
        assert_eq!(StorageKey::LockedTabId.as_ref(), "lockedTabId");
        assert_eq!(StorageKey::SessionHistory.to_string(), "sessionHistory");
        assert_eq!("tutorialSeen".parse::<StorageKey>().ok(), Some(StorageKey::TutorialSeen));
    }

    #[tokio::test]
    async fn memory_store_notifies_only_changed_keys() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe();

        store
            .set(items(&[
                (StorageKey::IsLocked, json!(true)),
                (StorageKey::LockedTabId, json!(5)),
            ]))
            .await
            .unwrap();
        let first = rx.recv().await.unwrap();
        assert_eq!(first.len(), 2);

        store
            .set(items(&[
                (StorageKey::IsLocked, json!(true)),
                (StorageKey::LockedTabId, json!(6)),
            ]))
            .await
            .unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(
            second,
            vec![StorageChange {
                key: StorageKey::LockedTabId,
                old_value: Some(json!(5)),
                new_value: Some(json!(6)),
            }]
        );

        store
            .set(items(&[(StorageKey::IsLocked, json!(true))]))
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(STATE_FILENAME);

        let store = FileStore::open(&path).unwrap();
        let storage = Storage::new(Arc::new(store));
        storage
            .write(StateUpdate::default().locked(TabId(9)).tutorial_seen(true))
            .await
            .unwrap();
        drop(storage);

        let reopened = Storage::new(Arc::new(FileStore::open(&path).unwrap()));
        assert_eq!(
            reopened.load_lock().await.unwrap(),
            PersistedLock {
                is_locked: true,
                locked_tab_id: Some(TabId(9)),
            }
        );
        assert!(reopened.tutorial_seen().await.unwrap());
    }

    #[tokio::test]
    async fn file_store_ignores_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STATE_FILENAME);
        std::fs::write(&path, r#"{"isLocked": false, "somethingElse": 1}"#).unwrap();

        let store = FileStore::open(&path).unwrap();
        let got = store
            .get(&[StorageKey::IsLocked, StorageKey::LockedTabId])
            .await
            .unwrap();
        assert_eq!(got, items(&[(StorageKey::IsLocked, json!(false))]));
    }

    #[tokio::test]
    async fn load_lock_canonicalizes_string_ids() {
        let store = MemoryStore::with_items(items(&[
            (StorageKey::IsLocked, json!(true)),
            (StorageKey::LockedTabId, json!("31")),
        ]));
        let storage = Storage::new(Arc::new(store));
        assert_eq!(
            storage.load_lock().await.unwrap().locked_tab_id,
            Some(TabId(31))
        );
    }

    #[tokio::test]
    async fn history_falls_back_to_legacy_key() {
        let legacy = json!([{
            "id": 1,
            "tabId": 3,
            "startTime": 1000,
            "endTime": 2000
        }]);
        let store = MemoryStore::with_items(items(&[(StorageKey::FocusSessions, legacy)]));
        let storage = Storage::new(Arc::new(store));

        let history = storage.history().await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].tab_id, TabId(3));
        assert_eq!(history[0].attempted_switches, 0);

        storage
            .write(StateUpdate::default().session_history(Vec::new()))
            .await
            .unwrap();
        assert!(storage.history().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_session_is_reported() {
        let store = MemoryStore::with_items(items(&[(
            StorageKey::CurrentSession,
            json!({"tabId": "not-a-tab"}),
        )]));
        let storage = Storage::new(Arc::new(store));
        let err = storage.current_session().await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Malformed {
                key: StorageKey::CurrentSession,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn install_defaults_keeps_existing_values() {
        let store = Arc::new(MemoryStore::with_items(items(&[(
            StorageKey::TutorialSeen,
            json!(true),
        )])));
        let storage = Storage::new(store.clone());
        storage.install_defaults().await.unwrap();

        assert!(storage.tutorial_seen().await.unwrap());
        assert_eq!(storage.load_lock().await.unwrap(), PersistedLock::default());
        assert!(storage.history().await.unwrap().is_empty());
    }
}
