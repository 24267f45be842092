use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use courier_core::{Message, SessionKey};

use crate::persist::SqlitePersister;
use crate::session::Session;

/// Thread-safe registry of live sessions keyed by `<channel>:<user_id>`.
///
/// The store exclusively owns its sessions; the persister is a subordinate
/// service invoked for write-through and hydration. Lock order is always
/// store registry lock, then (inside `Session`) the session lock.
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    persister: Mutex<Option<Arc<SqlitePersister>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            persister: Mutex::new(None),
        }
    }

    /// Install the durable backend and replay its stored sessions into memory.
    pub fn set_persister(&self, persister: Arc<SqlitePersister>) {
        match persister.load_all() {
            Ok(snapshots) => {
                let mut sessions = self.sessions.lock().unwrap();
                let count = snapshots.len();
                for snap in snapshots {
                    sessions
                        .entry(snap.key.clone())
                        .or_insert_with(|| Arc::new(Session::hydrate(snap)));
                }
                info!(count, "sessions restored from persister");
            }
            Err(e) => warn!(error = %e, "failed to restore sessions from persister"),
        }
        *self.persister.lock().unwrap() = Some(persister);
    }

    fn persister(&self) -> Option<Arc<SqlitePersister>> {
        self.persister.lock().unwrap().clone()
    }

    /// Atomic lookup-or-create. A newly created session is hydrated from the
    /// persister when a stored row for the key exists.
    pub fn get_or_create(&self, channel: &str, user_id: &str) -> Arc<Session> {
        let key = SessionKey::new(channel, user_id);
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(existing) = sessions.get(key.as_str()) {
            return Arc::clone(existing);
        }

        let session = match self
            .persister()
            .and_then(|p| p.load_session(key.as_str()).ok().flatten())
        {
            Some(snapshot) => Arc::new(Session::hydrate(snapshot)),
            None => Arc::new(Session::new(key.clone())),
        };
        sessions.insert(key.as_str().to_string(), Arc::clone(&session));
        session
    }

    /// Lookup without creation.
    pub fn get(&self, channel: &str, user_id: &str) -> Option<Arc<Session>> {
        let key = SessionKey::new(channel, user_id);
        self.sessions.lock().unwrap().get(key.as_str()).cloned()
    }

    /// Most recently active sessions, newest first.
    pub fn get_recent(&self, limit: usize) -> Vec<Arc<Session>> {
        let mut all: Vec<Arc<Session>> = self
            .sessions
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        all.sort_by_key(|s| std::cmp::Reverse(s.last_activity()));
        all.truncate(limit);
        all
    }

    pub fn count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// `get_or_create` + append + write-through. Persistence failures are
    /// logged, not propagated — durability is best-effort at runtime and
    /// guaranteed by the shutdown sweep.
    pub fn add_message_and_persist(
        &self,
        channel: &str,
        user_id: &str,
        message: Message,
    ) -> Arc<Session> {
        let session = self.get_or_create(channel, user_id);
        session.add_message(message);
        self.persist(&session);
        session
    }

    /// Write one session through to the persister (best-effort).
    pub fn persist(&self, session: &Arc<Session>) {
        let Some(persister) = self.persister() else {
            return;
        };
        let (messages, model, profile) = session.persistable();
        if let Err(e) = persister.save_session(
            session.key().as_str(),
            &messages,
            model.as_deref(),
            profile.as_deref(),
        ) {
            warn!(key = %session.key(), error = %e, "session write-through failed");
        }
    }

    /// Shutdown sweep: force-save every session that has messages.
    pub fn save_all(&self) {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        let mut saved = 0usize;
        for session in sessions {
            if !session.is_empty() {
                self.persist(&session);
                saved += 1;
            }
        }
        info!(saved, "session sweep complete");
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_create_is_stable() {
        let store = SessionStore::new();
        let a = store.get_or_create("telegram", "1");
        let b = store.get_or_create("telegram", "1");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(store.count(), 1);

        store.get_or_create("telegram", "2");
        assert_eq!(store.count(), 2);
    }

    #[test]
    fn get_does_not_create() {
        let store = SessionStore::new();
        assert!(store.get("telegram", "1").is_none());
        store.get_or_create("telegram", "1");
        assert!(store.get("telegram", "1").is_some());
    }

    #[test]
    fn add_message_orders_within_session() {
        let store = SessionStore::new();
        store.add_message_and_persist("telegram", "1", Message::user("telegram", "u", "first"));
        store.add_message_and_persist("telegram", "1", Message::assistant("telegram", "second"));

        let session = store.get("telegram", "1").unwrap();
        let messages = session.messages();
        assert_eq!(messages[0].text, "first");
        assert_eq!(messages[1].text, "second");
    }

    #[test]
    fn persister_replay_hydrates_store() {
        let persister = Arc::new(SqlitePersister::open_in_memory().unwrap());
        persister
            .save_session(
                "telegram:42",
                &[Message::user("telegram", "u", "old history")],
                Some("claude-haiku-4-5"),
                None,
            )
            .unwrap();

        let store = SessionStore::new();
        store.set_persister(persister);
        assert_eq!(store.count(), 1);

        let session = store.get("telegram", "42").unwrap();
        assert_eq!(session.len(), 1);
        assert_eq!(session.model().as_deref(), Some("claude-haiku-4-5"));
    }

    #[test]
    fn write_through_survives_fresh_store() {
        let persister = Arc::new(SqlitePersister::open_in_memory().unwrap());
        {
            let store = SessionStore::new();
            store.set_persister(Arc::clone(&persister));
            let s = store.add_message_and_persist(
                "telegram",
                "7",
                Message::user("telegram", "u", "hello"),
            );
            s.set_model(Some("claude-opus-4-6".to_string()));
            store.persist(&s);
        }

        let fresh = SessionStore::new();
        fresh.set_persister(persister);
        let session = fresh.get("telegram", "7").unwrap();
        assert_eq!(session.len(), 1);
        assert_eq!(session.model().as_deref(), Some("claude-opus-4-6"));
    }

    #[test]
    fn recent_orders_by_activity() {
        let store = SessionStore::new();
        store.add_message_and_persist("telegram", "1", Message::user("telegram", "u", "a"));
        std::thread::sleep(std::time::Duration::from_millis(5));
        store.add_message_and_persist("telegram", "2", Message::user("telegram", "u", "b"));

        let recent = store.get_recent(1);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].key().user_id(), "2");
    }
}
