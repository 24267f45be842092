use std::sync::Mutex;

use chrono::{DateTime, Utc};

use courier_core::{Message, SessionKey};

use crate::types::{SessionSnapshot, Usage};

/// One in-memory conversation: ordered messages plus per-session overrides.
///
/// Every operation locks the single internal mutex, so callers never
/// synchronize externally. `messages()` returns a copied Vec so iteration
/// happens without the lock held.
pub struct Session {
    key: SessionKey,
    inner: Mutex<Inner>,
}

struct Inner {
    messages: Vec<Message>,
    model: Option<String>,
    profile: Option<String>,
    usage: Usage,
    last_activity: DateTime<Utc>,
}

impl Session {
    pub fn new(key: SessionKey) -> Self {
        Self {
            key,
            inner: Mutex::new(Inner {
                messages: Vec::new(),
                model: None,
                profile: None,
                usage: Usage::default(),
                last_activity: Utc::now(),
            }),
        }
    }

    /// Rebuild a session from a persisted snapshot.
    pub fn hydrate(snapshot: SessionSnapshot) -> Self {
        let last = snapshot
            .messages
            .last()
            .map(|m| m.timestamp)
            .unwrap_or_else(Utc::now);
        Self {
            key: SessionKey::from(snapshot.key),
            inner: Mutex::new(Inner {
                messages: snapshot.messages,
                model: snapshot.model,
                profile: snapshot.profile,
                usage: Usage::default(),
                last_activity: last,
            }),
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn add_message(&self, message: Message) {
        let mut inner = self.inner.lock().unwrap();
        inner.last_activity = message.timestamp;
        inner.messages.push(message);
    }

    /// Snapshot of the full history. Callers iterate without holding the lock.
    pub fn messages(&self) -> Vec<Message> {
        self.inner.lock().unwrap().messages.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reset the conversation: messages, model override, and profile are
    /// cleared together. Returns the number of messages removed.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let removed = inner.messages.len();
        inner.messages.clear();
        inner.model = None;
        inner.profile = None;
        inner.last_activity = Utc::now();
        removed
    }

    /// Swap in a compacted history. The caller is responsible for producing
    /// a list that preserves the conversation tail.
    pub fn replace_messages(&self, messages: Vec<Message>) {
        let mut inner = self.inner.lock().unwrap();
        inner.messages = messages;
    }

    pub fn model(&self) -> Option<String> {
        self.inner.lock().unwrap().model.clone()
    }

    pub fn set_model(&self, model: Option<String>) {
        self.inner.lock().unwrap().model = model;
    }

    pub fn profile(&self) -> Option<String> {
        self.inner.lock().unwrap().profile.clone()
    }

    pub fn set_profile(&self, profile: Option<String>) {
        self.inner.lock().unwrap().profile = profile;
    }

    pub fn usage(&self) -> Usage {
        self.inner.lock().unwrap().usage
    }

    /// Fold one turn's token counts into the lifetime aggregate.
    pub fn record_usage(&self, input_tokens: u64, output_tokens: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.usage.input_tokens += input_tokens;
        inner.usage.output_tokens += output_tokens;
        inner.usage.last_context_tokens = input_tokens;
    }

    pub fn record_compaction(&self) {
        self.inner.lock().unwrap().usage.compactions += 1;
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.inner.lock().unwrap().last_activity
    }

    /// Snapshot for persistence: (messages, model, profile) under one lock
    /// acquisition so the three stay mutually consistent.
    pub fn persistable(&self) -> (Vec<Message>, Option<String>, Option<String>) {
        let inner = self.inner.lock().unwrap();
        (
            inner.messages.clone(),
            inner.model.clone(),
            inner.profile.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(SessionKey::new("telegram", "123"))
    }

    #[test]
    fn append_and_snapshot() {
        let s = session();
        s.add_message(Message::user("telegram", "alice", "hi"));
        s.add_message(Message::assistant("telegram", "hello"));

        let snapshot = s.messages();
        assert_eq!(snapshot.len(), 2);
        assert!(!snapshot[0].is_bot);
        assert!(snapshot[1].is_bot);

        // The snapshot is a copy: mutating it does not affect the session.
        let mut owned = snapshot;
        owned.clear();
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn clear_resets_model_and_profile() {
        let s = session();
        s.add_message(Message::user("telegram", "alice", "hi"));
        s.set_model(Some("claude-opus-4-6".to_string()));
        s.set_profile(Some("pirate".to_string()));

        let removed = s.clear();
        assert_eq!(removed, 1);
        assert_eq!(s.len(), 0);
        assert_eq!(s.model(), None);
        assert_eq!(s.profile(), None);
    }

    #[test]
    fn usage_accumulates() {
        let s = session();
        s.record_usage(100, 20);
        s.record_usage(150, 30);
        s.record_compaction();

        let u = s.usage();
        assert_eq!(u.input_tokens, 250);
        assert_eq!(u.output_tokens, 50);
        assert_eq!(u.compactions, 1);
        assert_eq!(u.last_context_tokens, 150);
    }

    #[test]
    fn replace_messages_swaps_history() {
        let s = session();
        for i in 0..5 {
            s.add_message(Message::user("telegram", "alice", &format!("m{i}")));
        }
        let compacted = vec![Message::assistant("telegram", "[Summary]")];
        s.replace_messages(compacted);
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn hydrate_restores_state() {
        let snapshot = SessionSnapshot {
            key: "telegram:9".to_string(),
            messages: vec![Message::user("telegram", "bob", "hey")],
            model: Some("claude-haiku-4-5".to_string()),
            profile: None,
            updated_at: Utc::now().to_rfc3339(),
        };
        let s = Session::hydrate(snapshot);
        assert_eq!(s.key().as_str(), "telegram:9");
        assert_eq!(s.len(), 1);
        assert_eq!(s.model().as_deref(), Some("claude-haiku-4-5"));
    }
}
