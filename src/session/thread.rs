//! Conversation thread and session storage.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::llm::{Message, MessageRole};

/// A single conversation thread.
///
/// Holds the message history of one thread. The system prompt is kept
/// separately so a reloaded prompt applies to existing threads.
#[derive(Debug, Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

#[derive(Debug)]
struct SessionInner {
    id: String,
    messages: RwLock<Vec<Message>>,
    system_prompt: RwLock<Option<String>>,
}

impl Session {
    fn new(id: String) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id,
                messages: RwLock::new(Vec::new()),
                system_prompt: RwLock::new(None),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn set_system_prompt(&self, prompt: impl Into<String>) {
        let mut guard = self
            .inner
            .system_prompt
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *guard = Some(prompt.into());
    }

    #[must_use]
    pub fn system_prompt(&self) -> Option<String> {
        self.inner
            .system_prompt
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn add_message(&self, message: Message) {
        self.extend([message]);
    }

    /// Append messages in order under one lock.
    pub fn extend(&self, messages: impl IntoIterator<Item = Message>) {
        let mut guard = self
            .inner
            .messages
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        guard.extend(messages);
    }

    #[must_use]
    pub fn messages(&self) -> Vec<Message> {
        self.inner
            .messages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// History prefixed with the system prompt, ready for the model.
    #[must_use]
    pub fn messages_with_system(&self) -> Vec<Message> {
        let mut result = Vec::new();
        if let Some(prompt) = self.system_prompt() {
            result.push(Message::system(prompt));
        }
        result.extend(self.messages());
        result
    }

    #[must_use]
    pub fn message_count(&self) -> usize {
        self.inner
            .messages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Number of user messages, i.e. completed exchanges.
    #[must_use]
    pub fn exchange_count(&self) -> usize {
        self.inner
            .messages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|m| m.role == MessageRole::User)
            .count()
    }
}

/// Thread-safe store of conversation threads keyed by thread id.
#[derive(Debug, Clone, Default)]
pub struct SessionStore {
    inner: Arc<RwLock<HashMap<String, Session>>>,
}

impl SessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Session> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    #[must_use]
    pub fn get_or_create(&self, id: &str) -> Session {
        if let Some(session) = self.get(id) {
            return session;
        }
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        guard
            .entry(id.to_string())
            .or_insert_with(|| Session::new(id.to_string()))
            .clone()
    }

    /// Drop every thread.
    pub fn clear(&self) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_lifecycle() {
        let session = Session::new("test-123".to_string());

        assert_eq!(session.id(), "test-123");
        assert_eq!(session.message_count(), 0);

        session.add_message(Message::user("Hello"));
        session.extend([Message::assistant("Hi there!")]);
        assert_eq!(session.message_count(), 2);
        assert_eq!(session.exchange_count(), 1);

        let messages = session.messages();
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[1].role, MessageRole::Assistant);
    }

    #[test]
    fn test_session_store() {
        let store = SessionStore::new();
        assert!(store.is_empty());

        let session = store.get_or_create("a");
        assert_eq!(session.id(), "a");
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("a").map(|s| s.id().to_string()).as_deref(), Some("a"));
        assert!(store.get("b").is_none());

        let same = store.get_or_create("a");
        same.add_message(Message::user("shared"));
        assert_eq!(session.message_count(), 1);

        store.get_or_create("b");
        assert_eq!(store.len(), 2);
        store.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn test_system_prompt() {
        let session = Session::new("test".to_string());
        assert!(session.system_prompt().is_none());

        session.set_system_prompt("You are a helpful assistant.");
        session.add_message(Message::user("hi"));

        let messages = session.messages_with_system();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::System);
        assert_eq!(messages[0].content, "You are a helpful assistant.");
    }
}
