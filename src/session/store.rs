use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::AskSlot;
use crate::types::ApiMessage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// Conversation memory for one user session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub user_id: String,
    pub session_id: String,
    #[serde(default)]
    pub messages: Vec<ApiMessage>,
    /// Questions asked last turn that still await an answer.
    #[serde(default)]
    pub pending_slots: Vec<AskSlot>,
    #[serde(default)]
    pub turn_count: u32,
    pub updated_at: DateTime<Utc>,
}

impl SessionState {
    pub fn new(user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
            messages: Vec::new(),
            pending_slots: Vec::new(),
            turn_count: 0,
            updated_at: Utc::now(),
        }
    }

    /// Appends one finished exchange.
    pub fn record_turn(
        &mut self,
        user_message: &str,
        reply: &str,
        pending_slots: Vec<AskSlot>,
    ) {
        self.messages.push(ApiMessage::user(user_message));
        if !reply.is_empty() {
            self.messages.push(ApiMessage::assistant(reply));
        }
        self.pending_slots = pending_slots;
        self.turn_count += 1;
        self.updated_at = Utc::now();
    }
}

/// Where sessions live between requests. Consulted before a stream starts
/// and after it ends, never while it is running.
pub trait SessionStore: Send + Sync {
    /// Returns the stored session, or a fresh one when none exists.
    fn get(&self, user_id: &str, session_id: &str) -> PipelineResult<SessionState>;
    fn save(&self, state: SessionState) -> PipelineResult<()>;
}

#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<(String, String), SessionState>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionStore for InMemorySessionStore {
    fn get(&self, user_id: &str, session_id: &str) -> PipelineResult<SessionState> {
        let sessions = self
            .sessions
            .lock()
            .map_err(|_| PipelineError::SessionStore("session map poisoned".to_string()))?;
        Ok(sessions
            .get(&(user_id.to_string(), session_id.to_string()))
            .cloned()
            .unwrap_or_else(|| SessionState::new(user_id, session_id)))
    }

    fn save(&self, state: SessionState) -> PipelineResult<()> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| PipelineError::SessionStore("session map poisoned".to_string()))?;
        sessions.insert((state.user_id.clone(), state.session_id.clone()), state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_session_starts_fresh() {
        let store = InMemorySessionStore::new();
        let state = store.get("u1", "s1").unwrap();
        assert_eq!(state.turn_count, 0);
        assert!(state.messages.is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn test_saved_session_round_trips_by_key() {
        let store = InMemorySessionStore::new();
        let mut state = store.get("u1", "s1").unwrap();
        state.record_turn("hi", "Hello!", Vec::new());
        store.save(state).unwrap();

        let loaded = store.get("u1", "s1").unwrap();
        assert_eq!(loaded.turn_count, 1);
        assert_eq!(loaded.messages.len(), 2);
        assert_eq!(store.get("u1", "other").unwrap().turn_count, 0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_empty_reply_records_only_the_user_message() {
        let mut state = SessionState::new("u1", "s1");
        state.record_turn("hi", "", Vec::new());
        assert_eq!(state.messages, vec![ApiMessage::user("hi")]);
    }
}
