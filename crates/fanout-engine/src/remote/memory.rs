//! In-memory implementation of [`SessionApi`] for testing
//!
//! Provides the same observable semantics as a real remote backend while
//! letting tests drive the interesting transitions directly: flip a session
//! idle, append assistant output, or inject failures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use fanout_contracts::{
    CreateSessionRequest, Message, MessagePart, PromptRequest, Role, SessionActivity,
};

use super::{ApiError, SessionApi};

struct SessionState {
    #[allow(dead_code)] // Stored for debugging parity with the real backend
    parent_id: String,
    title: String,
    activity: SessionActivity,
    messages: Vec<Message>,
}

/// In-memory session backend
///
/// # Example
///
/// ```
/// use fanout_engine::remote::InMemorySessionApi;
///
/// let api = InMemorySessionApi::new();
/// ```
#[derive(Default)]
pub struct InMemorySessionApi {
    sessions: RwLock<HashMap<String, SessionState>>,
    /// Every prompt ever sent, in order. Lets tests assert notification
    /// delivery without a real transport.
    prompts: RwLock<Vec<(String, PromptRequest)>>,
    create_error: RwLock<Option<ApiError>>,
    prompt_error: RwLock<Option<ApiError>>,
    next_id: AtomicUsize,
}

impl InMemorySessionApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session directly, bypassing `create_session`.
    pub fn seed_session(&self, session_id: impl Into<String>) {
        self.sessions.write().insert(
            session_id.into(),
            SessionState {
                parent_id: String::new(),
                title: String::new(),
                activity: SessionActivity::Idle,
                messages: Vec::new(),
            },
        );
    }

    /// Flip a session's reported activity.
    pub fn set_activity(&self, session_id: &str, activity: SessionActivity) {
        if let Some(state) = self.sessions.write().get_mut(session_id) {
            state.activity = activity;
        }
    }

    /// Append a message to a session's transcript.
    pub fn push_message(&self, session_id: &str, message: Message) {
        if let Some(state) = self.sessions.write().get_mut(session_id) {
            state.messages.push(message);
        }
    }

    /// Append a plain assistant text message.
    pub fn push_assistant_text(&self, session_id: &str, text: impl Into<String>) {
        self.push_message(
            session_id,
            Message::assistant(vec![MessagePart::Text { text: text.into() }]),
        );
    }

    /// All subsequent `create_session` calls fail with `err` until cleared.
    pub fn set_create_error(&self, err: Option<ApiError>) {
        *self.create_error.write() = err;
    }

    /// All subsequent `prompt` calls fail with `err` until cleared.
    pub fn set_prompt_error(&self, err: Option<ApiError>) {
        *self.prompt_error.write() = err;
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn contains_session(&self, session_id: &str) -> bool {
        self.sessions.read().contains_key(session_id)
    }

    pub fn session_title(&self, session_id: &str) -> Option<String> {
        self.sessions.read().get(session_id).map(|s| s.title.clone())
    }

    /// Prompts delivered to one session, in order.
    pub fn prompts_to(&self, session_id: &str) -> Vec<PromptRequest> {
        self.prompts
            .read()
            .iter()
            .filter(|(id, _)| id == session_id)
            .map(|(_, req)| req.clone())
            .collect()
    }

    pub fn prompt_count(&self) -> usize {
        self.prompts.read().len()
    }
}

#[async_trait]
impl SessionApi for InMemorySessionApi {
    async fn create_session(&self, req: CreateSessionRequest) -> Result<String, ApiError> {
        if let Some(err) = self.create_error.read().clone() {
            return Err(err);
        }

        let id = format!("sess-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        self.sessions.write().insert(
            id.clone(),
            SessionState {
                parent_id: req.parent_id,
                title: req.title,
                activity: SessionActivity::Idle,
                messages: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn prompt(&self, session_id: &str, req: PromptRequest) -> Result<(), ApiError> {
        if let Some(err) = self.prompt_error.read().clone() {
            return Err(err);
        }

        {
            let mut sessions = self.sessions.write();
            let state = sessions
                .get_mut(session_id)
                .ok_or_else(|| ApiError::Transport(format!("session not found: {session_id}")))?;

            // A work prompt starts the session's turn; notification prompts
            // (no_reply) do not.
            if !req.no_reply {
                state.activity = SessionActivity::Busy;
                state.messages.push(Message {
                    role: Role::User,
                    parts: vec![MessagePart::Text {
                        text: req.text.clone(),
                    }],
                });
            }
        }

        self.prompts.write().push((session_id.to_string(), req));
        Ok(())
    }

    async fn messages(&self, session_id: &str) -> Result<Vec<Message>, ApiError> {
        self.sessions
            .read()
            .get(session_id)
            .map(|s| s.messages.clone())
            .ok_or_else(|| ApiError::Transport(format!("session not found: {session_id}")))
    }

    async fn status(&self) -> Result<HashMap<String, SessionActivity>, ApiError> {
        Ok(self
            .sessions
            .read()
            .iter()
            .map(|(id, state)| (id.clone(), state.activity))
            .collect())
    }

    async fn reset_session(&self, session_id: &str) -> Result<(), ApiError> {
        let mut sessions = self.sessions.write();
        let state = sessions
            .get_mut(session_id)
            .ok_or_else(|| ApiError::Transport(format!("session not found: {session_id}")))?;
        state.messages.clear();
        state.activity = SessionActivity::Idle;
        Ok(())
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), ApiError> {
        self.sessions.write().remove(session_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_prompt() {
        let api = InMemorySessionApi::new();
        let id = api
            .create_session(CreateSessionRequest {
                parent_id: "parent".into(),
                title: "Fanout: demo".into(),
            })
            .await
            .unwrap();

        api.prompt(&id, PromptRequest::new("go")).await.unwrap();

        let status = api.status().await.unwrap();
        assert_eq!(status[&id], SessionActivity::Busy);
        assert_eq!(api.messages(&id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_silent_prompt_does_not_wake_session() {
        let api = InMemorySessionApi::new();
        api.seed_session("sess-a");

        api.prompt("sess-a", PromptRequest::silent("fyi"))
            .await
            .unwrap();

        let status = api.status().await.unwrap();
        assert_eq!(status["sess-a"], SessionActivity::Idle);
        assert!(api.messages("sess-a").await.unwrap().is_empty());
        assert_eq!(api.prompts_to("sess-a").len(), 1);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let api = InMemorySessionApi::new();
        api.seed_session("sess-a");
        api.delete_session("sess-a").await.unwrap();
        api.delete_session("sess-a").await.unwrap();
        assert!(!api.contains_session("sess-a"));
    }

    #[tokio::test]
    async fn test_injected_create_failure() {
        let api = InMemorySessionApi::new();
        api.set_create_error(Some(ApiError::Capacity("full".into())));

        let result = api
            .create_session(CreateSessionRequest {
                parent_id: "p".into(),
                title: "t".into(),
            })
            .await;
        assert!(matches!(result, Err(ApiError::Capacity(_))));
    }
}
