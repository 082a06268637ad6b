//! Remote session API seam
//!
//! The engine drives opaque, remotely-executed sessions through a
//! request/poll contract: create, prompt, read messages, poll status. There
//! is no event push and no atomic "is this session done" read; completion is
//! inferred by the poller. Implementations over a real transport live
//! outside this crate; [`InMemorySessionApi`] ships here for tests and
//! local stubbing.

mod memory;

pub use memory::InMemorySessionApi;

use std::collections::HashMap;

use async_trait::async_trait;

use fanout_contracts::{CreateSessionRequest, Message, PromptRequest, SessionActivity};

/// Error type for remote session operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    /// The remote side refused for capacity reasons
    #[error("remote capacity exhausted: {0}")]
    Capacity(String),

    /// The call itself failed
    #[error("transport error: {0}")]
    Transport(String),
}

/// The remote session contract the engine consumes but does not implement.
#[async_trait]
pub trait SessionApi: Send + Sync {
    /// Create a new session under `parent_id`. Returns the opaque session id.
    async fn create_session(&self, req: CreateSessionRequest) -> Result<String, ApiError>;

    /// Send a prompt into a session. Ack only; the work proceeds remotely.
    async fn prompt(&self, session_id: &str, req: PromptRequest) -> Result<(), ApiError>;

    /// Ordered transcript of a session.
    async fn messages(&self, session_id: &str) -> Result<Vec<Message>, ApiError>;

    /// Activity snapshot for every known session.
    async fn status(&self) -> Result<HashMap<String, SessionActivity>, ApiError>;

    /// Clear a session's context so it can be reused for unrelated work.
    async fn reset_session(&self, session_id: &str) -> Result<(), ApiError>;

    /// Destroy a session. Deleting an already-gone session is not an error.
    async fn delete_session(&self, session_id: &str) -> Result<(), ApiError>;
}
