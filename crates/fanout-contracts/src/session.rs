// Session wire types for the remote session API
//
// Session ids are opaque strings minted by the remote side; the engine never
// parses them.

use serde::{Deserialize, Serialize};

/// Request to create a remote session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    /// Session that asked for this one; completions are reported back to it.
    pub parent_id: String,
    pub title: String,
}

/// Request to send a prompt into a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptRequest {
    pub text: String,
    /// Suppress the receiving session's own response turn. Used for
    /// notifications that should not trigger the parent to answer.
    #[serde(default)]
    pub no_reply: bool,
}

impl PromptRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            no_reply: false,
        }
    }

    pub fn silent(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            no_reply: true,
        }
    }
}

/// Coarse activity state reported by the remote status endpoint
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionActivity {
    Idle,
    Busy,
}

impl std::fmt::Display for SessionActivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionActivity::Idle => write!(f, "idle"),
            SessionActivity::Busy => write!(f, "busy"),
        }
    }
}
