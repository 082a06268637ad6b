//! # Fanout Task Engine
//!
//! Fans work out to many independently executing remote agent sessions,
//! bounds how many run at once, detects their completion without a push
//! channel, and reclaims resources when they finish, fail or time out.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        TaskExecutor                          │
//! │        (launch / cancel / results / stats / shutdown)        │
//! └─────────────────────────────────────────────────────────────┘
//!        │                    │                       │
//!        ▼                    ▼                       ▼
//! ┌──────────────┐   ┌─────────────────┐   ┌───────────────────┐
//! │ Adaptive     │   │   SessionPool   │   │ TaskStore         │
//! │ Concurrency  │   │ (reuse, health, │   │ + TaskPoller      │
//! │ Controller   │   │  ceilings)      │   │ + TaskCleaner     │
//! └──────────────┘   └─────────────────┘   └───────────────────┘
//!                             │                       │
//!                             ▼                       ▼
//!                    ┌─────────────────────────────────────────┐
//!                    │           SessionApi (trait)            │
//!                    │  create / prompt / messages / status    │
//!                    └─────────────────────────────────────────┘
//! ```
//!
//! The remote API exposes no events, so a recurring poller infers
//! completion from session status and transcript stability, with a
//! validation gate that refuses to complete a task whose session produced
//! no usable output. Completions for one parent are batched into a single
//! notification once its last outstanding task finishes.
//!
//! [`deque`] and [`pool`] hold the scheduling and allocation primitives:
//! a Chase-Lev work-stealing deque hardened with real atomics, and
//! object/buffer/string pools with hit-rate statistics.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use fanout_engine::prelude::*;
//!
//! let api: Arc<dyn SessionApi> = Arc::new(InMemorySessionApi::new());
//! let engine = TaskExecutor::new(api, TaskEngineConfig::default());
//!
//! let task = engine
//!     .launch(LaunchRequest {
//!         work_type: "researcher".into(),
//!         parent_id: "parent-session".into(),
//!         description: "survey the code".into(),
//!         prompt: "List the main modules.".into(),
//!     })
//!     .await?;
//! ```

pub mod concurrency;
pub mod deque;
pub mod notify;
pub mod pool;
pub mod remote;
pub mod session;
pub mod task;
pub mod telemetry;

/// Prelude for common imports
pub mod prelude {
    pub use crate::concurrency::{AdaptiveConcurrencyConfig, AdaptiveConcurrencyController};
    pub use crate::deque::{Priority, Stealer, WorkItem, WorkStealingDeque};
    pub use crate::pool::{BufferPool, ObjectPool, Poolable, StringPool};
    pub use crate::remote::{ApiError, InMemorySessionApi, SessionApi};
    pub use crate::session::{PooledSession, SessionHealth, SessionPool, SessionPoolConfig};
    pub use crate::task::{
        CleanerConfig, LaunchError, PollerConfig, TaskEngineConfig, TaskExecutor, TaskStore,
    };
    pub use fanout_contracts::{LaunchRequest, Task, TaskStatus};
}

// Re-export key types at crate root
pub use concurrency::{AdaptiveConcurrencyConfig, AdaptiveConcurrencyController};
pub use deque::{Priority, Stealer, WorkItem, WorkStealingDeque};
pub use remote::{ApiError, InMemorySessionApi, SessionApi};
pub use session::{SessionPool, SessionPoolConfig, SessionPoolError};
pub use task::{LaunchError, TaskEngineConfig, TaskExecutor};

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
