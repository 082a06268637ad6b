//! Task lifecycle: store, poller, cleaner and the engine facade
//!
//! ```text
//! launch ──► AdaptiveConcurrencyController.acquire (may suspend)
//!        ──► SessionPool.acquire_immediate
//!        ──► TaskStore registers the record, remote prompt fires
//!                              │
//!                    TaskPoller (recurring tick)
//!            prune TTL ► sample status/transcript ► detect completion
//!                              │
//!                    TaskCleaner releases slot + session,
//!                    batches the parent notification,
//!                    deletes the record after the grace delay
//! ```

pub mod cleaner;
pub mod executor;
pub mod poller;
pub mod store;

pub use cleaner::{CleanerConfig, TaskCleaner, CANCELLED_ERROR, TIMEOUT_ERROR};
pub use executor::{EngineStats, LaunchError, TaskEngineConfig, TaskExecutor};
pub use poller::{PollerConfig, TaskPoller};
pub use store::{TaskNotice, TaskStore, TaskStoreStats, TerminalTransition};
