// Public contracts for the Fanout task engine
// This crate defines the DTOs shared between the engine and its callers:
// task records, session wire types, and the message shapes returned by the
// remote session API. No logic lives here beyond small accessors.

pub mod message;
pub mod session;
pub mod task;

pub use message::*;
pub use session::*;
pub use task::*;
