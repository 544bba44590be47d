//! In-memory backend for idcore.
//!
//! Implements the event log, projection tables and handler bookkeeping on
//! process memory. Every type is cheap to clone and clones share storage, so
//! one instance can be handed to the command side, the spooler and the query
//! side at once. Nothing survives the process; use `idcore-postgres` for
//! anything that must.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod projection;
mod state;
mod store;

pub use projection::InMemoryProjectionDb;
pub use state::InMemoryHandlerStateStore;
pub use store::InMemoryEventStore;
