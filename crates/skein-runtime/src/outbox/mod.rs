//! Transactional outbox
//!
//! Scheduled continuations (waits, retries) are parked here until due,
//! then re-emitted to the broker. Claiming is exclusive per transaction
//! (skip-locked semantics) so concurrent processors never re-emit the
//! same row; delivery is at-least-once.

mod memory;
mod postgres;
mod processor;
mod store;

pub use memory::InMemoryOutboxStore;
pub use postgres::PostgresOutboxStore;
pub use processor::{OutboxJanitor, OutboxProcessor, OutboxWorkerConfig};
pub use store::{Dispatch, OutboxBatch, OutboxEntry, OutboxError, OutboxStatus, OutboxStore};
