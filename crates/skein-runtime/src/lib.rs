//! # Durable Runtime
//!
//! The infrastructure half of the engine: everything the kernel defers
//! to its host.
//!
//! ```text
//! ┌──────────────┐   input    ┌──────────────┐  terminal   ┌────────────┐
//! │    broker    │──────────▶ │ EngineWorker │───────────▶ │   broker   │
//! │ (in-memory / │            │ (one advance │             │  (output)  │
//! │    Kafka)    │ ◀────────┐ │ per message) │             └────────────┘
//! └──────────────┘  re-emit │ └──────┬───────┘
//!        ▲                  │        │ scheduled (wait/retry)
//!        │                  │        ▼
//!        │           ┌──────┴─────────────┐
//!        └───────────│       outbox       │
//!          processor │ (Postgres, SKIP    │
//!                    │  LOCKED claiming)  │
//!                    └────────────────────┘
//! ```
//!
//! Listening continuations park in the in-process event bus instead of
//! the outbox and re-enter the input channel when a matching event is
//! emitted.

pub mod broker;
pub mod config;
pub mod consumer;
pub mod definitions;
pub mod events;
pub mod http;
pub mod outbox;

/// Prelude for common imports
pub mod prelude {
    pub use crate::broker::{
        in_memory_channel, Delivery, MessageConsumer, MessageProducer, TransportError,
    };
    pub use crate::config::{ConfigError, DatabaseKind, EngineConfig, MessagingKind};
    pub use crate::consumer::{EngineWorker, WorkerError};
    pub use crate::definitions::{
        DefinitionError, DefinitionStore, InMemoryDefinitionStore, PostgresDefinitionStore,
    };
    pub use crate::events::InProcessEventBus;
    pub use crate::http::HttpCaller;
    pub use crate::outbox::{
        InMemoryOutboxStore, OutboxEntry, OutboxError, OutboxJanitor, OutboxProcessor,
        OutboxStatus, OutboxStore, OutboxWorkerConfig, PostgresOutboxStore,
    };
}

pub use broker::{in_memory_channel, Delivery, MessageConsumer, MessageProducer, TransportError};
pub use config::{ConfigError, EngineConfig};
pub use consumer::{EngineWorker, WorkerError};
pub use definitions::{DefinitionStore, InMemoryDefinitionStore, PostgresDefinitionStore};
pub use events::InProcessEventBus;
pub use http::HttpCaller;
pub use outbox::{
    InMemoryOutboxStore, OutboxEntry, OutboxJanitor, OutboxProcessor, OutboxStore,
    OutboxWorkerConfig, PostgresOutboxStore,
};
