//! OutboxStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use skein_core::Message;

/// Error type for outbox operations
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    /// Entry not found
    #[error("outbox entry not found: {0}")]
    NotFound(Uuid),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Status of an outbox row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Waiting to be re-emitted once due
    Pending,

    /// Successfully re-emitted to the broker
    Sent,

    /// Explicitly marked failed by an operator
    Failed,
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Sent => write!(f, "sent"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A scheduled message at rest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Time-ordered id
    pub id: Uuid,

    /// Serialized continuation message
    pub payload: serde_json::Value,

    pub status: OutboxStatus,

    /// Instant the row becomes due
    pub delayed_until: DateTime<Utc>,

    /// Re-emit attempts consumed so far
    pub attempt_count: i32,

    /// Last re-emit failure, for inspection
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl OutboxEntry {
    /// Schedule a message `delay` from `now`
    pub fn schedule(
        message: &Message,
        delay: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<Self, OutboxError> {
        let payload =
            serde_json::to_value(message).map_err(|e| OutboxError::Serialization(e.to_string()))?;
        Ok(Self {
            id: Uuid::now_v7(),
            payload,
            status: OutboxStatus::Pending,
            delayed_until: now + delay,
            attempt_count: 0,
            last_error: None,
            created_at: now,
        })
    }

    /// Decode the payload back into a message
    pub fn message(&self) -> Result<Message, OutboxError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| OutboxError::Serialization(e.to_string()))
    }
}

/// Result of one processing pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutboxBatch {
    /// Rows claimed this pass
    pub claimed: usize,

    /// Rows re-emitted and marked sent
    pub sent: usize,

    /// Rows whose dispatch failed (attempt recorded, still pending)
    pub failed: usize,
}

/// Dispatch callback invoked for each claimed row
///
/// Runs while the claiming transaction still holds the row; returning
/// `Err` records the attempt and leaves the row pending. The future is
/// `'static`: the entry is owned and transports are shared handles.
pub type Dispatch<'a> =
    &'a (dyn Fn(OutboxEntry) -> BoxFuture<'static, Result<(), String>> + Send + Sync);

/// Durable store of scheduled messages
///
/// Implementations must be safe for many concurrent processors: a due
/// row is claimed by at most one `process_due` call at a time.
#[async_trait]
pub trait OutboxStore: Send + Sync + 'static {
    /// Insert entries; already-present ids are ignored (idempotent)
    async fn insert(&self, entries: &[OutboxEntry]) -> Result<(), OutboxError>;

    /// Overwrite entries by id
    async fn update(&self, entries: &[OutboxEntry]) -> Result<(), OutboxError>;

    /// Delete entries by id
    async fn delete(&self, ids: &[Uuid]) -> Result<(), OutboxError>;

    /// Fetch one entry
    async fn get(&self, id: Uuid) -> Result<Option<OutboxEntry>, OutboxError>;

    /// Claim up to `limit` due pending rows with fewer than
    /// `max_attempts` attempts and dispatch each
    ///
    /// Claim, dispatch, and status updates happen under one exclusive
    /// claim (skip-locked read inside a transaction on SQL backends):
    /// a dispatched row is marked sent, a failed dispatch increments
    /// `attempt_count` and records `last_error`.
    async fn process_due(
        &self,
        max_attempts: u32,
        limit: u32,
        dispatch: Dispatch<'_>,
    ) -> Result<OutboxBatch, OutboxError>;

    /// Delete sent rows older than `cutoff`, up to `limit`; returns the
    /// number deleted
    async fn sweep_sent(&self, cutoff: DateTime<Utc>, limit: u32) -> Result<u64, OutboxError>;

    /// Number of pending rows (monitoring and tests)
    async fn pending_count(&self) -> Result<usize, OutboxError>;
}
