//! In-memory implementation of OutboxStore for testing
//!
//! Mirrors the Postgres semantics: a claim set stands in for skip-locked
//! rows, so concurrent `process_due` calls never dispatch the same row.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use super::store::{Dispatch, OutboxBatch, OutboxEntry, OutboxError, OutboxStatus, OutboxStore};

/// In-memory outbox, primarily for tests and the `in-memory` database
/// configuration
#[derive(Default, Clone)]
pub struct InMemoryOutboxStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    rows: HashMap<Uuid, OutboxEntry>,
    claimed: HashSet<Uuid>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All rows, for assertions
    pub fn snapshot(&self) -> Vec<OutboxEntry> {
        let mut rows: Vec<OutboxEntry> = self.inner.lock().rows.values().cloned().collect();
        rows.sort_by_key(|r| r.id);
        rows
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.rows.clear();
        inner.claimed.clear();
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn insert(&self, entries: &[OutboxEntry]) -> Result<(), OutboxError> {
        let mut inner = self.inner.lock();
        for entry in entries {
            inner.rows.entry(entry.id).or_insert_with(|| entry.clone());
        }
        Ok(())
    }

    async fn update(&self, entries: &[OutboxEntry]) -> Result<(), OutboxError> {
        let mut inner = self.inner.lock();
        for entry in entries {
            if !inner.rows.contains_key(&entry.id) {
                return Err(OutboxError::NotFound(entry.id));
            }
            inner.rows.insert(entry.id, entry.clone());
        }
        Ok(())
    }

    async fn delete(&self, ids: &[Uuid]) -> Result<(), OutboxError> {
        let mut inner = self.inner.lock();
        for id in ids {
            inner.rows.remove(id);
            inner.claimed.remove(id);
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxEntry>, OutboxError> {
        Ok(self.inner.lock().rows.get(&id).cloned())
    }

    async fn process_due(
        &self,
        max_attempts: u32,
        limit: u32,
        dispatch: Dispatch<'_>,
    ) -> Result<OutboxBatch, OutboxError> {
        let now = Utc::now();

        // exclusive claim: rows picked here are invisible to concurrent
        // processors until released
        let claimed: Vec<OutboxEntry> = {
            let mut inner = self.inner.lock();
            let mut due: Vec<OutboxEntry> = inner
                .rows
                .values()
                .filter(|row| {
                    row.status == OutboxStatus::Pending
                        && row.delayed_until <= now
                        && row.attempt_count < max_attempts as i32
                        && !inner.claimed.contains(&row.id)
                })
                .cloned()
                .collect();
            due.sort_by_key(|r| (r.delayed_until, r.id));
            due.truncate(limit as usize);
            for row in &due {
                inner.claimed.insert(row.id);
            }
            due
        };

        let mut batch = OutboxBatch {
            claimed: claimed.len(),
            ..Default::default()
        };
        for mut row in claimed {
            let result = dispatch(row.clone()).await;
            let mut inner = self.inner.lock();
            inner.claimed.remove(&row.id);
            match result {
                Ok(()) => {
                    row.status = OutboxStatus::Sent;
                    batch.sent += 1;
                }
                Err(error) => {
                    row.attempt_count += 1;
                    row.last_error = Some(error);
                    batch.failed += 1;
                }
            }
            inner.rows.insert(row.id, row);
        }
        Ok(batch)
    }

    async fn sweep_sent(&self, cutoff: DateTime<Utc>, limit: u32) -> Result<u64, OutboxError> {
        let mut inner = self.inner.lock();
        let victims: Vec<Uuid> = inner
            .rows
            .values()
            .filter(|row| row.status == OutboxStatus::Sent && row.delayed_until < cutoff)
            .take(limit as usize)
            .map(|row| row.id)
            .collect();
        for id in &victims {
            inner.rows.remove(id);
        }
        Ok(victims.len() as u64)
    }

    async fn pending_count(&self) -> Result<usize, OutboxError> {
        Ok(self
            .inner
            .lock()
            .rows
            .values()
            .filter(|row| row.status == OutboxStatus::Pending)
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use skein_core::Message;

    fn due_entry() -> OutboxEntry {
        let message = Message::start("w", "1.0.0", json!(1));
        OutboxEntry::schedule(
            &message,
            chrono::Duration::milliseconds(-10),
            Utc::now(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_insert_is_idempotent() {
        let store = InMemoryOutboxStore::new();
        let entry = due_entry();
        store.insert(&[entry.clone()]).await.unwrap();
        let mut altered = entry.clone();
        altered.attempt_count = 99;
        store.insert(&[altered]).await.unwrap();
        assert_eq!(store.get(entry.id).await.unwrap().unwrap().attempt_count, 0);
    }

    #[tokio::test]
    async fn test_process_marks_sent() {
        let store = InMemoryOutboxStore::new();
        let entry = due_entry();
        store.insert(&[entry.clone()]).await.unwrap();

        let batch = store
            .process_due(3, 10, &|_entry| Box::pin(async { Ok(()) }))
            .await
            .unwrap();
        assert_eq!(batch.claimed, 1);
        assert_eq!(batch.sent, 1);
        assert_eq!(
            store.get(entry.id).await.unwrap().unwrap().status,
            OutboxStatus::Sent
        );
        assert_eq!(store.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_dispatch_keeps_pending_and_counts_attempts() {
        let store = InMemoryOutboxStore::new();
        let entry = due_entry();
        store.insert(&[entry.clone()]).await.unwrap();

        for expected_attempts in 1..=3 {
            let batch = store
                .process_due(3, 10, &|_entry| {
                    Box::pin(async { Err("broker unavailable".to_string()) })
                })
                .await
                .unwrap();
            assert_eq!(batch.failed, if expected_attempts <= 3 { 1 } else { 0 });
            let row = store.get(entry.id).await.unwrap().unwrap();
            assert_eq!(row.status, OutboxStatus::Pending);
            assert_eq!(row.attempt_count, expected_attempts);
            assert_eq!(row.last_error.as_deref(), Some("broker unavailable"));
        }

        // attempts exhausted: the row stays pending for inspection but
        // is no longer claimed
        let batch = store
            .process_due(3, 10, &|_entry| Box::pin(async { Ok(()) }))
            .await
            .unwrap();
        assert_eq!(batch.claimed, 0);
        assert_eq!(store.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_not_due_rows_are_skipped() {
        let store = InMemoryOutboxStore::new();
        let message = Message::start("w", "1.0.0", json!(1));
        let future_entry =
            OutboxEntry::schedule(&message, chrono::Duration::hours(1), Utc::now()).unwrap();
        store.insert(&[future_entry]).await.unwrap();

        let batch = store
            .process_due(3, 10, &|_entry| Box::pin(async { Ok(()) }))
            .await
            .unwrap();
        assert_eq!(batch.claimed, 0);
    }

    #[tokio::test]
    async fn test_sweep_deletes_old_sent_rows() {
        let store = InMemoryOutboxStore::new();
        let entry = due_entry();
        store.insert(&[entry.clone()]).await.unwrap();
        store
            .process_due(3, 10, &|_entry| Box::pin(async { Ok(()) }))
            .await
            .unwrap();

        let removed = store
            .sweep_sent(Utc::now() + chrono::Duration::hours(1), 100)
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.get(entry.id).await.unwrap().is_none());
    }
}
