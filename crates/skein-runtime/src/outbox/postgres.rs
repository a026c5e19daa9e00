//! PostgreSQL implementation of OutboxStore
//!
//! Production persistence: claiming uses `FOR UPDATE SKIP LOCKED` inside
//! the processing transaction, so any number of concurrent processors
//! can drain the table without double-dispatching a row. Dispatch and
//! status updates commit atomically with the claim; a crash mid-batch
//! rolls the claim back and the rows are re-emitted later
//! (at-least-once).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::{Dispatch, OutboxBatch, OutboxEntry, OutboxError, OutboxStatus, OutboxStore};

/// PostgreSQL outbox over a connection pool
///
/// # Example
///
/// ```ignore
/// use skein_runtime::outbox::PostgresOutboxStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/skein").await?;
/// let store = PostgresOutboxStore::new(pool);
/// store.ensure_schema().await?;
/// ```
#[derive(Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    /// Create a new store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the outbox table and its index if missing
    pub async fn ensure_schema(&self) -> Result<(), OutboxError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS outbox_messages (
                id            UUID PRIMARY KEY,
                payload       JSONB NOT NULL,
                status        TEXT NOT NULL DEFAULT 'pending',
                delayed_until TIMESTAMPTZ NOT NULL,
                attempt_count INT NOT NULL DEFAULT 0,
                last_error    TEXT,
                created_at    TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_outbox_status_due
            ON outbox_messages (status, delayed_until)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

fn db_err(e: sqlx::Error) -> OutboxError {
    OutboxError::Database(e.to_string())
}

fn parse_status(raw: &str) -> Result<OutboxStatus, OutboxError> {
    match raw {
        "pending" => Ok(OutboxStatus::Pending),
        "sent" => Ok(OutboxStatus::Sent),
        "failed" => Ok(OutboxStatus::Failed),
        other => Err(OutboxError::Database(format!(
            "unexpected outbox status {other:?}"
        ))),
    }
}

fn entry_from_row(row: &sqlx::postgres::PgRow) -> Result<OutboxEntry, OutboxError> {
    let status: String = row.get("status");
    Ok(OutboxEntry {
        id: row.get("id"),
        payload: row.get("payload"),
        status: parse_status(&status)?,
        delayed_until: row.get("delayed_until"),
        attempt_count: row.get("attempt_count"),
        last_error: row.get("last_error"),
        created_at: row.get("created_at"),
    })
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    #[instrument(skip(self, entries), fields(count = entries.len()))]
    async fn insert(&self, entries: &[OutboxEntry]) -> Result<(), OutboxError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO outbox_messages
                    (id, payload, status, delayed_until, attempt_count, last_error, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(entry.id)
            .bind(&entry.payload)
            .bind(entry.status.to_string())
            .bind(entry.delayed_until)
            .bind(entry.attempt_count)
            .bind(&entry.last_error)
            .bind(entry.created_at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        debug!("inserted outbox entries");
        Ok(())
    }

    #[instrument(skip(self, entries), fields(count = entries.len()))]
    async fn update(&self, entries: &[OutboxEntry]) -> Result<(), OutboxError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for entry in entries {
            let result = sqlx::query(
                r#"
                UPDATE outbox_messages
                SET payload = $2, status = $3, delayed_until = $4,
                    attempt_count = $5, last_error = $6
                WHERE id = $1
                "#,
            )
            .bind(entry.id)
            .bind(&entry.payload)
            .bind(entry.status.to_string())
            .bind(entry.delayed_until)
            .bind(entry.attempt_count)
            .bind(&entry.last_error)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            if result.rows_affected() == 0 {
                return Err(OutboxError::NotFound(entry.id));
            }
        }
        tx.commit().await.map_err(db_err)
    }

    async fn delete(&self, ids: &[Uuid]) -> Result<(), OutboxError> {
        sqlx::query("DELETE FROM outbox_messages WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxEntry>, OutboxError> {
        let row = sqlx::query(
            r#"
            SELECT id, payload, status, delayed_until, attempt_count, last_error, created_at
            FROM outbox_messages WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(entry_from_row).transpose()
    }

    #[instrument(skip(self, dispatch))]
    async fn process_due(
        &self,
        max_attempts: u32,
        limit: u32,
        dispatch: Dispatch<'_>,
    ) -> Result<OutboxBatch, OutboxError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let rows = sqlx::query(
            r#"
            SELECT id, payload, status, delayed_until, attempt_count, last_error, created_at
            FROM outbox_messages
            WHERE status = 'pending'
              AND delayed_until <= now()
              AND attempt_count < $1
            ORDER BY delayed_until, id
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(max_attempts as i32)
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        let mut batch = OutboxBatch {
            claimed: rows.len(),
            ..Default::default()
        };
        for row in &rows {
            let entry = entry_from_row(row)?;
            let id = entry.id;
            match dispatch(entry).await {
                Ok(()) => {
                    sqlx::query("UPDATE outbox_messages SET status = 'sent' WHERE id = $1")
                        .bind(id)
                        .execute(&mut *tx)
                        .await
                        .map_err(db_err)?;
                    batch.sent += 1;
                }
                Err(message) => {
                    error!(entry = %id, error = %message, "outbox dispatch failed");
                    sqlx::query(
                        r#"
                        UPDATE outbox_messages
                        SET attempt_count = attempt_count + 1, last_error = $2
                        WHERE id = $1
                        "#,
                    )
                    .bind(id)
                    .bind(&message)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;
                    batch.failed += 1;
                }
            }
        }

        tx.commit().await.map_err(db_err)?;
        if batch.claimed > 0 {
            debug!(claimed = batch.claimed, sent = batch.sent, failed = batch.failed, "processed outbox batch");
        }
        Ok(batch)
    }

    async fn sweep_sent(&self, cutoff: DateTime<Utc>, limit: u32) -> Result<u64, OutboxError> {
        let result = sqlx::query(
            r#"
            DELETE FROM outbox_messages
            WHERE id IN (
                SELECT id FROM outbox_messages
                WHERE status = 'sent' AND delayed_until < $1
                LIMIT $2
            )
            "#,
        )
        .bind(cutoff)
        .bind(limit as i64)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn pending_count(&self) -> Result<usize, OutboxError> {
        let row =
            sqlx::query("SELECT COUNT(*) AS n FROM outbox_messages WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?;
        let n: i64 = row.get("n");
        Ok(n as usize)
    }
}
