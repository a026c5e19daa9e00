//! Workflow definition store
//!
//! Definitions are immutable once stored, keyed by (name, version).
//! The raw source is kept for round-tripping; parsed documents are
//! shared as `Arc` and the node trees they build are cached separately
//! by the consumer.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use sqlx::{PgPool, Row};
use tracing::instrument;

use skein_core::dsl::{DocumentParseError, WorkflowDocument};

/// Error type for definition operations
#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    /// No definition for (name, version)
    #[error("definition not found: {name} {version}")]
    NotFound { name: String, version: String },

    /// Source did not parse as a workflow document
    #[error(transparent)]
    Parse(#[from] DocumentParseError),

    /// A definition with this (name, version) already exists
    #[error("definition already exists: {name} {version}")]
    AlreadyExists { name: String, version: String },

    /// Database error
    #[error("database error: {0}")]
    Database(String),
}

/// A stored definition: parsed document plus original source
#[derive(Debug, Clone)]
pub struct StoredDefinition {
    pub document: Arc<WorkflowDocument>,
    pub source: String,
}

/// Store of workflow definitions
#[async_trait]
pub trait DefinitionStore: Send + Sync + 'static {
    /// Parse and store a definition; rejects duplicates
    async fn put(&self, source: &str) -> Result<StoredDefinition, DefinitionError>;

    /// Fetch a definition by (name, version)
    async fn get(&self, name: &str, version: &str) -> Result<StoredDefinition, DefinitionError>;

    /// Delete a definition by (name, version)
    async fn delete(&self, name: &str, version: &str) -> Result<(), DefinitionError>;

    /// List stored (name, version) pairs
    async fn list(&self) -> Result<Vec<(String, String)>, DefinitionError>;
}

/// In-memory definition store
#[derive(Default)]
pub struct InMemoryDefinitionStore {
    inner: RwLock<HashMap<(String, String), StoredDefinition>>,
}

impl InMemoryDefinitionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DefinitionStore for InMemoryDefinitionStore {
    async fn put(&self, source: &str) -> Result<StoredDefinition, DefinitionError> {
        let document = Arc::new(WorkflowDocument::parse(source)?);
        let key = (document.name().to_string(), document.version().to_string());
        let stored = StoredDefinition {
            document,
            source: source.to_string(),
        };
        let mut inner = self.inner.write();
        if inner.contains_key(&key) {
            return Err(DefinitionError::AlreadyExists {
                name: key.0,
                version: key.1,
            });
        }
        inner.insert(key, stored.clone());
        Ok(stored)
    }

    async fn get(&self, name: &str, version: &str) -> Result<StoredDefinition, DefinitionError> {
        self.inner
            .read()
            .get(&(name.to_string(), version.to_string()))
            .cloned()
            .ok_or_else(|| DefinitionError::NotFound {
                name: name.to_string(),
                version: version.to_string(),
            })
    }

    async fn delete(&self, name: &str, version: &str) -> Result<(), DefinitionError> {
        self.inner
            .write()
            .remove(&(name.to_string(), version.to_string()))
            .map(|_| ())
            .ok_or_else(|| DefinitionError::NotFound {
                name: name.to_string(),
                version: version.to_string(),
            })
    }

    async fn list(&self) -> Result<Vec<(String, String)>, DefinitionError> {
        let mut keys: Vec<(String, String)> = self.inner.read().keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

/// PostgreSQL definition store
#[derive(Clone)]
pub struct PostgresDefinitionStore {
    pool: PgPool,
}

impl PostgresDefinitionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the definitions table if missing
    pub async fn ensure_schema(&self) -> Result<(), DefinitionError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_definitions (
                name       TEXT NOT NULL,
                version    TEXT NOT NULL,
                source     TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (name, version)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| DefinitionError::Database(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl DefinitionStore for PostgresDefinitionStore {
    #[instrument(skip(self, source))]
    async fn put(&self, source: &str) -> Result<StoredDefinition, DefinitionError> {
        let document = Arc::new(WorkflowDocument::parse(source)?);
        let result = sqlx::query(
            r#"
            INSERT INTO workflow_definitions (name, version, source)
            VALUES ($1, $2, $3)
            ON CONFLICT (name, version) DO NOTHING
            "#,
        )
        .bind(document.name())
        .bind(document.version())
        .bind(source)
        .execute(&self.pool)
        .await
        .map_err(|e| DefinitionError::Database(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(DefinitionError::AlreadyExists {
                name: document.name().to_string(),
                version: document.version().to_string(),
            });
        }
        Ok(StoredDefinition {
            document,
            source: source.to_string(),
        })
    }

    #[instrument(skip(self))]
    async fn get(&self, name: &str, version: &str) -> Result<StoredDefinition, DefinitionError> {
        let row = sqlx::query(
            "SELECT source FROM workflow_definitions WHERE name = $1 AND version = $2",
        )
        .bind(name)
        .bind(version)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DefinitionError::Database(e.to_string()))?
        .ok_or_else(|| DefinitionError::NotFound {
            name: name.to_string(),
            version: version.to_string(),
        })?;
        let source: String = row.get("source");
        let document = Arc::new(WorkflowDocument::parse(&source)?);
        Ok(StoredDefinition { document, source })
    }

    async fn delete(&self, name: &str, version: &str) -> Result<(), DefinitionError> {
        let result =
            sqlx::query("DELETE FROM workflow_definitions WHERE name = $1 AND version = $2")
                .bind(name)
                .bind(version)
                .execute(&self.pool)
                .await
                .map_err(|e| DefinitionError::Database(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(DefinitionError::NotFound {
                name: name.to_string(),
                version: version.to_string(),
            });
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<(String, String)>, DefinitionError> {
        let rows =
            sqlx::query("SELECT name, version FROM workflow_definitions ORDER BY name, version")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| DefinitionError::Database(e.to_string()))?;
        Ok(rows
            .iter()
            .map(|row| (row.get("name"), row.get("version")))
            .collect())
    }
}
