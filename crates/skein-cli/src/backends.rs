//! Backend wiring from configuration
//!
//! Builds the definition store and outbox from the `database` section.
//! Postgres backends also get their schema applied, so a fresh database
//! works without a separate migration step.

use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;

use skein_runtime::config::{DatabaseKind, EngineConfig};
use skein_runtime::definitions::{
    DefinitionStore, InMemoryDefinitionStore, PostgresDefinitionStore,
};
use skein_runtime::outbox::{InMemoryOutboxStore, OutboxStore, PostgresOutboxStore};

pub struct Backends {
    pub definitions: Arc<dyn DefinitionStore>,
    pub outbox: Arc<dyn OutboxStore>,
}

pub async fn build(config: &EngineConfig) -> anyhow::Result<Backends> {
    match config.database.kind {
        DatabaseKind::InMemory => Ok(Backends {
            definitions: Arc::new(InMemoryDefinitionStore::new()),
            outbox: Arc::new(InMemoryOutboxStore::new()),
        }),
        DatabaseKind::Postgres => {
            let url = config
                .database
                .url
                .as_deref()
                .context("database.url is required for postgres")?;
            let pool = PgPool::connect(url)
                .await
                .with_context(|| format!("connecting to {url}"))?;
            let definitions = PostgresDefinitionStore::new(pool.clone());
            definitions.ensure_schema().await?;
            let outbox = PostgresOutboxStore::new(pool);
            outbox.ensure_schema().await?;
            Ok(Backends {
                definitions: Arc::new(definitions),
                outbox: Arc::new(outbox),
            })
        }
        DatabaseKind::Mysql => anyhow::bail!("mysql is not supported; use postgres or in-memory"),
    }
}
