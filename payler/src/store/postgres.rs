use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use super::{DocumentStore, StoreDriver, StoredDocument};
use crate::config::{DriverConfiguration, StoreOptions};
use crate::error::{PaylerError, Result};
use crate::metrics::JobCounter;
use crate::payload::Payload;

/// PostgreSQL-backed document store.
///
/// Documents live in a single table with an ascending index on
/// `reference_date`; the table name comes from [`StoreOptions::table`].
#[derive(Clone, Debug)]
pub struct PostgresDocumentStore {
    pool: PgPool,
    table: String,
}

impl PostgresDocumentStore {
    /// Wrap an existing pool.
    pub fn new(pool: PgPool, table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        validate_identifier(&table)?;
        Ok(Self { pool, table })
    }

    /// Open a connection pool to `url`.
    pub async fn connect(url: &str, options: &StoreOptions) -> Result<Self> {
        validate_identifier(&options.table)?;
        let pool = PgPoolOptions::new()
            .max_connections(options.max_connections)
            .acquire_timeout(Duration::from_secs(options.acquire_timeout_seconds))
            .connect(url)
            .await
            .map_err(|e| {
                PaylerError::backend(
                    anyhow::Error::new(e).context("connecting to PostgreSQL"),
                )
            })?;
        Self::new(pool, options.table.clone())
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn index_name(&self) -> String {
        format!("{}_reference_date_idx", self.table)
    }
}

/// Table names are interpolated into SQL, so only plain identifiers pass.
fn validate_identifier(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(PaylerError::setup(anyhow::anyhow!(
            "invalid table name {name:?}"
        )))
    }
}

fn row_to_document(row: &sqlx::postgres::PgRow) -> Result<StoredDocument> {
    Ok(StoredDocument {
        id: row.try_get("id")?,
        message: row.try_get("message")?,
        reference_date: row.try_get("reference_date")?,
        source: row.try_get("source")?,
        destination: row.try_get("destination")?,
    })
}

#[async_trait]
impl DocumentStore for PostgresDocumentStore {
    fn collection(&self) -> &str {
        &self.table
    }

    async fn ensure_index(&self) -> Result<String> {
        let create_table = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id UUID PRIMARY KEY,
                message BYTEA NOT NULL,
                reference_date TIMESTAMPTZ NOT NULL,
                source TEXT,
                destination TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            table = self.table
        );
        sqlx::query(&create_table)
            .execute(&self.pool)
            .await
            .map_err(PaylerError::setup)?;

        let index = self.index_name();
        let create_index = format!(
            "CREATE INDEX IF NOT EXISTS {index} ON {table} (reference_date ASC)",
            table = self.table
        );
        sqlx::query(&create_index)
            .execute(&self.pool)
            .await
            .map_err(PaylerError::setup)?;

        Ok(index)
    }

    async fn ping(&self) -> bool {
        match sqlx::query("SELECT 1").execute(&self.pool).await {
            Ok(_) => true,
            Err(err) => {
                debug!(table = %self.table, error = %err, "store ping failed");
                false
            }
        }
    }

    async fn insert(&self, payload: &Payload) -> Result<Uuid> {
        let id = Uuid::now_v7();
        let sql = format!(
            r#"
            INSERT INTO {table} (id, message, reference_date, source, destination)
            VALUES ($1, $2, $3, $4, $5)
            "#,
            table = self.table
        );
        sqlx::query(&sql)
            .bind(id)
            .bind(payload.message().as_ref())
            .bind(payload.release_at())
            .bind(payload.source())
            .bind(payload.destination())
            .execute(&self.pool)
            .await?;
        Ok(id)
    }

    async fn find_ready(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<StoredDocument>> {
        let sql = format!(
            r#"
            SELECT id, message, reference_date, source, destination
            FROM {table}
            WHERE reference_date <= $1
            ORDER BY reference_date ASC
            "#,
            table = self.table
        );
        let rows = sqlx::query(&sql).bind(now).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_document).collect()
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let sql = format!("DELETE FROM {table} WHERE id = $1", table = self.table);
        let result = sqlx::query(&sql).bind(id).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }
}

impl StoreDriver<PostgresDocumentStore> {
    /// Connect a store driver from its configuration.
    pub async fn connect(
        config: DriverConfiguration<StoreOptions>,
        metrics: JobCounter,
    ) -> Result<Self> {
        let store = PostgresDocumentStore::connect(&config.url, &config.extra).await?;
        Ok(Self::new(config.name, store, &config.extra, metrics))
    }
}
