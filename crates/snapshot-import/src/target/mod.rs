//! Target store abstraction.
//!
//! The importer writes into the target through [`TargetStore`]:
//!
//! - [`PgTarget`]: PostgreSQL via deadpool-postgres, the production target
//! - [`SqliteTarget`]: SQLite via sqlx, for local runs and tests
//!
//! Unit SQL is shared between both, so it sticks to `$N` placeholders and
//! `CAST(... AS ...)` instead of dialect-specific syntax.
//!
//! # Journal
//!
//! The mapping store is a separate database, so a batch's mappings cannot be
//! written in the target transaction directly. Instead each batch carries a
//! [`JournalEntry`] that the store writes into [`JOURNAL_TABLE`] in the same
//! transaction as the rows, together with the ids the rows received. Once the
//! mappings are recorded the entry is cleared. Entries left behind by an
//! interrupted run are replayed into the mapping store before the next run.

mod postgres;
mod sqlite;

pub use postgres::PgTarget;
pub use sqlite::SqliteTarget;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::TargetConfig;
use crate::core::{identifier::validate_identifier, SourceQuery, SqlValue};
use crate::error::{ImportError, Result};

/// Table holding the mapping writes of batches not yet recorded.
pub const JOURNAL_TABLE: &str = "import_journal";

/// Mapping writes of one batch, stored with its rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub batch_id: String,
    pub unit: String,
    /// Serialized mapping writes; opaque to the store.
    pub payload: String,
}

/// A journal entry read back with the ids its rows received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournaledBatch {
    pub entry: JournalEntry,
    pub ids: Vec<i64>,
}

/// A batch of rows for one target table.
#[derive(Debug, Clone)]
pub struct InsertBatch {
    pub table: &'static str,
    pub columns: Vec<&'static str>,
    pub rows: Vec<Vec<SqlValue>>,
    /// Column whose generated values are returned, in row order.
    pub returning: Option<&'static str>,
    /// Written to the journal in the same transaction as the rows.
    pub journal: Option<JournalEntry>,
}

impl InsertBatch {
    /// Check the batch shape before it reaches a driver.
    pub fn validate(&self) -> Result<()> {
        validate_identifier(self.table)?;
        for column in &self.columns {
            validate_identifier(column)?;
        }
        if let Some(returning) = self.returning {
            validate_identifier(returning)?;
        }
        if let Some(row) = self.rows.iter().find(|r| r.len() != self.columns.len()) {
            return Err(ImportError::Config(format!(
                "row for {} has {} values but {} columns are declared",
                self.table,
                row.len(),
                self.columns.len()
            )));
        }
        Ok(())
    }
}

/// Write to and query the target store.
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Insert all rows of the batch in one transaction.
    ///
    /// Returns the `returning` column of every inserted row, in row order, or
    /// an empty vector when `returning` is `None`. The batch's journal entry,
    /// if any, is written in the same transaction.
    async fn bulk_insert(&self, batch: &InsertBatch) -> Result<Vec<i64>>;

    /// Create the journal table if it does not exist.
    async fn prepare_journal(&self) -> Result<()>;

    /// Journal entries not cleared yet, oldest first.
    async fn journaled_batches(&self) -> Result<Vec<JournaledBatch>>;

    /// Remove a journal entry once its mappings are recorded.
    async fn clear_journal(&self, batch_id: &str) -> Result<()>;

    /// Execute a statement and return the number of affected rows.
    async fn exec(&self, query: &SourceQuery) -> Result<u64>;

    /// Run a query returning a single integer.
    async fn count(&self, query: &SourceQuery) -> Result<i64>;

    /// Collect every row as a set member; multi-column rows are joined with `:`.
    async fn query_set(&self, query: &SourceQuery) -> Result<HashSet<String>>;

    /// Collect `(key, id)` rows into a map.
    async fn query_map(&self, query: &SourceQuery) -> Result<HashMap<String, i64>>;

    /// Store identifier (e.g., "postgres", "sqlite").
    fn store_type(&self) -> &'static str;

    /// Check that the target is reachable.
    async fn ping(&self) -> Result<()> {
        self.count(&SourceQuery::new("SELECT 1")).await.map(|_| ())
    }
}

/// Connect to the target described by the configuration.
pub async fn connect(config: &TargetConfig) -> Result<Arc<dyn TargetStore>> {
    match config.r#type.as_str() {
        "postgres" => Ok(Arc::new(PgTarget::new(config).await?)),
        "sqlite" => {
            let path = config.path.as_deref().ok_or_else(|| {
                ImportError::Config("target.path is required for sqlite targets".to_string())
            })?;
            Ok(Arc::new(SqliteTarget::open(path).await?))
        }
        other => Err(ImportError::Config(format!(
            "Invalid target type: {} (expected postgres or sqlite)",
            other
        ))),
    }
}

/// Journal table definition, shared by both stores.
pub(crate) fn journal_ddl(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (
            batch_id TEXT PRIMARY KEY,
            unit TEXT NOT NULL,
            payload TEXT NOT NULL,
            ids TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        table
    )
}

/// Journal timestamp; sorts in commit order.
pub(crate) fn journal_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

pub(crate) fn encode_ids(ids: &[i64]) -> Result<String> {
    Ok(serde_json::to_string(ids)?)
}

pub(crate) fn decode_ids(raw: &str) -> Result<Vec<i64>> {
    Ok(serde_json::from_str(raw)?)
}

/// Join the key view of each value with `:`.
pub(crate) fn composite_key(values: &[SqlValue]) -> String {
    values
        .iter()
        .map(|v| v.to_key().unwrap_or_default())
        .collect::<Vec<_>>()
        .join(":")
}
