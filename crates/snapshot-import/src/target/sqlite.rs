//! SQLite target via sqlx.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info};

use crate::core::identifier::quote_ident;
use crate::core::{SourceQuery, SqlValue};
use crate::error::{ImportError, Result};
use crate::sqlite::{bind_value, bind_values, decode_value};

use super::{
    composite_key, decode_ids, encode_ids, journal_ddl, journal_timestamp, InsertBatch,
    JournalEntry, JournaledBatch, TargetStore, JOURNAL_TABLE,
};

/// Target stored in a SQLite file.
pub struct SqliteTarget {
    pool: SqlitePool,
}

impl SqliteTarget {
    /// Open (or create) the target database.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| ImportError::pool(e, format!("opening SQLite target {}", path.display())))?;

        info!("Opened SQLite target: {}", path.display());
        Ok(Self { pool })
    }

    /// Run a multi-statement script, e.g. a schema definition.
    pub async fn execute_script(&self, sql: &str) -> Result<()> {
        sqlx::raw_sql(sql)
            .execute(&self.pool)
            .await
            .map_err(|e| ImportError::target(e, "executing script"))?;
        Ok(())
    }

    fn insert_sql(batch: &InsertBatch) -> Result<String> {
        let columns = batch
            .columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Result<Vec<_>>>()?
            .join(", ");
        let placeholders = (1..=batch.columns.len())
            .map(|i| format!("${}", i))
            .collect::<Vec<_>>()
            .join(", ");

        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(batch.table)?,
            columns,
            placeholders
        );
        if let Some(returning) = batch.returning {
            sql.push_str(" RETURNING ");
            sql.push_str(&quote_ident(returning)?);
        }
        Ok(sql)
    }
}

#[async_trait]
impl TargetStore for SqliteTarget {
    async fn bulk_insert(&self, batch: &InsertBatch) -> Result<Vec<i64>> {
        batch.validate()?;
        if batch.rows.is_empty() {
            return Ok(Vec::new());
        }

        let sql = Self::insert_sql(batch)?;
        let context = format!("inserting into {}", batch.table);
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ImportError::target(e, context.clone()))?;

        let mut ids = Vec::with_capacity(if batch.returning.is_some() {
            batch.rows.len()
        } else {
            0
        });

        // SQLite does not guarantee RETURNING order for multi-row inserts, so
        // rows go one statement each inside the transaction.
        for row in &batch.rows {
            let mut query = sqlx::query(&sql);
            for value in row {
                query = bind_value(query, value);
            }

            if batch.returning.is_some() {
                let returned = query
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(|e| ImportError::target(e, context.clone()))?;
                let id = decode_value(&returned, 0)
                    .map_err(|e| ImportError::target(e, context.clone()))?
                    .as_i64()
                    .ok_or_else(|| ImportError::target("non-integer id returned", context.clone()))?;
                ids.push(id);
            } else {
                query
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| ImportError::target(e, context.clone()))?;
            }
        }

        if let Some(JournalEntry {
            batch_id,
            unit,
            payload,
        }) = &batch.journal
        {
            sqlx::query(&format!(
                "INSERT INTO {} (batch_id, unit, payload, ids, created_at) VALUES ($1, $2, $3, $4, $5)",
                quote_ident(JOURNAL_TABLE)?
            ))
            .bind(batch_id.as_str())
            .bind(unit.as_str())
            .bind(payload.as_str())
            .bind(encode_ids(&ids)?)
            .bind(journal_timestamp())
            .execute(&mut *tx)
            .await
            .map_err(|e| ImportError::target(e, "writing batch journal"))?;
        }

        tx.commit()
            .await
            .map_err(|e| ImportError::target(e, context.clone()))?;

        debug!("Inserted {} rows into {}", batch.rows.len(), batch.table);
        Ok(ids)
    }

    async fn prepare_journal(&self) -> Result<()> {
        sqlx::query(&journal_ddl(&quote_ident(JOURNAL_TABLE)?))
            .execute(&self.pool)
            .await
            .map_err(|e| ImportError::target(e, "creating batch journal"))?;
        Ok(())
    }

    async fn journaled_batches(&self) -> Result<Vec<JournaledBatch>> {
        let rows = sqlx::query(&format!(
            "SELECT batch_id, unit, payload, ids FROM {} ORDER BY created_at, batch_id",
            quote_ident(JOURNAL_TABLE)?
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ImportError::target(e, "reading batch journal"))?;

        rows.iter()
            .map(|row| -> Result<JournaledBatch> {
                let column = |idx: usize| -> Result<String> {
                    sqlx::Row::try_get::<String, _>(row, idx)
                        .map_err(|e| ImportError::target(e, "decoding batch journal"))
                };
                Ok(JournaledBatch {
                    entry: JournalEntry {
                        batch_id: column(0)?,
                        unit: column(1)?,
                        payload: column(2)?,
                    },
                    ids: decode_ids(&column(3)?)?,
                })
            })
            .collect()
    }

    async fn clear_journal(&self, batch_id: &str) -> Result<()> {
        sqlx::query(&format!(
            "DELETE FROM {} WHERE batch_id = $1",
            quote_ident(JOURNAL_TABLE)?
        ))
        .bind(batch_id)
        .execute(&self.pool)
        .await
        .map_err(|e| ImportError::target(e, "clearing batch journal"))?;
        Ok(())
    }

    async fn exec(&self, query: &SourceQuery) -> Result<u64> {
        let sql = query.sql();
        let result = bind_values(sqlx::query(&sql), query.binds())
            .execute(&self.pool)
            .await
            .map_err(|e| ImportError::target(e, format!("executing: {}", sql)))?;
        Ok(result.rows_affected())
    }

    async fn count(&self, query: &SourceQuery) -> Result<i64> {
        let sql = query.sql();
        let row = bind_values(sqlx::query(&sql), query.binds())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ImportError::target(e, format!("counting: {}", sql)))?;

        match row {
            Some(row) => Ok(decode_value(&row, 0)
                .map_err(|e| ImportError::target(e, "decoding count"))?
                .as_i64()
                .unwrap_or(0)),
            None => Ok(0),
        }
    }

    async fn query_set(&self, query: &SourceQuery) -> Result<HashSet<String>> {
        let sql = query.sql();
        let rows = bind_values(sqlx::query(&sql), query.binds())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ImportError::target(e, format!("preloading set: {}", sql)))?;

        let mut set = HashSet::with_capacity(rows.len());
        for row in &rows {
            let values = (0..sqlx::Row::len(row))
                .map(|idx| decode_value(row, idx))
                .collect::<std::result::Result<Vec<SqlValue>, _>>()
                .map_err(|e| ImportError::target(e, "decoding set row"))?;
            set.insert(composite_key(&values));
        }
        Ok(set)
    }

    async fn query_map(&self, query: &SourceQuery) -> Result<HashMap<String, i64>> {
        let sql = query.sql();
        let rows = bind_values(sqlx::query(&sql), query.binds())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ImportError::target(e, format!("preloading mapping: {}", sql)))?;

        let mut map = HashMap::with_capacity(rows.len());
        for row in &rows {
            let key = decode_value(row, 0).map_err(|e| ImportError::target(e, "decoding key"))?;
            let id = decode_value(row, 1).map_err(|e| ImportError::target(e, "decoding id"))?;
            if let (Some(key), Some(id)) = (key.to_key(), id.as_i64()) {
                map.insert(key, id);
            }
        }
        Ok(map)
    }

    fn store_type(&self) -> &'static str {
        "sqlite"
    }
}
