//! Durable mapping from snapshot ids to target ids.
//!
//! The mapping store is a SQLite file living next to the snapshot. It holds:
//!
//! - `ids`: one row per `(entity_type, original_id)` with the target id
//! - `names`: a secondary index from normalized original names to target names
//! - `runs` / `run_units`: the run log (see [`runs`])
//!
//! Mappings are append-only. Once an original id is mapped, every later
//! lookup, in this run or any other against the same file, returns the same
//! target id.

pub mod runs;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::{debug, info};

use crate::core::{normalize_name, EntityType, NameKind, SourceQuery};
use crate::error::{ImportError, Result};
use crate::sqlite::{bind_values, decode_value};

pub use runs::{RunRecord, RunStatus, UnitRecord, UnitStatus};

/// Bound parameters per `IN (...)` chunk for bulk lookups.
const LOOKUP_CHUNK: usize = 500;

/// A single original id → target id mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingRecord {
    pub entity_type: EntityType,
    pub original_id: String,
    pub target_id: i64,
}

impl MappingRecord {
    pub fn new(entity_type: EntityType, original_id: impl Into<String>, target_id: i64) -> Self {
        Self {
            entity_type,
            original_id: original_id.into(),
            target_id,
        }
    }
}

/// An entry of the name index: which target entity an original name ended up as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameMappingRecord {
    pub kind: NameKind,
    pub original_name: String,
    pub target_id: i64,
    pub target_name: String,
}

impl NameMappingRecord {
    /// Whether the entity was renamed on import.
    pub fn is_renamed(&self) -> bool {
        normalize_name(&self.original_name) != normalize_name(&self.target_name)
    }
}

/// SQLite-backed mapping store.
pub struct MappingStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl MappingStore {
    /// Open (or create) the mapping store and make sure its schema exists.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| ImportError::mappings(e, format!("opening {}", path.display())))?;

        let store = Self {
            pool,
            path: path.to_path_buf(),
        };
        store.init_schema().await?;
        info!("Opened mapping store: {}", path.display());
        Ok(store)
    }

    /// Location of the store, for attaching it to the snapshot.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the store tables. Idempotent.
    async fn init_schema(&self) -> Result<()> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS ids (
                entity_type TEXT NOT NULL,
                original_id TEXT NOT NULL,
                target_id INTEGER NOT NULL,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (entity_type, original_id)
            ) WITHOUT ROWID",
            "CREATE INDEX IF NOT EXISTS idx_ids_target ON ids (entity_type, target_id)",
            "CREATE TABLE IF NOT EXISTS names (
                kind TEXT NOT NULL,
                normalized_name TEXT NOT NULL,
                original_name TEXT NOT NULL,
                target_id INTEGER NOT NULL,
                target_name TEXT NOT NULL,
                PRIMARY KEY (kind, normalized_name)
            ) WITHOUT ROWID",
            runs::CREATE_RUNS,
            runs::CREATE_RUN_UNITS,
        ];

        for sql in statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| ImportError::mappings(e, "creating mapping store schema"))?;
        }
        Ok(())
    }

    /// Record a single mapping.
    ///
    /// Recording the identical mapping again is a no-op; mapping an original id
    /// to a different target id fails with [`ImportError::MappingConflict`].
    pub async fn record_mapping(
        &self,
        entity_type: EntityType,
        original_id: &str,
        target_id: i64,
    ) -> Result<()> {
        self.record_batch(
            &[MappingRecord::new(entity_type, original_id, target_id)],
            &[],
        )
        .await
    }

    /// Record the mappings and name entries of one committed batch, atomically.
    pub async fn record_batch(
        &self,
        mappings: &[MappingRecord],
        names: &[NameMappingRecord],
    ) -> Result<()> {
        if mappings.is_empty() && names.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ImportError::mappings(e, "starting mapping transaction"))?;

        for record in mappings {
            let inserted = sqlx::query(
                "INSERT INTO ids (entity_type, original_id, target_id) VALUES ($1, $2, $3)
                 ON CONFLICT (entity_type, original_id) DO NOTHING",
            )
            .bind(record.entity_type.as_str())
            .bind(record.original_id.as_str())
            .bind(record.target_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| ImportError::mappings(e, "recording mapping"))?
            .rows_affected();

            if inserted == 0 {
                let existing: i64 = sqlx::query_scalar(
                    "SELECT target_id FROM ids WHERE entity_type = $1 AND original_id = $2",
                )
                .bind(record.entity_type.as_str())
                .bind(record.original_id.as_str())
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| ImportError::mappings(e, "checking existing mapping"))?;

                if existing != record.target_id {
                    return Err(ImportError::MappingConflict {
                        entity_type: record.entity_type.to_string(),
                        original_id: record.original_id.clone(),
                        existing,
                        attempted: record.target_id,
                    });
                }
            }
        }

        for name in names {
            sqlx::query(
                "INSERT INTO names (kind, normalized_name, original_name, target_id, target_name)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (kind, normalized_name) DO NOTHING",
            )
            .bind(name.kind.as_str())
            .bind(normalize_name(&name.original_name))
            .bind(name.original_name.as_str())
            .bind(name.target_id)
            .bind(name.target_name.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| ImportError::mappings(e, "recording name mapping"))?;
        }

        tx.commit()
            .await
            .map_err(|e| ImportError::mappings(e, "committing mapping transaction"))?;

        debug!(
            "Recorded {} mappings and {} names",
            mappings.len(),
            names.len()
        );
        Ok(())
    }

    /// Look up the target id of an original id.
    pub async fn lookup(&self, entity_type: EntityType, original_id: &str) -> Result<Option<i64>> {
        sqlx::query_scalar("SELECT target_id FROM ids WHERE entity_type = $1 AND original_id = $2")
            .bind(entity_type.as_str())
            .bind(original_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ImportError::mappings(e, format!("looking up {} {}", entity_type, original_id)))
    }

    /// Look up many original ids at once. Unmapped ids are absent from the result.
    pub async fn lookup_many(
        &self,
        entity_type: EntityType,
        original_ids: &[String],
    ) -> Result<HashMap<String, i64>> {
        let mut found = HashMap::with_capacity(original_ids.len());

        for chunk in original_ids.chunks(LOOKUP_CHUNK) {
            let placeholders = (2..chunk.len() + 2)
                .map(|i| format!("${}", i))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "SELECT original_id, target_id FROM ids WHERE entity_type = $1 AND original_id IN ({})",
                placeholders
            );

            let mut query = sqlx::query(&sql).bind(entity_type.as_str());
            for id in chunk {
                query = query.bind(id.as_str());
            }

            let rows = query
                .fetch_all(&self.pool)
                .await
                .map_err(|e| ImportError::mappings(e, format!("bulk lookup of {}", entity_type)))?;

            for row in rows {
                let original_id: String = row
                    .try_get(0)
                    .map_err(|e| ImportError::mappings(e, "decoding original_id"))?;
                let target_id: i64 = row
                    .try_get(1)
                    .map_err(|e| ImportError::mappings(e, "decoding target_id"))?;
                found.insert(original_id, target_id);
            }
        }

        Ok(found)
    }

    /// Run a query against the store and collect each row as a set member.
    ///
    /// Multi-column rows are joined with `:` to form composite keys.
    pub async fn existing_set(&self, query: &SourceQuery) -> Result<HashSet<String>> {
        let sql = query.sql();
        let rows = bind_values(sqlx::query(&sql), query.binds())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ImportError::mappings(e, format!("preloading set: {}", sql)))?;

        let mut set = HashSet::with_capacity(rows.len());
        for row in &rows {
            let mut parts = Vec::with_capacity(row.len());
            for idx in 0..row.len() {
                let value =
                    decode_value(row, idx).map_err(|e| ImportError::mappings(e, "decoding set row"))?;
                parts.push(value.to_key().unwrap_or_default());
            }
            set.insert(parts.join(":"));
        }
        Ok(set)
    }

    /// Run a two-column `(key, id)` query against the store and collect a map.
    pub async fn existing_mapping(&self, query: &SourceQuery) -> Result<HashMap<String, i64>> {
        let sql = query.sql();
        let rows = bind_values(sqlx::query(&sql), query.binds())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ImportError::mappings(e, format!("preloading mapping: {}", sql)))?;

        let mut map = HashMap::with_capacity(rows.len());
        for row in &rows {
            let key = decode_value(row, 0)
                .map_err(|e| ImportError::mappings(e, "decoding mapping key"))?
                .to_key();
            let id = decode_value(row, 1)
                .map_err(|e| ImportError::mappings(e, "decoding mapping id"))?
                .as_i64();
            if let (Some(key), Some(id)) = (key, id) {
                map.insert(key, id);
            }
        }
        Ok(map)
    }

    /// Record one name index entry.
    pub async fn record_name(&self, record: &NameMappingRecord) -> Result<()> {
        self.record_batch(&[], std::slice::from_ref(record)).await
    }

    /// Find what an original name was imported as.
    pub async fn lookup_name(
        &self,
        kind: NameKind,
        original_name: &str,
    ) -> Result<Option<NameMappingRecord>> {
        let row = sqlx::query(
            "SELECT original_name, target_id, target_name FROM names
             WHERE kind = $1 AND normalized_name = $2",
        )
        .bind(kind.as_str())
        .bind(normalize_name(original_name))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ImportError::mappings(e, format!("looking up {} {}", kind, original_name)))?;

        row.map(|row| {
            Ok(NameMappingRecord {
                kind,
                original_name: row
                    .try_get(0)
                    .map_err(|e| ImportError::mappings(e, "decoding original_name"))?,
                target_id: row
                    .try_get(1)
                    .map_err(|e| ImportError::mappings(e, "decoding target_id"))?,
                target_name: row
                    .try_get(2)
                    .map_err(|e| ImportError::mappings(e, "decoding target_name"))?,
            })
        })
        .transpose()
    }

    /// All renamed entries of a kind, as normalized original name → target name.
    pub async fn renamed_names(&self, kind: NameKind) -> Result<HashMap<String, String>> {
        let rows = sqlx::query(
            "SELECT normalized_name, target_name FROM names
             WHERE kind = $1 AND normalized_name <> lower(target_name)",
        )
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ImportError::mappings(e, format!("loading renamed {}", kind)))?;

        rows.iter()
            .map(|row| {
                Ok((
                    row.try_get::<String, _>(0)
                        .map_err(|e| ImportError::mappings(e, "decoding normalized_name"))?,
                    row.try_get::<String, _>(1)
                        .map_err(|e| ImportError::mappings(e, "decoding target_name"))?,
                ))
            })
            .collect()
    }

    /// Number of mappings recorded for an entity type.
    pub async fn mapped_count(&self, entity_type: EntityType) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM ids WHERE entity_type = $1")
            .bind(entity_type.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| ImportError::mappings(e, format!("counting {} mappings", entity_type)))
    }

    /// Total number of mappings.
    pub async fn total_mapped(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM ids")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| ImportError::mappings(e, "counting mappings"))
    }

    /// Pool handle for the run log.
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
