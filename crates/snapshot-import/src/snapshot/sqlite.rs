//! SQLite snapshot reader.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::core::{SourceQuery, SourceRow, SqlValue};
use crate::error::{ImportError, Result};
use crate::sqlite::{bind_values, column_names, decode_row, decode_value};

use super::SnapshotSource;

/// Snapshot stored in a SQLite file.
///
/// Every connection ATTACHes the mapping store as schema `mapped`, so unit
/// queries can select only rows that have not been imported yet:
///
/// ```sql
/// SELECT u.* FROM users u
/// WHERE NOT EXISTS (SELECT 1 FROM mapped.ids m
///                   WHERE m.entity_type = $1 AND m.original_id = u.id)
/// ```
pub struct SqliteSnapshot {
    pool: SqlitePool,
}

impl SqliteSnapshot {
    /// Open a snapshot file and attach the mapping store at `mappings_path`.
    ///
    /// The mapping store must have been opened (and its schema created) first.
    pub async fn open(path: &Path, mappings_path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ImportError::Config(format!(
                "Snapshot not found: {}",
                path.display()
            )));
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(false)
            .busy_timeout(Duration::from_secs(30));

        let attach_path = mappings_path.to_string_lossy().into_owned();
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .after_connect(move |conn, _meta| {
                let attach_path = attach_path.clone();
                Box::pin(async move {
                    sqlx::query("ATTACH DATABASE $1 AS mapped")
                        .bind(attach_path)
                        .execute(conn)
                        .await?;
                    Ok(())
                })
            })
            .connect_with(options)
            .await
            .map_err(|e| ImportError::snapshot(e, format!("opening {}", path.display())))?;

        info!("Opened snapshot: {}", path.display());
        Ok(Self { pool })
    }
}

#[async_trait]
impl SnapshotSource for SqliteSnapshot {
    fn stream_rows(&self, query: &SourceQuery, buffer: usize) -> mpsc::Receiver<Result<SourceRow>> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let pool = self.pool.clone();
        let query = query.clone();

        tokio::spawn(async move {
            let sql = query.sql();
            debug!("Streaming snapshot query: {}", sql);
            let mut rows = bind_values(sqlx::query(&sql), query.binds()).fetch(&pool);
            let mut columns: Option<Arc<[String]>> = None;

            loop {
                match rows.try_next().await {
                    Ok(Some(row)) => {
                        let columns = columns.get_or_insert_with(|| column_names(&row));
                        let item = decode_row(&row, columns)
                            .map_err(|e| ImportError::snapshot(e, "decoding snapshot row"));
                        let failed = item.is_err();
                        if tx.send(item).await.is_err() || failed {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx
                            .send(Err(ImportError::snapshot(e, format!("streaming: {}", sql))))
                            .await;
                        break;
                    }
                }
            }
        });

        rx
    }

    async fn query_rows(&self, query: &SourceQuery) -> Result<Vec<SourceRow>> {
        let sql = query.sql();
        let rows = bind_values(sqlx::query(&sql), query.binds())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ImportError::snapshot(e, format!("query: {}", sql)))?;

        let Some(first) = rows.first() else {
            return Ok(Vec::new());
        };
        let columns = column_names(first);
        rows.iter()
            .map(|row| decode_row(row, &columns))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| ImportError::snapshot(e, "decoding snapshot row"))
    }

    async fn query_scalar(&self, query: &SourceQuery) -> Result<Option<SqlValue>> {
        let sql = query.sql();
        let row = bind_values(sqlx::query(&sql), query.binds())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ImportError::snapshot(e, format!("scalar query: {}", sql)))?;

        row.map(|row| decode_value(&row, 0))
            .transpose()
            .map_err(|e| ImportError::snapshot(e, "decoding scalar"))
    }

    async fn query_column(&self, query: &SourceQuery) -> Result<Vec<SqlValue>> {
        let sql = query.sql();
        let rows = bind_values(sqlx::query(&sql), query.binds())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ImportError::snapshot(e, format!("column query: {}", sql)))?;

        rows.iter()
            .map(|row| decode_value(row, 0))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| ImportError::snapshot(e, "decoding column"))
    }
}
