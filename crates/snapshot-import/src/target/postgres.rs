//! PostgreSQL target.
//!
//! Uses deadpool-postgres for connection pooling. Batches are written with
//! multi-row `INSERT ... RETURNING` statements whose parameters are sent as
//! text and cast in SQL, so one statement shape serves every column type.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{Config as PgConfig, NoTls, Row};
use tracing::{debug, info};

use crate::config::TargetConfig;
use crate::core::identifier::{qualify_table, quote_ident, validate_identifier};
use crate::core::{SourceQuery, SqlNullType, SqlValue};
use crate::error::{ImportError, Result};

use super::{
    decode_ids, encode_ids, journal_ddl, journal_timestamp, InsertBatch, JournalEntry,
    JournaledBatch, TargetStore, JOURNAL_TABLE,
};

/// Connection pool timeout.
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// PostgreSQL bind parameter limit per statement.
const MAX_PARAMS: usize = 65_535;

type Param = Box<dyn ToSql + Sync + Send>;

/// PostgreSQL target store.
pub struct PgTarget {
    pool: Pool,
    schema: String,
}

impl PgTarget {
    /// Connect to the target described by `config`.
    pub async fn new(config: &TargetConfig) -> Result<Self> {
        validate_identifier(&config.schema)?;

        let mut pg_config = PgConfig::new();
        pg_config.host(&config.host);
        pg_config.port(config.port);
        pg_config.dbname(&config.database);
        pg_config.user(&config.user);
        pg_config.password(&config.password);
        pg_config.options(&format!("-c search_path={}", config.schema));

        pg_config.keepalives(true);
        pg_config.keepalives_idle(Duration::from_secs(30));
        pg_config.connect_timeout(POOL_CONNECTION_TIMEOUT);

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let mgr = Manager::from_config(pg_config, NoTls, mgr_config);
        let pool = Pool::builder(mgr)
            .max_size(config.max_connections)
            .build()
            .map_err(|e| ImportError::pool(e, "creating PostgreSQL target pool"))?;

        let client = pool
            .get()
            .await
            .map_err(|e| ImportError::pool(e, "testing PostgreSQL target connection"))?;
        client.simple_query("SELECT 1").await?;

        info!(
            "Connected to PostgreSQL target: {}:{}/{} (schema {})",
            config.host, config.port, config.database, config.schema
        );

        Ok(Self {
            pool,
            schema: config.schema.clone(),
        })
    }

    async fn client(&self, context: &str) -> Result<deadpool_postgres::Object> {
        self.pool
            .get()
            .await
            .map_err(|e| ImportError::pool(e, context.to_string()))
    }

    async fn fetch(&self, query: &SourceQuery) -> Result<Vec<Row>> {
        let client = self.client("acquiring target connection").await?;
        let params = typed_params(query.binds());
        let refs = param_refs(&params);
        let sql = query.sql();
        Ok(client.query(&*sql, &refs).await?)
    }
}

#[async_trait]
impl TargetStore for PgTarget {
    async fn bulk_insert(&self, batch: &InsertBatch) -> Result<Vec<i64>> {
        batch.validate()?;
        if batch.rows.is_empty() {
            return Ok(Vec::new());
        }

        let rows_per_statement = (MAX_PARAMS / batch.columns.len().max(1)).max(1);
        let mut client = self.client("acquiring target connection").await?;
        let tx = client.transaction().await?;
        let mut ids = Vec::with_capacity(batch.rows.len());

        for chunk in batch.rows.chunks(rows_per_statement) {
            let (sql, params) = build_insert_sql(&self.schema, batch, chunk)?;
            let refs = param_refs(&params);

            if batch.returning.is_some() {
                for row in tx.query(sql.as_str(), &refs).await? {
                    ids.push(row.try_get::<_, i64>(0)?);
                }
            } else {
                tx.execute(sql.as_str(), &refs).await?;
            }
        }

        if let Some(JournalEntry {
            batch_id,
            unit,
            payload,
        }) = &batch.journal
        {
            let sql = format!(
                "INSERT INTO {} (batch_id, unit, payload, ids, created_at) VALUES ($1, $2, $3, $4, $5)",
                qualify_table(&self.schema, JOURNAL_TABLE)?
            );
            let ids_json = encode_ids(&ids)?;
            let created_at = journal_timestamp();
            let params: [&(dyn ToSql + Sync); 5] = [batch_id, unit, payload, &ids_json, &created_at];
            tx.execute(sql.as_str(), &params).await?;
        }

        tx.commit().await?;
        debug!("Inserted {} rows into {}", batch.rows.len(), batch.table);
        Ok(ids)
    }

    async fn prepare_journal(&self) -> Result<()> {
        let client = self.client("acquiring target connection").await?;
        let sql = journal_ddl(&qualify_table(&self.schema, JOURNAL_TABLE)?);
        client.batch_execute(&sql).await?;
        Ok(())
    }

    async fn journaled_batches(&self) -> Result<Vec<JournaledBatch>> {
        let client = self.client("acquiring target connection").await?;
        let sql = format!(
            "SELECT batch_id, unit, payload, ids FROM {} ORDER BY created_at, batch_id",
            qualify_table(&self.schema, JOURNAL_TABLE)?
        );
        client
            .query(sql.as_str(), &[])
            .await?
            .iter()
            .map(|row| -> Result<JournaledBatch> {
                Ok(JournaledBatch {
                    entry: JournalEntry {
                        batch_id: row.try_get(0)?,
                        unit: row.try_get(1)?,
                        payload: row.try_get(2)?,
                    },
                    ids: decode_ids(row.try_get::<_, &str>(3)?)?,
                })
            })
            .collect()
    }

    async fn clear_journal(&self, batch_id: &str) -> Result<()> {
        let client = self.client("acquiring target connection").await?;
        let sql = format!(
            "DELETE FROM {} WHERE batch_id = $1",
            qualify_table(&self.schema, JOURNAL_TABLE)?
        );
        client.execute(sql.as_str(), &[&batch_id]).await?;
        Ok(())
    }

    async fn exec(&self, query: &SourceQuery) -> Result<u64> {
        let client = self.client("acquiring target connection").await?;
        let params = typed_params(query.binds());
        let refs = param_refs(&params);
        let sql = query.sql();
        Ok(client.execute(&*sql, &refs).await?)
    }

    async fn count(&self, query: &SourceQuery) -> Result<i64> {
        let rows = self.fetch(query).await?;
        match rows.first() {
            Some(row) => Ok(decode_value(row, 0)?.as_i64().unwrap_or(0)),
            None => Ok(0),
        }
    }

    async fn query_set(&self, query: &SourceQuery) -> Result<HashSet<String>> {
        let rows = self.fetch(query).await?;
        let mut set = HashSet::with_capacity(rows.len());
        for row in &rows {
            let values = (0..row.len())
                .map(|idx| decode_value(row, idx))
                .collect::<Result<Vec<_>>>()?;
            set.insert(super::composite_key(&values));
        }
        Ok(set)
    }

    async fn query_map(&self, query: &SourceQuery) -> Result<HashMap<String, i64>> {
        let rows = self.fetch(query).await?;
        let mut map = HashMap::with_capacity(rows.len());
        for row in &rows {
            if let (Some(key), Some(id)) = (decode_value(row, 0)?.to_key(), decode_value(row, 1)?.as_i64()) {
                map.insert(key, id);
            }
        }
        Ok(map)
    }

    fn store_type(&self) -> &'static str {
        "postgres"
    }
}

fn param_refs(params: &[Param]) -> Vec<&(dyn ToSql + Sync)> {
    params
        .iter()
        .map(|p| &**p as &(dyn ToSql + Sync))
        .collect()
}

/// Get SQL cast suffix for a column, from its first non-NULL value.
fn column_cast(rows: &[Vec<SqlValue>], col_idx: usize) -> &'static str {
    let null_type = rows
        .iter()
        .map(|row| &row[col_idx])
        .find(|v| !v.is_null())
        .or_else(|| rows.first().map(|row| &row[col_idx]))
        .map(SqlValue::null_type)
        .unwrap_or(SqlNullType::Text);

    match null_type {
        SqlNullType::Bool => "::boolean",
        SqlNullType::I64 => "::bigint",
        SqlNullType::F64 => "::double precision",
        SqlNullType::Text => "::text",
        SqlNullType::Bytes => "::bytea",
        SqlNullType::Timestamp => "::timestamptz",
    }
}

/// Build INSERT SQL with text parameters.
fn build_insert_sql(
    schema: &str,
    batch: &InsertBatch,
    rows: &[Vec<SqlValue>],
) -> Result<(String, Vec<Param>)> {
    let col_list = batch
        .columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Result<Vec<_>>>()?
        .join(", ");

    let casts: Vec<&'static str> = (0..batch.columns.len())
        .map(|idx| column_cast(rows, idx))
        .collect();

    let mut placeholders = Vec::with_capacity(rows.len());
    let mut params: Vec<Param> = Vec::with_capacity(rows.len() * batch.columns.len());
    let mut idx = 1;

    for row in rows {
        let row_placeholders: Vec<String> = casts
            .iter()
            .map(|cast| {
                let p = format!("${}{}", idx, cast);
                idx += 1;
                p
            })
            .collect();
        placeholders.push(format!("({})", row_placeholders.join(", ")));
        params.extend(row.iter().map(text_param));
    }

    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES {}",
        qualify_table(schema, batch.table)?,
        col_list,
        placeholders.join(", ")
    );
    if let Some(returning) = batch.returning {
        sql.push_str(" RETURNING ");
        sql.push_str(&quote_ident(returning)?);
    }

    Ok((sql, params))
}

/// Convert a value to a text parameter; the statement casts it back.
fn text_param(value: &SqlValue) -> Param {
    match value {
        SqlValue::Null(_) => Box::new(None::<String>),
        SqlValue::Bool(b) => Box::new(if *b { "t".to_string() } else { "f".to_string() }),
        SqlValue::I64(n) => Box::new(n.to_string()),
        SqlValue::F64(n) => Box::new(n.to_string()),
        SqlValue::Text(s) => Box::new(s.clone()),
        SqlValue::Bytes(b) => Box::new(format!("\\x{}", hex::encode(b))),
        SqlValue::Timestamp(dt) => Box::new(dt.to_rfc3339()),
    }
}

/// Convert a value to a natively typed parameter for ad-hoc queries.
///
/// Unit SQL casts its placeholders (`CAST($1 AS BIGINT)`), so the server infers
/// the matching type.
fn typed_params(values: &[SqlValue]) -> Vec<Param> {
    values
        .iter()
        .map(|value| -> Param {
            match value {
                SqlValue::Null(SqlNullType::Bool) => Box::new(None::<bool>),
                SqlValue::Null(SqlNullType::I64) => Box::new(None::<i64>),
                SqlValue::Null(SqlNullType::F64) => Box::new(None::<f64>),
                SqlValue::Null(SqlNullType::Bytes) => Box::new(None::<Vec<u8>>),
                SqlValue::Null(SqlNullType::Timestamp) => Box::new(None::<DateTime<Utc>>),
                SqlValue::Null(SqlNullType::Text) => Box::new(None::<String>),
                SqlValue::Bool(b) => Box::new(*b),
                SqlValue::I64(n) => Box::new(*n),
                SqlValue::F64(n) => Box::new(*n),
                SqlValue::Text(s) => Box::new(s.clone()),
                SqlValue::Bytes(b) => Box::new(b.clone()),
                SqlValue::Timestamp(dt) => Box::new(*dt),
            }
        })
        .collect()
}

/// Decode one column of a result row.
fn decode_value(row: &Row, idx: usize) -> Result<SqlValue> {
    let ty = row.columns()[idx].type_().clone();
    let value = if ty == Type::BOOL {
        row.try_get::<_, Option<bool>>(idx)?
            .map_or(SqlValue::Null(SqlNullType::Bool), SqlValue::Bool)
    } else if ty == Type::INT2 {
        row.try_get::<_, Option<i16>>(idx)?
            .map_or(SqlValue::Null(SqlNullType::I64), |v| SqlValue::I64(v.into()))
    } else if ty == Type::INT4 {
        row.try_get::<_, Option<i32>>(idx)?
            .map_or(SqlValue::Null(SqlNullType::I64), |v| SqlValue::I64(v.into()))
    } else if ty == Type::INT8 {
        row.try_get::<_, Option<i64>>(idx)?
            .map_or(SqlValue::Null(SqlNullType::I64), SqlValue::I64)
    } else if ty == Type::FLOAT4 {
        row.try_get::<_, Option<f32>>(idx)?
            .map_or(SqlValue::Null(SqlNullType::F64), |v| SqlValue::F64(v.into()))
    } else if ty == Type::FLOAT8 {
        row.try_get::<_, Option<f64>>(idx)?
            .map_or(SqlValue::Null(SqlNullType::F64), SqlValue::F64)
    } else if ty == Type::BYTEA {
        row.try_get::<_, Option<Vec<u8>>>(idx)?
            .map_or(SqlValue::Null(SqlNullType::Bytes), SqlValue::Bytes)
    } else if ty == Type::TIMESTAMPTZ {
        row.try_get::<_, Option<DateTime<Utc>>>(idx)?
            .map_or(SqlValue::Null(SqlNullType::Timestamp), SqlValue::Timestamp)
    } else if ty == Type::TEXT || ty == Type::VARCHAR || ty == Type::NAME || ty == Type::BPCHAR {
        row.try_get::<_, Option<String>>(idx)?
            .map_or(SqlValue::Null(SqlNullType::Text), SqlValue::Text)
    } else {
        return Err(ImportError::target(
            format!("unsupported column type {}", ty),
            format!("decoding column {}", row.columns()[idx].name()),
        ));
    };
    Ok(value)
}
