//! sqlx helpers shared by the SQLite-backed stores.

use std::sync::Arc;

use chrono::SecondsFormat;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Column, Row, Sqlite, TypeInfo, ValueRef};

use crate::core::{SourceRow, SqlNullType, SqlValue};

pub(crate) type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// Bind every value to the query, in order.
pub(crate) fn bind_values<'q>(mut query: SqliteQuery<'q>, values: &'q [SqlValue]) -> SqliteQuery<'q> {
    for value in values {
        query = bind_value(query, value);
    }
    query
}

/// Bind one value. Timestamps are stored as RFC 3339 text.
pub(crate) fn bind_value<'q>(query: SqliteQuery<'q>, value: &'q SqlValue) -> SqliteQuery<'q> {
    match value {
        SqlValue::Null(_) => query.bind(None::<i64>),
        SqlValue::Bool(v) => query.bind(*v),
        SqlValue::I64(v) => query.bind(*v),
        SqlValue::F64(v) => query.bind(*v),
        SqlValue::Text(v) => query.bind(v.as_str()),
        SqlValue::Bytes(v) => query.bind(v.as_slice()),
        SqlValue::Timestamp(v) => query.bind(v.to_rfc3339_opts(SecondsFormat::Secs, true)),
    }
}

/// Shared column names of a result row.
pub(crate) fn column_names(row: &SqliteRow) -> Arc<[String]> {
    row.columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect::<Vec<_>>()
        .into()
}

/// Decode a column by the storage class of its value.
pub(crate) fn decode_value(row: &SqliteRow, idx: usize) -> Result<SqlValue, sqlx::Error> {
    let raw = row.try_get_raw(idx)?;
    if raw.is_null() {
        return Ok(SqlValue::Null(SqlNullType::Text));
    }
    let storage = raw.type_info().name().to_ascii_uppercase();
    let value = match storage.as_str() {
        "INTEGER" | "INT" | "BIGINT" | "BOOLEAN" => SqlValue::I64(row.try_get_unchecked(idx)?),
        "REAL" | "FLOAT" | "DOUBLE" => SqlValue::F64(row.try_get_unchecked(idx)?),
        "BLOB" => SqlValue::Bytes(row.try_get_unchecked(idx)?),
        _ => SqlValue::Text(row.try_get_unchecked(idx)?),
    };
    Ok(value)
}

/// Decode a full row, sharing `columns` between rows of one result.
pub(crate) fn decode_row(row: &SqliteRow, columns: &Arc<[String]>) -> Result<SourceRow, sqlx::Error> {
    let values = (0..row.columns().len())
        .map(|idx| decode_value(row, idx))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(SourceRow::new(columns.clone(), values))
}
