//! Rows read from the snapshot.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};

use crate::error::{ImportError, Result};

use super::value::SqlValue;

/// A single snapshot row with named columns.
///
/// Column names are shared between all rows of one query result.
#[derive(Debug, Clone)]
pub struct SourceRow {
    columns: Arc<[String]>,
    values: Vec<SqlValue>,
}

impl SourceRow {
    /// Create a row from shared column names and its values.
    pub fn new(columns: Arc<[String]>, values: Vec<SqlValue>) -> Self {
        Self { columns, values }
    }

    /// Column names, in query order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Values, in query order.
    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }

    /// Get a value by column name.
    ///
    /// A missing column is a programming error in the unit's query, not a data error.
    pub fn get(&self, column: &str) -> Result<&SqlValue> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|idx| &self.values[idx])
            .ok_or_else(|| {
                ImportError::Config(format!(
                    "snapshot row has no column '{}' (columns: {})",
                    column,
                    self.columns.join(", ")
                ))
            })
    }

    /// Text value of a column; NULL and blank strings are `None`.
    pub fn text(&self, column: &str) -> Result<Option<String>> {
        Ok(match self.get(column)? {
            SqlValue::Text(s) if s.trim().is_empty() => None,
            SqlValue::Text(s) => Some(s.clone()),
            other => other.to_key(),
        })
    }

    /// Integer value of a column.
    pub fn i64(&self, column: &str) -> Result<Option<i64>> {
        Ok(self.get(column)?.as_i64())
    }

    /// Boolean value of a column.
    pub fn bool(&self, column: &str) -> Result<Option<bool>> {
        Ok(self.get(column)?.as_bool())
    }

    /// Key view of a column, used for original ids and foreign keys.
    pub fn key(&self, column: &str) -> Result<Option<String>> {
        Ok(self
            .get(column)?
            .to_key()
            .filter(|key| !key.trim().is_empty()))
    }
}

/// Parse a snapshot timestamp.
///
/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[.fff]`, plain dates and unix seconds.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|n| Utc.from_utc_datetime(&n));
    }
    raw.parse::<i64>()
        .ok()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}
