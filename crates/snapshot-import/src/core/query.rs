//! Parameterized query values.
//!
//! Queries are built once when a unit is registered. The SQL text is always a
//! `'static` string; data only ever travels through binds.

use std::borrow::Cow;

use super::value::SqlValue;

/// A parameterized SQL query with an optional explicit ordering.
///
/// Placeholders use the `$N` form, understood by both SQLite and PostgreSQL.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceQuery {
    sql: &'static str,
    binds: Vec<SqlValue>,
    order_by: Vec<&'static str>,
}

impl SourceQuery {
    /// Create a query from static SQL text.
    pub fn new(sql: &'static str) -> Self {
        Self {
            sql,
            binds: Vec::new(),
            order_by: Vec::new(),
        }
    }

    /// Append a bind value for the next placeholder.
    pub fn bind(mut self, value: impl Into<SqlValue>) -> Self {
        self.binds.push(value.into());
        self
    }

    /// Order the result by the given expressions.
    ///
    /// Appended as a trailing `ORDER BY`, so the SQL must not carry its own.
    pub fn order_by(mut self, keys: &[&'static str]) -> Self {
        self.order_by.extend_from_slice(keys);
        self
    }

    /// Whether an explicit ordering key was declared.
    pub fn is_ordered(&self) -> bool {
        !self.order_by.is_empty()
    }

    /// Final SQL text.
    pub fn sql(&self) -> Cow<'static, str> {
        if self.order_by.is_empty() {
            Cow::Borrowed(self.sql)
        } else {
            Cow::Owned(format!(
                "{} ORDER BY {}",
                self.sql.trim_end().trim_end_matches(';'),
                self.order_by.join(", ")
            ))
        }
    }

    /// Bind values in placeholder order.
    pub fn binds(&self) -> &[SqlValue] {
        &self.binds
    }

    /// Number of distinct `$N` placeholders referenced by the SQL.
    pub fn placeholder_count(&self) -> usize {
        let bytes = self.sql.as_bytes();
        let mut max = 0usize;
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'$' {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                if end > start {
                    if let Ok(n) = self.sql[start..end].parse::<usize>() {
                        max = max.max(n);
                    }
                }
                i = end;
            } else {
                i += 1;
            }
        }
        max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unordered_sql_is_borrowed() {
        let q = SourceQuery::new("SELECT * FROM users");
        assert!(matches!(q.sql(), Cow::Borrowed(_)));
        assert!(!q.is_ordered());
    }

    #[test]
    fn test_order_by_is_appended() {
        let q = SourceQuery::new("SELECT * FROM categories;").order_by(&["depth", "id"]);
        assert_eq!(q.sql(), "SELECT * FROM categories ORDER BY depth, id");
        assert!(q.is_ordered());
    }

    #[test]
    fn test_binds_and_placeholders() {
        let q = SourceQuery::new("SELECT * FROM t WHERE a = $1 AND b = $2 OR c = $1")
            .bind("user")
            .bind(3i64);
        assert_eq!(q.placeholder_count(), 2);
        assert_eq!(q.binds().len(), 2);
        assert_eq!(q.binds()[0], SqlValue::Text("user".into()));
    }
}
