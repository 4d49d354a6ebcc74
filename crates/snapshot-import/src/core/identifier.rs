//! Identifier validation and quoting for generated SQL.
//!
//! Table and column names cannot be passed as bind parameters, so the bulk
//! insert statements built by the target writers splice them into SQL text.
//! Every identifier is validated when a unit is registered and quoted when
//! the statement is built.

use crate::error::{ImportError, Result};

/// Maximum identifier length (PostgreSQL limit).
const MAX_IDENTIFIER_LENGTH: usize = 63;

/// Validate an identifier.
///
/// Rejects empty names, names with null bytes, names over 63 bytes and
/// anything outside `[A-Za-z0-9_]` that does not start with a letter or `_`.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ImportError::Config("Identifier cannot be empty".to_string()));
    }

    if name.contains('\0') {
        return Err(ImportError::Config(format!(
            "SECURITY: Identifier contains null byte: {:?}",
            name
        )));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(ImportError::Config(format!(
            "Identifier exceeds maximum length of {} bytes (got {} bytes): {:?}",
            MAX_IDENTIFIER_LENGTH,
            name.len(),
            name
        )));
    }

    let mut chars = name.chars();
    let first_ok = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if !first_ok || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ImportError::Config(format!(
            "Identifier must match [A-Za-z_][A-Za-z0-9_]*: {:?}",
            name
        )));
    }

    Ok(())
}

/// Quote an identifier with double quotes (PostgreSQL and SQLite).
pub fn quote_ident(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// Quote a schema-qualified table name.
pub fn qualify_table(schema: &str, table: &str) -> Result<String> {
    Ok(format!("{}.{}", quote_ident(schema)?, quote_ident(table)?))
}
