//! Error types for the import library.

use thiserror::Error;

/// Main error type for import operations.
#[derive(Error, Debug)]
pub enum ImportError {
    /// Configuration error (invalid YAML, unit registration, dependency graph).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Snapshot database query error
    #[error("Snapshot error: {message}\n  Context: {context}")]
    Snapshot { message: String, context: String },

    /// Mapping store query or write error
    #[error("Mapping store error: {message}\n  Context: {context}")]
    Mappings { message: String, context: String },

    /// Target database connection or query error
    #[error("Target database error: {0}")]
    Target(#[from] tokio_postgres::Error),

    /// Target write or query error with context
    #[error("Target error: {message}\n  Context: {context}")]
    TargetQuery { message: String, context: String },

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// An original id was already mapped to a different target id.
    #[error(
        "Mapping conflict for {entity_type} '{original_id}': already mapped to {existing}, refusing {attempted}"
    )]
    MappingConflict {
        entity_type: String,
        original_id: String,
        existing: i64,
        attempted: i64,
    },

    /// A unit failed while running; aborts the run.
    #[error("Unit {unit} failed: {message}")]
    Step { unit: String, message: String },

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ImportError {
    /// Create a Snapshot error with context about where it occurred
    pub fn snapshot(message: impl ToString, context: impl Into<String>) -> Self {
        ImportError::Snapshot {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a Mappings error with context about where it occurred
    pub fn mappings(message: impl ToString, context: impl Into<String>) -> Self {
        ImportError::Mappings {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a TargetQuery error with context about where it occurred
    pub fn target(message: impl ToString, context: impl Into<String>) -> Self {
        ImportError::TargetQuery {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl ToString, context: impl Into<String>) -> Self {
        ImportError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Wrap any error as the failure of a unit.
    ///
    /// Errors that already name a unit are passed through unchanged.
    pub fn step(unit: impl Into<String>, err: ImportError) -> Self {
        match err {
            ImportError::Step { .. } => err,
            other => ImportError::Step {
                unit: unit.into(),
                message: other.to_string(),
            },
        }
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            ImportError::Config(_) | ImportError::Yaml(_) => 2,
            ImportError::Snapshot { .. }
            | ImportError::Mappings { .. }
            | ImportError::Target(_)
            | ImportError::TargetQuery { .. }
            | ImportError::Pool { .. } => 3,
            ImportError::Step { .. } | ImportError::MappingConflict { .. } => 4,
            ImportError::Io(_) | ImportError::Json(_) => 1,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for import operations.
pub type Result<T> = std::result::Result<T, ImportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_wraps_once() {
        let err = ImportError::step("users", ImportError::Config("bad".into()));
        let err = ImportError::step("posts", err);
        match err {
            ImportError::Step { unit, message } => {
                assert_eq!(unit, "users");
                assert!(message.contains("bad"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(ImportError::Config("x".into()).exit_code(), 2);
        assert_eq!(ImportError::snapshot("x", "y").exit_code(), 3);
        assert_eq!(
            ImportError::Step {
                unit: "u".into(),
                message: "m".into()
            }
            .exit_code(),
            4
        );
    }

    #[test]
    fn test_format_detailed_includes_message() {
        let err = ImportError::mappings("disk full", "recording batch");
        let detailed = err.format_detailed();
        assert!(detailed.starts_with("Error: Mapping store error: disk full"));
        assert!(detailed.contains("recording batch"));
    }
}
