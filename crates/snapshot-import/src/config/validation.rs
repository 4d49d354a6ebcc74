//! Configuration validation.

use super::Config;
use crate::error::{ImportError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    if config.snapshot.path.as_os_str().is_empty() {
        return Err(ImportError::Config("snapshot.path is required".into()));
    }
    if config.mappings.path.as_os_str().is_empty() {
        return Err(ImportError::Config("mappings.path is required".into()));
    }
    if config.snapshot.path == config.mappings.path {
        return Err(ImportError::Config(
            "snapshot and mappings cannot be the same file".into(),
        ));
    }

    match config.target.r#type.as_str() {
        "postgres" => {
            if config.target.host.is_empty() {
                return Err(ImportError::Config("target.host is required".into()));
            }
            if config.target.database.is_empty() {
                return Err(ImportError::Config("target.database is required".into()));
            }
            if config.target.user.is_empty() {
                return Err(ImportError::Config("target.user is required".into()));
            }
        }
        "sqlite" => match &config.target.path {
            None => {
                return Err(ImportError::Config(
                    "target.path is required for sqlite targets".into(),
                ))
            }
            Some(path) if path == &config.snapshot.path || path == &config.mappings.path => {
                return Err(ImportError::Config(
                    "target.path must differ from snapshot and mappings".into(),
                ))
            }
            Some(_) => {}
        },
        other => {
            return Err(ImportError::Config(format!(
                "target.type must be 'postgres' or 'sqlite', got '{}'",
                other
            )))
        }
    }

    if config.target.max_connections == 0 {
        return Err(ImportError::Config(
            "target.max_connections must be at least 1".into(),
        ));
    }
    if config.import.batch_size == 0 {
        return Err(ImportError::Config(
            "import.batch_size must be at least 1".into(),
        ));
    }
    if config.import.read_ahead_rows == 0 {
        return Err(ImportError::Config(
            "import.read_ahead_rows must be at least 1".into(),
        ));
    }

    Ok(())
}
