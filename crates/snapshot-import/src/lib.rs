//! # snapshot-import
//!
//! Dependency-ordered, idempotent import of a forum snapshot into a
//! relational target.
//!
//! An import is a set of units, one per kind of entity. Each unit declares
//! the units it depends on, reads its rows from the snapshot, transforms
//! them and writes them to the target in batches. Every created or matched
//! target row is recorded in a mapping store, so that:
//!
//! - **Foreign keys** are translated from snapshot ids to target ids
//! - **Reruns** skip everything that was already imported
//! - **Failures** can be resumed by running the import again
//! - **Duplicates** are merged onto one target row by natural key
//!
//! ## Example
//!
//! ```rust,no_run
//! use snapshot_import::{units, Config, Engine};
//!
//! #[tokio::main]
//! async fn main() -> snapshot_import::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let engine = Engine::connect(&config).await?;
//!     let report = engine.run(units::all_units()?).await?;
//!     println!("Imported {} rows", report.rows_inserted);
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod mapping;
pub mod pipeline;
pub mod resolver;
pub mod snapshot;
pub mod target;
pub mod unit;
pub mod units;

pub(crate) mod sqlite;

#[cfg(test)]
mod testing;

// Re-exports for convenient access
pub use cache::SharedCache;
pub use config::{Config, ImportConfig, TargetConfig};
pub use crate::core::{EntityType, NameKind, SourceQuery, SourceRow, SqlValue};
pub use engine::{Engine, HealthCheckResult, PlanReport, RunReport, UnitFailure};
pub use error::{ImportError, Result};
pub use mapping::{MappingStore, RunRecord, RunStatus};
pub use pipeline::{PipelineConfig, ProgressUpdate, UnitStats};
pub use resolver::ExecutionPlan;
pub use snapshot::{SnapshotSource, SqliteSnapshot};
pub use target::{PgTarget, SqliteTarget, TargetStore};
pub use unit::{NewRow, RowRejection, RowWarning, Transformed, Unit, UnitContext, UnitDefinition};
