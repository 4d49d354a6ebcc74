//! Configuration type definitions.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Read-only snapshot database.
    pub snapshot: SnapshotConfig,

    /// Durable mapping store.
    pub mappings: MappingsConfig,

    /// Target database configuration.
    pub target: TargetConfig,

    /// Import behavior configuration.
    #[serde(default)]
    pub import: ImportConfig,
}

/// Snapshot (SQLite export) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Path to the snapshot SQLite file.
    pub path: PathBuf,
}

/// Mapping store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingsConfig {
    /// Path to the mapping store SQLite file (created if missing).
    pub path: PathBuf,
}

/// Target database configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Database type: "postgres" or "sqlite".
    #[serde(default = "default_postgres")]
    pub r#type: String,

    /// Database host (postgres).
    #[serde(default)]
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Database name (postgres).
    #[serde(default)]
    pub database: String,

    /// Username (postgres).
    #[serde(default)]
    pub user: String,

    /// Password (postgres).
    #[serde(default)]
    pub password: String,

    /// Target schema (default: "public").
    #[serde(default = "default_public_schema")]
    pub schema: String,

    /// Database file (sqlite).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// Maximum pooled connections (default: 4).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl std::fmt::Debug for TargetConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetConfig")
            .field("type", &self.r#type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("schema", &self.schema)
            .field("path", &self.path)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

impl TargetConfig {
    /// Whether the target is a PostgreSQL database.
    pub fn is_postgres(&self) -> bool {
        self.r#type == "postgres"
    }
}

/// Import behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportConfig {
    /// Rows per target insert. Units may override.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Rows buffered between the snapshot reader and the pipeline.
    #[serde(default = "default_read_ahead_rows")]
    pub read_ahead_rows: usize,

    /// Row warnings kept in the run report; the rest are only counted.
    #[serde(default = "default_max_reported_warnings")]
    pub max_reported_warnings: usize,

    /// Rejected rows listed in the run report; the rest are only counted.
    #[serde(default = "default_max_reported_rejections")]
    pub max_reported_rejections: usize,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            read_ahead_rows: default_read_ahead_rows(),
            max_reported_warnings: default_max_reported_warnings(),
            max_reported_rejections: default_max_reported_rejections(),
        }
    }
}

fn default_postgres() -> String {
    "postgres".to_string()
}

fn default_pg_port() -> u16 {
    5432
}

fn default_public_schema() -> String {
    "public".to_string()
}

fn default_max_connections() -> usize {
    4
}

fn default_batch_size() -> usize {
    1_000
}

fn default_read_ahead_rows() -> usize {
    5_000
}

fn default_max_reported_warnings() -> usize {
    1_000
}

fn default_max_reported_rejections() -> usize {
    1_000
}
