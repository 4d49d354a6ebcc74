//! Shared fixtures for tests that run units end to end.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;

use crate::core::SourceQuery;
use crate::engine::Engine;
use crate::error::{ImportError, Result};
use crate::mapping::MappingStore;
use crate::pipeline::PipelineConfig;
use crate::snapshot::SqliteSnapshot;
use crate::target::{InsertBatch, JournaledBatch, SqliteTarget, TargetStore};

/// Snapshot, mapping store and target in a temporary directory.
pub struct TestEnv {
    pub dir: TempDir,
    pub snapshot_path: PathBuf,
    pub snapshot: Arc<SqliteSnapshot>,
    pub mappings: Arc<MappingStore>,
    pub target: Arc<SqliteTarget>,
}

impl TestEnv {
    /// Create the stores, loading `snapshot_sql` into the snapshot and
    /// `target_sql` into the target.
    pub async fn new(snapshot_sql: &str, target_sql: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let snapshot_path = dir.path().join("snapshot.db");

        let writer = SqliteTarget::open(&snapshot_path).await.unwrap();
        writer.execute_script(snapshot_sql).await.unwrap();
        drop(writer);

        let mappings = MappingStore::open(&dir.path().join("mappings.db")).await.unwrap();
        let snapshot = SqliteSnapshot::open(&snapshot_path, mappings.path()).await.unwrap();
        let target = SqliteTarget::open(&dir.path().join("target.db")).await.unwrap();
        target.execute_script(target_sql).await.unwrap();

        Self {
            dir,
            snapshot_path,
            snapshot: Arc::new(snapshot),
            mappings: Arc::new(mappings),
            target: Arc::new(target),
        }
    }

    /// Change the snapshot between runs.
    pub async fn update_snapshot(&self, sql: &str) {
        let writer = SqliteTarget::open(&self.snapshot_path).await.unwrap();
        writer.execute_script(sql).await.unwrap();
    }

    /// Run a script directly against the mapping store file.
    pub async fn update_mappings(&self, sql: &str) {
        let writer = SqliteTarget::open(self.mappings.path()).await.unwrap();
        writer.execute_script(sql).await.unwrap();
    }

    pub fn engine(&self, batch_size: usize) -> Engine {
        self.engine_with_target(self.target.clone(), batch_size)
    }

    pub fn engine_with_target(&self, target: Arc<dyn TargetStore>, batch_size: usize) -> Engine {
        Engine::new(self.snapshot.clone(), self.mappings.clone(), target)
            .with_pipeline_config(PipelineConfig::default().with_batch_size(batch_size))
    }

    pub async fn count(&self, sql: &'static str) -> i64 {
        self.target.count(&SourceQuery::new(sql)).await.unwrap()
    }
}

/// Target that fails the n-th insert into one table.
pub struct FailingTarget {
    inner: Arc<SqliteTarget>,
    table: &'static str,
    fail_on: usize,
    seen: AtomicUsize,
}

impl FailingTarget {
    pub fn new(inner: Arc<SqliteTarget>, table: &'static str, fail_on: usize) -> Self {
        Self {
            inner,
            table,
            fail_on,
            seen: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl TargetStore for FailingTarget {
    async fn bulk_insert(&self, batch: &InsertBatch) -> Result<Vec<i64>> {
        if batch.table == self.table && self.seen.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
            return Err(ImportError::target("connection reset", format!("inserting into {}", batch.table)));
        }
        self.inner.bulk_insert(batch).await
    }

    async fn prepare_journal(&self) -> Result<()> {
        self.inner.prepare_journal().await
    }

    async fn journaled_batches(&self) -> Result<Vec<JournaledBatch>> {
        self.inner.journaled_batches().await
    }

    async fn clear_journal(&self, batch_id: &str) -> Result<()> {
        self.inner.clear_journal(batch_id).await
    }

    async fn exec(&self, query: &SourceQuery) -> Result<u64> {
        self.inner.exec(query).await
    }

    async fn count(&self, query: &SourceQuery) -> Result<i64> {
        self.inner.count(query).await
    }

    async fn query_set(&self, query: &SourceQuery) -> Result<HashSet<String>> {
        self.inner.query_set(query).await
    }

    async fn query_map(&self, query: &SourceQuery) -> Result<HashMap<String, i64>> {
        self.inner.query_map(query).await
    }

    fn store_type(&self) -> &'static str {
        "failing"
    }
}
