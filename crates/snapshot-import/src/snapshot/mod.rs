//! Read-only access to the exported snapshot.
//!
//! The snapshot is produced by an external converter. The importer only ever
//! reads it, through parameterized queries declared by the units.

mod sqlite;

pub use sqlite::SqliteSnapshot;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::core::{SourceQuery, SourceRow, SqlValue};
use crate::error::Result;

/// Read rows from the snapshot.
///
/// # Streaming
///
/// [`stream_rows`](SnapshotSource::stream_rows) returns a bounded channel
/// receiver fed by a background task, so a unit's rows are never held in
/// memory all at once and the reader pauses while the pipeline writes.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Start streaming the rows of `query`.
    ///
    /// The receiver yields rows in query order and closes after the last row
    /// or after the first error.
    fn stream_rows(&self, query: &SourceQuery, buffer: usize) -> mpsc::Receiver<Result<SourceRow>>;

    /// Fetch all rows of a (small) query.
    async fn query_rows(&self, query: &SourceQuery) -> Result<Vec<SourceRow>>;

    /// Fetch the first column of the first row, if any.
    async fn query_scalar(&self, query: &SourceQuery) -> Result<Option<SqlValue>>;

    /// Fetch the first column of every row.
    async fn query_column(&self, query: &SourceQuery) -> Result<Vec<SqlValue>>;

    /// Check that the snapshot is reachable.
    async fn ping(&self) -> Result<()> {
        self.query_scalar(&SourceQuery::new("SELECT 1")).await?;
        Ok(())
    }
}
