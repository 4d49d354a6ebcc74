//! Per-unit counters.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::mapping::{UnitRecord, UnitStatus};

/// Counters collected while a unit runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitStats {
    pub unit: String,

    /// Rows the unit's total query reported, if it has one.
    pub rows_total: Option<i64>,

    /// Snapshot rows read.
    pub rows_processed: u64,

    /// Rows written to the target.
    pub rows_inserted: u64,

    /// Rows mapped onto an existing entity instead of inserted.
    pub rows_merged: u64,

    /// Rows with nothing to do.
    pub rows_skipped: u64,

    /// Rows that could not be migrated.
    pub rows_rejected: u64,

    /// Rows with at least one replaced value.
    pub rows_warned: u64,

    /// Target batches committed.
    pub batches: u64,

    pub duration_seconds: f64,
}

impl UnitStats {
    pub fn new(unit: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            ..Self::default()
        }
    }

    /// Finalize stats with the elapsed time.
    pub fn finalize(&mut self, elapsed: Duration) {
        self.duration_seconds = elapsed.as_secs_f64();
    }

    /// Average throughput in processed rows per second.
    pub fn rows_per_second(&self) -> f64 {
        if self.duration_seconds > 0.0 {
            self.rows_processed as f64 / self.duration_seconds
        } else {
            0.0
        }
    }

    /// Format a human-readable summary.
    pub fn summary(&self) -> String {
        format!(
            "{}: {} processed, {} inserted, {} merged, {} skipped, {} rejected, {} warned in {:.1}s",
            self.unit,
            self.rows_processed,
            self.rows_inserted,
            self.rows_merged,
            self.rows_skipped,
            self.rows_rejected,
            self.rows_warned,
            self.duration_seconds
        )
    }

    /// Run log entry for these counters.
    pub fn to_record(&self, status: UnitStatus, error: Option<String>) -> UnitRecord {
        UnitRecord {
            unit: self.unit.clone(),
            status,
            rows_processed: self.rows_processed as i64,
            rows_inserted: self.rows_inserted as i64,
            rows_merged: self.rows_merged as i64,
            rows_skipped: self.rows_skipped as i64,
            rows_rejected: self.rows_rejected as i64,
            rows_warned: self.rows_warned as i64,
            duration_ms: (self.duration_seconds * 1000.0) as i64,
            error,
        }
    }
}
