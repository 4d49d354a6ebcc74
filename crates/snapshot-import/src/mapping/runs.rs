//! Run log stored alongside the mappings.
//!
//! Every run records one `runs` row and one `run_units` row per unit that
//! finished or failed. `status` reads the most recent entry.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;

use crate::error::{ImportError, Result};

use super::MappingStore;

pub(super) const CREATE_RUNS: &str = "CREATE TABLE IF NOT EXISTS runs (
    run_id TEXT PRIMARY KEY,
    config_hash TEXT NOT NULL,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    status TEXT NOT NULL CHECK (status IN ('running', 'completed', 'failed'))
)";

pub(super) const CREATE_RUN_UNITS: &str = "CREATE TABLE IF NOT EXISTS run_units (
    run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
    unit TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('completed', 'failed')),
    rows_processed INTEGER NOT NULL DEFAULT 0,
    rows_inserted INTEGER NOT NULL DEFAULT 0,
    rows_merged INTEGER NOT NULL DEFAULT 0,
    rows_skipped INTEGER NOT NULL DEFAULT 0,
    rows_rejected INTEGER NOT NULL DEFAULT 0,
    rows_warned INTEGER NOT NULL DEFAULT 0,
    duration_ms INTEGER NOT NULL DEFAULT 0,
    error TEXT,
    PRIMARY KEY (run_id, unit)
)";

/// Overall run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

/// Status of one unit within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Completed,
    Failed,
}

/// A recorded run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub config_hash: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub units: Vec<UnitRecord>,
}

/// Per-unit counters of a recorded run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitRecord {
    pub unit: String,
    pub status: UnitStatus,
    pub rows_processed: i64,
    pub rows_inserted: i64,
    pub rows_merged: i64,
    pub rows_skipped: i64,
    pub rows_rejected: i64,
    pub rows_warned: i64,
    pub duration_ms: i64,
    pub error: Option<String>,
}

impl MappingStore {
    /// Record the start of a run.
    pub async fn begin_run(
        &self,
        run_id: &str,
        config_hash: &str,
        started_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO runs (run_id, config_hash, started_at, status) VALUES ($1, $2, $3, $4)",
        )
        .bind(run_id)
        .bind(config_hash)
        .bind(format_time(started_at))
        .bind(run_status_to_str(RunStatus::Running))
        .execute(self.pool())
        .await
        .map_err(|e| ImportError::mappings(e, "recording run start"))?;
        Ok(())
    }

    /// Record the outcome of a unit.
    pub async fn record_unit(&self, run_id: &str, unit: &UnitRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO run_units
             (run_id, unit, status, rows_processed, rows_inserted, rows_merged, rows_skipped,
              rows_rejected, rows_warned, duration_ms, error)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             ON CONFLICT (run_id, unit) DO UPDATE SET
                status = excluded.status,
                rows_processed = excluded.rows_processed,
                rows_inserted = excluded.rows_inserted,
                rows_merged = excluded.rows_merged,
                rows_skipped = excluded.rows_skipped,
                rows_rejected = excluded.rows_rejected,
                rows_warned = excluded.rows_warned,
                duration_ms = excluded.duration_ms,
                error = excluded.error",
        )
        .bind(run_id)
        .bind(unit.unit.as_str())
        .bind(unit_status_to_str(unit.status))
        .bind(unit.rows_processed)
        .bind(unit.rows_inserted)
        .bind(unit.rows_merged)
        .bind(unit.rows_skipped)
        .bind(unit.rows_rejected)
        .bind(unit.rows_warned)
        .bind(unit.duration_ms)
        .bind(unit.error.as_deref())
        .execute(self.pool())
        .await
        .map_err(|e| ImportError::mappings(e, format!("recording unit {}", unit.unit)))?;
        Ok(())
    }

    /// Record the end of a run.
    pub async fn finish_run(
        &self,
        run_id: &str,
        status: RunStatus,
        completed_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE runs SET status = $1, completed_at = $2 WHERE run_id = $3")
            .bind(run_status_to_str(status))
            .bind(format_time(completed_at))
            .bind(run_id)
            .execute(self.pool())
            .await
            .map_err(|e| ImportError::mappings(e, "recording run end"))?;
        Ok(())
    }

    /// Load the most recent run, if any.
    pub async fn latest_run(&self) -> Result<Option<RunRecord>> {
        let row = sqlx::query(
            "SELECT run_id, config_hash, started_at, completed_at, status
             FROM runs
             ORDER BY started_at DESC, rowid DESC
             LIMIT 1",
        )
        .fetch_optional(self.pool())
        .await
        .map_err(|e| ImportError::mappings(e, "loading latest run"))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let decode = |e: sqlx::Error| ImportError::mappings(e, "decoding run");
        let run_id: String = row.try_get(0).map_err(decode)?;
        let config_hash: String = row.try_get(1).map_err(decode)?;
        let started_at: String = row.try_get(2).map_err(decode)?;
        let completed_at: Option<String> = row.try_get(3).map_err(decode)?;
        let status: String = row.try_get(4).map_err(decode)?;

        let unit_rows = sqlx::query(
            "SELECT unit, status, rows_processed, rows_inserted, rows_merged, rows_skipped,
                    rows_rejected, rows_warned, duration_ms, error
             FROM run_units
             WHERE run_id = $1
             ORDER BY rowid",
        )
        .bind(run_id.as_str())
        .fetch_all(self.pool())
        .await
        .map_err(|e| ImportError::mappings(e, "loading run units"))?;

        let mut units = Vec::with_capacity(unit_rows.len());
        for row in unit_rows {
            let status: String = row.try_get(1).map_err(decode)?;
            units.push(UnitRecord {
                unit: row.try_get(0).map_err(decode)?,
                status: str_to_unit_status(&status)?,
                rows_processed: row.try_get(2).map_err(decode)?,
                rows_inserted: row.try_get(3).map_err(decode)?,
                rows_merged: row.try_get(4).map_err(decode)?,
                rows_skipped: row.try_get(5).map_err(decode)?,
                rows_rejected: row.try_get(6).map_err(decode)?,
                rows_warned: row.try_get(7).map_err(decode)?,
                duration_ms: row.try_get(8).map_err(decode)?,
                error: row.try_get(9).map_err(decode)?,
            });
        }

        Ok(Some(RunRecord {
            run_id,
            config_hash,
            started_at: parse_time(&started_at)?,
            completed_at: completed_at.as_deref().map(parse_time).transpose()?,
            status: str_to_run_status(&status)?,
            units,
        }))
    }
}

fn format_time(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| ImportError::mappings(e, format!("invalid run timestamp '{}'", s)))
}

fn run_status_to_str(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Running => "running",
        RunStatus::Completed => "completed",
        RunStatus::Failed => "failed",
    }
}

fn str_to_run_status(s: &str) -> Result<RunStatus> {
    match s {
        "running" => Ok(RunStatus::Running),
        "completed" => Ok(RunStatus::Completed),
        "failed" => Ok(RunStatus::Failed),
        _ => Err(ImportError::Config(format!("Invalid run status: {}", s))),
    }
}

fn unit_status_to_str(status: UnitStatus) -> &'static str {
    match status {
        UnitStatus::Completed => "completed",
        UnitStatus::Failed => "failed",
    }
}

fn str_to_unit_status(s: &str) -> Result<UnitStatus> {
    match s {
        "completed" => Ok(UnitStatus::Completed),
        "failed" => Ok(UnitStatus::Failed),
        _ => Err(ImportError::Config(format!("Invalid unit status: {}", s))),
    }
}
