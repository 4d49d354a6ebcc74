//! Row pipeline: stream, transform, batch, insert, map.
//!
//! One unit runs at a time. Its rows are streamed from the snapshot through a
//! bounded channel, transformed one by one, and accumulated into batches.
//! Each batch is inserted into the target in one transaction together with a
//! journal entry describing its mappings, and the mappings are recorded right
//! after, before the next batch starts. If recording fails, the journal entry
//! survives with the rows and [`recover_journal`] records the mappings at the
//! start of the next run. A row is therefore either fully migrated (row
//! written and mapping recorded) or not touched at all.
//!
//! # Self references
//!
//! Before a row of a self-referencing unit is transformed, the referenced
//! original id is resolved in this order:
//!
//! 1. rows of this unit committed earlier in the run
//! 2. the pending batch (which is flushed first)
//! 3. the mapping store (rows imported by earlier runs)
//!
//! A reference that resolves nowhere rejects the row.

mod journal;
mod stats;

pub use journal::recover_journal;
pub use stats::UnitStats;

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::cache::SharedCache;
use crate::config::ImportConfig;
use crate::core::{SourceRow, SqlValue};
use crate::error::{ImportError, Result};
use crate::mapping::MappingStore;
use crate::snapshot::SnapshotSource;
use crate::target::{composite_key, InsertBatch, JournalEntry, TargetStore};
use crate::unit::{
    NewRow, PreloadKind, PreloadSource, Preloaded, RowRejection, RowWarning, Transformed, Unit,
    UnitContext, UnitDefinition,
};

use journal::{AliasMapping, AliasRef, BatchMappings, RowMapping};

/// Configuration for pipeline behavior.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Rows per target insert, unless the unit overrides it.
    pub batch_size: usize,

    /// Rows buffered between the snapshot reader and the pipeline.
    pub read_ahead_rows: usize,

    /// Row warnings kept per unit; the rest are only counted.
    pub max_reported_warnings: usize,

    /// Rejected rows kept per unit; the rest are only counted.
    pub max_reported_rejections: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from(&ImportConfig::default())
    }
}

impl From<&ImportConfig> for PipelineConfig {
    fn from(config: &ImportConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            read_ahead_rows: config.read_ahead_rows.max(1),
            max_reported_warnings: config.max_reported_warnings,
            max_reported_rejections: config.max_reported_rejections,
        }
    }
}

impl PipelineConfig {
    /// Set the batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }
}

/// The stores a unit works against.
#[derive(Clone, Copy)]
pub struct Stores<'a> {
    pub snapshot: &'a dyn SnapshotSource,
    pub mappings: &'a MappingStore,
    pub target: &'a dyn TargetStore,
    pub cache: &'a SharedCache,
}

/// Progress notification sent while units run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub unit: String,
    pub rows_total: Option<i64>,
    pub rows_processed: u64,
    pub rows_inserted: u64,
    pub finished: bool,
}

/// Result of running one unit.
#[derive(Debug)]
pub struct UnitOutcome {
    pub stats: UnitStats,
    pub warnings: Vec<RowWarning>,
    pub warning_count: u64,
    pub rejections: Vec<RowRejection>,
    pub result: Result<()>,
}

/// Run one unit to completion.
///
/// Errors are wrapped as step failures of the unit. Batches committed before
/// the error stay committed.
pub async fn run_unit(
    unit: &mut dyn Unit,
    stores: Stores<'_>,
    config: &PipelineConfig,
    progress: Option<&mpsc::Sender<ProgressUpdate>>,
) -> UnitOutcome {
    let started = Instant::now();
    let def = unit.definition().clone();
    let name = def.name();
    info!("{}: starting", name);

    let mut runner = Runner {
        def: &def,
        stores,
        batch_size: def.batch_size().unwrap_or(config.batch_size).max(1),
        read_ahead_rows: config.read_ahead_rows.max(1),
        pending: PendingBatch::default(),
        committed: HashMap::new(),
        committed_keys: HashMap::new(),
        seen_keys: HashSet::new(),
        rejections: Vec::new(),
        max_reported_rejections: config.max_reported_rejections,
        stats: UnitStats::new(name),
        progress,
    };
    let mut ctx = UnitContext::new(
        name,
        stores.mappings,
        stores.cache,
        stores.target,
        Preloaded::new(),
        config.max_reported_warnings,
    );

    let result = runner
        .run(unit, &mut ctx)
        .await
        .map_err(|e| ImportError::step(name, e));

    runner.stats.finalize(started.elapsed());
    match &result {
        Ok(()) => info!("{}", runner.stats.summary()),
        Err(e) => error!("{}: failed - {}", name, e),
    }
    runner.report_progress(true);

    UnitOutcome {
        warning_count: ctx.warning_count(),
        warnings: ctx.take_warnings(),
        rejections: runner.rejections,
        stats: runner.stats,
        result,
    }
}

/// Load the unit's preloaded sets and maps.
pub async fn load_preloads(def: &UnitDefinition, stores: Stores<'_>) -> Result<Preloaded> {
    let mut preloaded = Preloaded::new();

    for preload in def.preloads() {
        let query = &preload.query;
        let entries = match (preload.source, preload.kind) {
            (PreloadSource::Target, PreloadKind::Set) => {
                let set = stores.target.query_set(query).await?;
                let len = set.len();
                preloaded.put_set(preload.name, set);
                len
            }
            (PreloadSource::Target, PreloadKind::Map) => {
                let map = stores.target.query_map(query).await?;
                let len = map.len();
                preloaded.put_map(preload.name, map);
                len
            }
            (PreloadSource::Mappings, PreloadKind::Set) => {
                let set = stores.mappings.existing_set(query).await?;
                let len = set.len();
                preloaded.put_set(preload.name, set);
                len
            }
            (PreloadSource::Mappings, PreloadKind::Map) => {
                let map = stores.mappings.existing_mapping(query).await?;
                let len = map.len();
                preloaded.put_map(preload.name, map);
                len
            }
            (PreloadSource::Snapshot, PreloadKind::Set) => {
                let rows = stores.snapshot.query_rows(query).await?;
                let set: HashSet<String> = rows.iter().map(|r| composite_key(r.values())).collect();
                let len = set.len();
                preloaded.put_set(preload.name, set);
                len
            }
            (PreloadSource::Snapshot, PreloadKind::Map) => {
                let rows = stores.snapshot.query_rows(query).await?;
                let map: HashMap<String, i64> = rows
                    .iter()
                    .filter_map(|r| match r.values() {
                        [key, id, ..] => Some((key.to_key()?, id.as_i64()?)),
                        _ => None,
                    })
                    .collect();
                let len = map.len();
                preloaded.put_map(preload.name, map);
                len
            }
        };
        debug!("{}: preloaded '{}' ({} entries)", def.name(), preload.name, entries);
    }

    Ok(preloaded)
}

/// Where an alias points.
#[derive(Debug)]
enum AliasTarget {
    Id(i64),
    Key(String),
}

#[derive(Debug)]
struct PendingRow {
    original_id: Option<String>,
    row: NewRow,
}

#[derive(Debug)]
struct PendingAlias {
    original_id: String,
    target: AliasTarget,
}

/// Rows and aliases waiting for the next flush.
#[derive(Debug, Default)]
struct PendingBatch {
    rows: Vec<PendingRow>,
    aliases: Vec<PendingAlias>,
    originals: HashSet<String>,
    keys: HashSet<String>,
}

impl PendingBatch {
    fn len(&self) -> usize {
        self.rows.len() + self.aliases.len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn contains_original(&self, original_id: &str) -> bool {
        self.originals.contains(original_id)
    }

    fn contains_key(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    fn push_row(&mut self, original_id: Option<String>, row: NewRow) {
        if let Some(id) = &original_id {
            self.originals.insert(id.clone());
        }
        if let Some(key) = &row.natural_key {
            self.keys.insert(key.clone());
        }
        self.rows.push(PendingRow { original_id, row });
    }

    fn push_alias(&mut self, original_id: String, target: AliasTarget) {
        self.originals.insert(original_id.clone());
        self.aliases.push(PendingAlias {
            original_id,
            target,
        });
    }
}

struct Runner<'r, 's> {
    def: &'r UnitDefinition,
    stores: Stores<'s>,
    batch_size: usize,
    read_ahead_rows: usize,
    pending: PendingBatch,
    /// Original id → target id for rows committed by this unit in this run.
    committed: HashMap<String, i64>,
    /// Natural key → target id for rows inserted by this unit in this run.
    committed_keys: HashMap<String, i64>,
    /// Natural keys seen by units that produce no mappings.
    seen_keys: HashSet<String>,
    rejections: Vec<RowRejection>,
    max_reported_rejections: usize,
    stats: UnitStats,
    progress: Option<&'r mpsc::Sender<ProgressUpdate>>,
}

impl Runner<'_, '_> {
    async fn run(&mut self, unit: &mut dyn Unit, ctx: &mut UnitContext<'_>) -> Result<()> {
        *ctx.preloaded_mut() = load_preloads(self.def, self.stores).await?;

        if let Some(total) = self.def.total_rows_query() {
            self.stats.rows_total = self
                .stores
                .snapshot
                .query_scalar(total)
                .await?
                .and_then(|v| v.as_i64());
        }

        let mut rows = self
            .stores
            .snapshot
            .stream_rows(self.def.rows_query(), self.read_ahead_rows);

        while let Some(row) = rows.recv().await {
            let row = row?;
            self.stats.rows_processed += 1;
            self.process_row(unit, ctx, &row).await?;

            if self.pending.len() >= self.batch_size {
                self.flush().await?;
            }
        }

        self.flush().await?;
        unit.after(ctx, self.stats.rows_inserted).await?;
        Ok(())
    }

    async fn process_row(
        &mut self,
        unit: &mut dyn Unit,
        ctx: &mut UnitContext<'_>,
        row: &SourceRow,
    ) -> Result<()> {
        let id_column = self.def.original_id_column();
        let original_id = if self.def.produces().is_some() {
            match row.key(id_column)? {
                Some(id) => Some(id),
                None => {
                    self.reject(None, format!("missing original id in column '{}'", id_column));
                    return Ok(());
                }
            }
        } else {
            row.key(id_column).ok().flatten()
        };

        let self_reference = match self.def.self_reference() {
            Some(column) => match row.key(column)? {
                Some(referenced) => match self.resolve_self_reference(&referenced).await? {
                    Some(id) => Some(id),
                    None => {
                        self.reject(
                            original_id.as_deref(),
                            format!("unresolved {} '{}'", column, referenced),
                        );
                        return Ok(());
                    }
                },
                None => None,
            },
            None => None,
        };

        ctx.begin_row(original_id.clone(), self_reference);
        let transformed = unit.transform(ctx, row).await;
        if ctx.end_row() {
            self.stats.rows_warned += 1;
        }

        match transformed? {
            Transformed::Insert(new_row) => self.accept(original_id, new_row)?,
            Transformed::MapExisting(target_id) => {
                let original_id = self.require_original(original_id, "MapExisting")?;
                self.pending.push_alias(original_id, AliasTarget::Id(target_id));
                self.stats.rows_merged += 1;
            }
            Transformed::MapToKey(key) => {
                let original_id = self.require_original(original_id, "MapToKey")?;
                if let Some(&target_id) = self.committed_keys.get(&key) {
                    self.pending.push_alias(original_id, AliasTarget::Id(target_id));
                } else if self.pending.contains_key(&key) {
                    self.pending.push_alias(original_id, AliasTarget::Key(key));
                } else {
                    self.reject(
                        Some(&original_id),
                        format!("no row with key '{}' was created in this run", key),
                    );
                    return Ok(());
                }
                self.stats.rows_merged += 1;
            }
            Transformed::Skip => self.stats.rows_skipped += 1,
            Transformed::Reject(reason) => self.reject(original_id.as_deref(), reason),
        }

        Ok(())
    }

    /// Queue an inserted row, or alias it to an earlier row with the same natural key.
    fn accept(&mut self, original_id: Option<String>, row: NewRow) -> Result<()> {
        if row.values.len() != self.def.columns().len() {
            return Err(ImportError::Config(format!(
                "transform produced {} values for {} columns",
                row.values.len(),
                self.def.columns().len()
            )));
        }

        if let Some(key) = row.natural_key.clone() {
            if self.def.produces().is_none() {
                if !self.seen_keys.insert(key) {
                    self.stats.rows_skipped += 1;
                    return Ok(());
                }
            } else if let Some(&target_id) = self.committed_keys.get(&key) {
                let original_id = self.require_original(original_id, "natural key")?;
                self.pending.push_alias(original_id, AliasTarget::Id(target_id));
                self.stats.rows_merged += 1;
                return Ok(());
            } else if self.pending.contains_key(&key) {
                let original_id = self.require_original(original_id, "natural key")?;
                self.pending.push_alias(original_id, AliasTarget::Key(key));
                self.stats.rows_merged += 1;
                return Ok(());
            }
        }

        self.pending.push_row(original_id, row);
        Ok(())
    }

    fn require_original(&self, original_id: Option<String>, what: &str) -> Result<String> {
        match (self.def.produces(), original_id) {
            (Some(_), Some(id)) => Ok(id),
            _ => Err(ImportError::Config(format!(
                "{} requires a unit that produces an entity type",
                what
            ))),
        }
    }

    async fn resolve_self_reference(&mut self, referenced: &str) -> Result<Option<i64>> {
        if let Some(&id) = self.committed.get(referenced) {
            return Ok(Some(id));
        }
        if self.pending.contains_original(referenced) {
            self.flush().await?;
            return Ok(self.committed.get(referenced).copied());
        }
        match self.def.produces() {
            Some(entity_type) => self.stores.mappings.lookup(entity_type, referenced).await,
            None => Ok(None),
        }
    }

    fn reject(&mut self, original_id: Option<&str>, reason: String) {
        warn!(
            unit = self.def.name(),
            original_id = original_id.unwrap_or("-"),
            reason = reason.as_str(),
            "Row rejected"
        );
        self.stats.rows_rejected += 1;
        if self.rejections.len() < self.max_reported_rejections {
            self.rejections.push(RowRejection {
                unit: self.def.name().to_string(),
                original_id: original_id.map(str::to_string),
                reason,
            });
        }
    }

    /// Insert the pending rows and record their mappings.
    ///
    /// The mapping writes are journaled in the target with the rows, so a
    /// failure after the insert is completed by the next run's recovery
    /// instead of inserting the rows again.
    async fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.pending);

        let mut mappings = self.def.produces().map(BatchMappings::new);
        let mut natural_keys = Vec::with_capacity(pending.rows.len());
        let mut values: Vec<Vec<SqlValue>> = Vec::with_capacity(pending.rows.len());
        for PendingRow { original_id, row } in pending.rows {
            if let Some(mappings) = mappings.as_mut() {
                mappings.rows.push(RowMapping {
                    original_id,
                    names: row.names,
                });
            }
            natural_keys.push(row.natural_key);
            values.push(row.values);
        }

        if let Some(mappings) = mappings.as_mut() {
            for alias in pending.aliases {
                let target = match alias.target {
                    AliasTarget::Id(id) => AliasRef::Id(id),
                    AliasTarget::Key(key) => match self.committed_keys.get(&key) {
                        Some(&id) => AliasRef::Id(id),
                        None => natural_keys
                            .iter()
                            .position(|k| k.as_deref() == Some(key.as_str()))
                            .map(AliasRef::Row)
                            .ok_or_else(|| {
                                ImportError::Config(format!("natural key '{}' was not inserted", key))
                            })?,
                    },
                };
                mappings.aliases.push(AliasMapping {
                    original_id: alias.original_id,
                    target,
                });
            }
        }

        let inserted = values.len();
        let journal = match &mappings {
            Some(mappings) if inserted > 0 && !mappings.is_empty() => Some(JournalEntry {
                batch_id: uuid::Uuid::new_v4().to_string(),
                unit: self.def.name().to_string(),
                payload: mappings.to_payload()?,
            }),
            _ => None,
        };

        let ids = if values.is_empty() {
            Vec::new()
        } else {
            let batch = InsertBatch {
                table: self.def.table(),
                columns: self.def.columns().to_vec(),
                rows: values,
                returning: self.def.returning(),
                journal: journal.clone(),
            };
            let ids = self.stores.target.bulk_insert(&batch).await?;
            if batch.returning.is_some() && ids.len() != inserted {
                return Err(ImportError::target(
                    format!("{} ids returned for {} rows", ids.len(), inserted),
                    format!("inserting into {}", batch.table),
                ));
            }
            ids
        };

        let (records, names) = match &mappings {
            Some(mappings) => mappings.records(&ids)?,
            None => (Vec::new(), Vec::new()),
        };
        for (key, &target_id) in natural_keys.into_iter().zip(&ids) {
            if let Some(key) = key {
                self.committed_keys.insert(key, target_id);
            }
        }
        for record in &records {
            self.committed.insert(record.original_id.clone(), record.target_id);
        }

        self.stores.mappings.record_batch(&records, &names).await?;
        if let Some(entry) = journal {
            // A leftover entry is replayed harmlessly by the next run.
            if let Err(e) = self.stores.target.clear_journal(&entry.batch_id).await {
                warn!(
                    "{}: could not clear journal entry {}: {}",
                    self.def.name(),
                    entry.batch_id,
                    e
                );
            }
        }

        self.stats.rows_inserted += inserted as u64;
        if inserted > 0 {
            self.stats.batches += 1;
        }
        debug!(
            "{}: committed batch of {} rows, {} mappings",
            self.def.name(),
            inserted,
            records.len()
        );
        self.report_progress(false);
        Ok(())
    }

    fn report_progress(&self, finished: bool) {
        if let Some(tx) = self.progress {
            let _ = tx.try_send(ProgressUpdate {
                unit: self.def.name().to_string(),
                rows_total: self.stats.rows_total,
                rows_processed: self.stats.rows_processed,
                rows_inserted: self.stats.rows_inserted,
                finished,
            });
        }
    }
}
