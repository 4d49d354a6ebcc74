//! Mapping writes of one batch, in the form stored in the target journal.
//!
//! The target ids of inserted rows are unknown until the insert returns, so
//! rows and aliases refer to them by position in the batch.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::EntityType;
use crate::error::{ImportError, Result};
use crate::mapping::{MappingRecord, MappingStore, NameMappingRecord};
use crate::target::TargetStore;
use crate::unit::NameEntry;

/// Where an alias points once the batch is inserted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum AliasRef {
    /// A target row that already existed.
    Id(i64),
    /// The n-th row of this batch.
    Row(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct RowMapping {
    pub original_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<NameEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct AliasMapping {
    pub original_id: String,
    pub target: AliasRef,
}

/// Mapping and name records of one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct BatchMappings {
    pub entity_type: EntityType,
    /// One entry per inserted row, in insert order.
    pub rows: Vec<RowMapping>,
    pub aliases: Vec<AliasMapping>,
}

impl BatchMappings {
    pub fn new(entity_type: EntityType) -> Self {
        Self {
            entity_type,
            rows: Vec::new(),
            aliases: Vec::new(),
        }
    }

    /// Whether the batch records nothing in the mapping store.
    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
            && self
                .rows
                .iter()
                .all(|r| r.original_id.is_none() && r.names.is_empty())
    }

    /// Build the records, given the ids the rows received.
    pub fn records(&self, ids: &[i64]) -> Result<(Vec<MappingRecord>, Vec<NameMappingRecord>)> {
        if ids.len() != self.rows.len() {
            return Err(ImportError::Config(format!(
                "{} ids for a batch of {} rows",
                ids.len(),
                self.rows.len()
            )));
        }

        let mut records = Vec::with_capacity(self.rows.len() + self.aliases.len());
        let mut names = Vec::new();
        for (row, &target_id) in self.rows.iter().zip(ids) {
            if let Some(original_id) = &row.original_id {
                records.push(MappingRecord::new(self.entity_type, original_id.clone(), target_id));
            }
            names.extend(row.names.iter().map(|n| NameMappingRecord {
                kind: n.kind,
                original_name: n.original_name.clone(),
                target_id,
                target_name: n.target_name.clone(),
            }));
        }

        for alias in &self.aliases {
            let target_id = match alias.target {
                AliasRef::Id(id) => id,
                AliasRef::Row(idx) => *ids.get(idx).ok_or_else(|| {
                    ImportError::Config(format!("alias points past the batch end ({})", idx))
                })?,
            };
            records.push(MappingRecord::new(
                self.entity_type,
                alias.original_id.clone(),
                target_id,
            ));
        }

        Ok((records, names))
    }

    pub fn to_payload(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_payload(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }
}

/// Record the mappings of batches whose rows were committed but whose
/// mappings were not, then clear their journal entries.
///
/// Returns the number of batches recovered.
pub async fn recover_journal(target: &dyn TargetStore, mappings: &MappingStore) -> Result<usize> {
    target.prepare_journal().await?;

    let batches = target.journaled_batches().await?;
    for batch in &batches {
        let (records, names) = BatchMappings::from_payload(&batch.entry.payload)?.records(&batch.ids)?;
        mappings.record_batch(&records, &names).await?;
        target.clear_journal(&batch.entry.batch_id).await?;
        info!(
            "{}: recovered {} mappings of batch {} from the journal",
            batch.entry.unit,
            records.len(),
            batch.entry.batch_id
        );
    }
    Ok(batches.len())
}
