//! Units: the steps of an import.
//!
//! A unit migrates one kind of snapshot row into one target table. It is made
//! of an immutable [`UnitDefinition`] (what to read, where to write, what it
//! depends on) and a [`Unit`] implementation that turns each snapshot row
//! into a [`Transformed`] outcome.
//!
//! # Idempotency
//!
//! Rows queries select only rows that are not mapped yet, by checking the
//! mapping store attached to the snapshot as `mapped`:
//!
//! ```sql
//! SELECT t.* FROM tags t
//! WHERE NOT EXISTS (SELECT 1 FROM mapped.ids m
//!                   WHERE m.entity_type = $1 AND m.original_id = CAST(t.id AS TEXT))
//! ```
//!
//! Units that produce no entity type (join tables) dedup against a target
//! set preloaded with [`UnitDefinitionBuilder::requires_set`].

pub mod context;
pub mod names;
pub mod validate;

pub use context::{Preloaded, RowRejection, RowWarning, UnitContext};
pub use names::{sanitize_username, UniqueNameGenerator};
pub use validate::ensure_valid_value;

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::identifier::validate_identifier;
use crate::core::{EntityType, NameKind, SourceQuery, SourceRow, SqlValue};
use crate::error::{ImportError, Result};

/// Where a preloaded set or map is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreloadSource {
    Snapshot,
    Mappings,
    Target,
}

/// Shape of a preload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreloadKind {
    /// Every row becomes a set member (multi-column rows joined with `:`).
    Set,
    /// Two-column `(key, id)` rows become a map.
    Map,
}

/// Data loaded once when the unit starts.
#[derive(Debug, Clone)]
pub struct Preload {
    pub name: &'static str,
    pub source: PreloadSource,
    pub kind: PreloadKind,
    pub query: SourceQuery,
}

/// Static description of a unit.
#[derive(Debug, Clone)]
pub struct UnitDefinition {
    name: &'static str,
    dependencies: Vec<&'static str>,
    produces: Option<EntityType>,
    table: &'static str,
    columns: Vec<&'static str>,
    rows_query: SourceQuery,
    total_rows_query: Option<SourceQuery>,
    preloads: Vec<Preload>,
    self_reference: Option<&'static str>,
    batch_size: Option<usize>,
    original_id_column: &'static str,
    returning: &'static str,
}

impl UnitDefinition {
    /// Start describing a unit.
    pub fn builder(name: &'static str) -> UnitDefinitionBuilder {
        UnitDefinitionBuilder {
            name,
            dependencies: Vec::new(),
            produces: None,
            table: None,
            columns: Vec::new(),
            rows_query: None,
            total_rows_query: None,
            preloads: Vec::new(),
            self_reference: None,
            batch_size: None,
            original_id_column: "id",
            returning: "id",
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn dependencies(&self) -> &[&'static str] {
        &self.dependencies
    }

    /// Entity type recorded in the mapping store, if the unit creates mapped rows.
    pub fn produces(&self) -> Option<EntityType> {
        self.produces
    }

    pub fn table(&self) -> &'static str {
        self.table
    }

    pub fn columns(&self) -> &[&'static str] {
        &self.columns
    }

    pub fn rows_query(&self) -> &SourceQuery {
        &self.rows_query
    }

    pub fn total_rows_query(&self) -> Option<&SourceQuery> {
        self.total_rows_query.as_ref()
    }

    pub fn preloads(&self) -> &[Preload] {
        &self.preloads
    }

    /// Snapshot column holding the original id of another row of this unit.
    pub fn self_reference(&self) -> Option<&'static str> {
        self.self_reference
    }

    /// Batch size override.
    pub fn batch_size(&self) -> Option<usize> {
        self.batch_size
    }

    /// Snapshot column holding the row's original id.
    pub fn original_id_column(&self) -> &'static str {
        self.original_id_column
    }

    /// Generated-id column returned by inserts, for units that produce mappings.
    pub fn returning(&self) -> Option<&'static str> {
        self.produces.map(|_| self.returning)
    }
}

/// Builder for [`UnitDefinition`]. Everything is checked in [`build`](Self::build).
#[derive(Debug)]
pub struct UnitDefinitionBuilder {
    name: &'static str,
    dependencies: Vec<&'static str>,
    produces: Option<EntityType>,
    table: Option<&'static str>,
    columns: Vec<&'static str>,
    rows_query: Option<SourceQuery>,
    total_rows_query: Option<SourceQuery>,
    preloads: Vec<Preload>,
    self_reference: Option<&'static str>,
    batch_size: Option<usize>,
    original_id_column: &'static str,
    returning: &'static str,
}

impl UnitDefinitionBuilder {
    pub fn depends_on(mut self, units: &[&'static str]) -> Self {
        self.dependencies.extend_from_slice(units);
        self
    }

    pub fn produces(mut self, entity_type: EntityType) -> Self {
        self.produces = Some(entity_type);
        self
    }

    pub fn table(mut self, table: &'static str) -> Self {
        self.table = Some(table);
        self
    }

    pub fn columns(mut self, columns: &[&'static str]) -> Self {
        self.columns = columns.to_vec();
        self
    }

    pub fn rows_query(mut self, query: SourceQuery) -> Self {
        self.rows_query = Some(query);
        self
    }

    pub fn total_rows_query(mut self, query: SourceQuery) -> Self {
        self.total_rows_query = Some(query);
        self
    }

    /// Preload a set under `name` before the first row.
    pub fn requires_set(mut self, name: &'static str, source: PreloadSource, query: SourceQuery) -> Self {
        self.preloads.push(Preload {
            name,
            source,
            kind: PreloadKind::Set,
            query,
        });
        self
    }

    /// Preload a `(key, id)` map under `name` before the first row.
    pub fn requires_mapping(
        mut self,
        name: &'static str,
        source: PreloadSource,
        query: SourceQuery,
    ) -> Self {
        self.preloads.push(Preload {
            name,
            source,
            kind: PreloadKind::Map,
            query,
        });
        self
    }

    /// Declare that `column` references another row of the same unit.
    ///
    /// The rows query must be ordered so referenced rows come first.
    pub fn self_reference(mut self, column: &'static str) -> Self {
        self.self_reference = Some(column);
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    pub fn original_id_column(mut self, column: &'static str) -> Self {
        self.original_id_column = column;
        self
    }

    pub fn returning(mut self, column: &'static str) -> Self {
        self.returning = column;
        self
    }

    /// Validate and freeze the definition.
    pub fn build(self) -> Result<UnitDefinition> {
        let name = self.name;
        let invalid = |msg: String| ImportError::Config(format!("unit '{}': {}", name, msg));

        if name.trim().is_empty() {
            return Err(ImportError::Config("unit name must not be empty".to_string()));
        }

        let table = self
            .table
            .ok_or_else(|| invalid("no target table declared".to_string()))?;
        validate_identifier(table).map_err(|e| invalid(e.to_string()))?;

        if self.columns.is_empty() {
            return Err(invalid("no target columns declared".to_string()));
        }
        let mut seen = HashSet::new();
        for column in &self.columns {
            validate_identifier(column).map_err(|e| invalid(e.to_string()))?;
            if !seen.insert(*column) {
                return Err(invalid(format!("column '{}' declared twice", column)));
            }
        }

        let rows_query = self
            .rows_query
            .ok_or_else(|| invalid("no rows query declared".to_string()))?;
        check_binds(&rows_query).map_err(invalid)?;
        if let Some(total) = &self.total_rows_query {
            check_binds(total).map_err(invalid)?;
        }

        let mut preload_names = HashSet::new();
        for preload in &self.preloads {
            if !preload_names.insert(preload.name) {
                return Err(invalid(format!("preload '{}' declared twice", preload.name)));
            }
            check_binds(&preload.query).map_err(invalid)?;
        }

        if let Some(column) = self.self_reference {
            if self.produces.is_none() {
                return Err(invalid(format!(
                    "self reference '{}' requires an entity type",
                    column
                )));
            }
            if !rows_query.is_ordered() {
                return Err(invalid(format!(
                    "self reference '{}' requires an ordered rows query",
                    column
                )));
            }
        }

        if self.batch_size == Some(0) {
            return Err(invalid("batch size must be at least 1".to_string()));
        }
        validate_identifier(self.returning).map_err(|e| invalid(e.to_string()))?;

        let mut dependencies = Vec::with_capacity(self.dependencies.len());
        for dep in self.dependencies {
            if !dependencies.contains(&dep) {
                dependencies.push(dep);
            }
        }

        Ok(UnitDefinition {
            name,
            dependencies,
            produces: self.produces,
            table,
            columns: self.columns,
            rows_query,
            total_rows_query: self.total_rows_query,
            preloads: self.preloads,
            self_reference: self.self_reference,
            batch_size: self.batch_size,
            original_id_column: self.original_id_column,
            returning: self.returning,
        })
    }
}

fn check_binds(query: &SourceQuery) -> std::result::Result<(), String> {
    let expected = query.placeholder_count();
    if expected != query.binds().len() {
        return Err(format!(
            "query expects {} binds but {} were given: {}",
            expected,
            query.binds().len(),
            query.sql()
        ));
    }
    Ok(())
}

/// A name recorded in the name index when its row is inserted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameEntry {
    pub kind: NameKind,
    pub original_name: String,
    pub target_name: String,
}

/// A target row produced by a transform.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRow {
    pub values: Vec<SqlValue>,
    /// Normalized natural key; a second row with the same key in one run is
    /// mapped to the first instead of inserted.
    pub natural_key: Option<String>,
    pub names: Vec<NameEntry>,
}

impl NewRow {
    pub fn new(values: Vec<SqlValue>) -> Self {
        Self {
            values,
            natural_key: None,
            names: Vec::new(),
        }
    }

    pub fn with_natural_key(mut self, key: impl Into<String>) -> Self {
        self.natural_key = Some(key.into());
        self
    }

    pub fn with_name(
        mut self,
        kind: NameKind,
        original_name: impl Into<String>,
        target_name: impl Into<String>,
    ) -> Self {
        self.names.push(NameEntry {
            kind,
            original_name: original_name.into(),
            target_name: target_name.into(),
        });
        self
    }
}

/// Outcome of transforming one snapshot row.
#[derive(Debug, Clone, PartialEq)]
pub enum Transformed {
    /// Insert a new target row.
    Insert(NewRow),
    /// The entity already exists in the target; map the original id to it.
    MapExisting(i64),
    /// Map the original id to the row created earlier this run with this natural key.
    MapToKey(String),
    /// Nothing to do (e.g., the join row already exists).
    Skip,
    /// The row cannot be migrated.
    Reject(String),
}

/// One step of the import.
#[async_trait]
pub trait Unit: Send + Sync {
    fn definition(&self) -> &UnitDefinition;

    fn name(&self) -> &'static str {
        self.definition().name()
    }

    /// Turn a snapshot row into a target row, a mapping, or nothing.
    async fn transform(&mut self, ctx: &mut UnitContext<'_>, row: &SourceRow) -> Result<Transformed>;

    /// Runs once after every batch has committed.
    async fn after(&mut self, _ctx: &mut UnitContext<'_>, _inserted: u64) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> UnitDefinitionBuilder {
        UnitDefinition::builder("tags")
            .produces(EntityType::Tag)
            .table("tags")
            .columns(&["name"])
            .rows_query(SourceQuery::new("SELECT * FROM tags WHERE kind = $1").bind("tag"))
    }

    #[test]
    fn test_build_valid() {
        let def = base().depends_on(&["users", "users"]).build().unwrap();
        assert_eq!(def.name(), "tags");
        assert_eq!(def.dependencies(), &["users"]);
        assert_eq!(def.returning(), Some("id"));
        assert_eq!(def.original_id_column(), "id");
    }

    #[test]
    fn test_join_unit_has_no_returning() {
        let def = UnitDefinition::builder("topic_tags")
            .table("topic_tags")
            .columns(&["topic_id", "tag_id"])
            .rows_query(SourceQuery::new("SELECT * FROM topic_tags"))
            .build()
            .unwrap();
        assert_eq!(def.returning(), None);
    }

    #[test]
    fn test_missing_table_rejected() {
        let err = UnitDefinition::builder("x")
            .columns(&["a"])
            .rows_query(SourceQuery::new("SELECT 1"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("no target table"));
    }

    #[test]
    fn test_bind_count_checked() {
        let err = base()
            .rows_query(SourceQuery::new("SELECT * FROM tags WHERE a = $1 AND b = $2").bind(1i64))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("expects 2 binds"));
    }

    #[test]
    fn test_self_reference_requires_order() {
        let err = base()
            .self_reference("parent_id")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("ordered rows query"));

        let def = base()
            .rows_query(
                SourceQuery::new("SELECT * FROM tags WHERE kind = $1")
                    .bind("tag")
                    .order_by(&["id"]),
            )
            .self_reference("parent_id")
            .build()
            .unwrap();
        assert_eq!(def.self_reference(), Some("parent_id"));
    }

    #[test]
    fn test_invalid_column_and_duplicates() {
        assert!(base().columns(&["name", "name"]).build().is_err());
        assert!(base().columns(&["bad name"]).build().is_err());
        assert!(base().batch_size(0).build().is_err());
    }

    #[test]
    fn test_duplicate_preload_rejected() {
        let err = base()
            .requires_set("existing", PreloadSource::Target, SourceQuery::new("SELECT name FROM tags"))
            .requires_set("existing", PreloadSource::Target, SourceQuery::new("SELECT name FROM tags"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("declared twice"));
    }
}
