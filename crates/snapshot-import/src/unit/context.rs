//! Per-unit execution context.

use std::collections::{HashMap, HashSet};
use std::fmt::Display;

use serde::Serialize;
use tracing::warn;

use crate::cache::SharedCache;
use crate::core::EntityType;
use crate::error::{ImportError, Result};
use crate::mapping::MappingStore;
use crate::target::TargetStore;

use super::validate::{ensure_valid_value, truncate_chars};

/// A value replaced during validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowWarning {
    pub unit: String,
    pub original_id: Option<String>,
    pub field: String,
    pub value: String,
    pub replaced_with: String,
}

/// A snapshot row that was not migrated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowRejection {
    pub unit: String,
    pub original_id: Option<String>,
    pub reason: String,
}

/// Sets and maps loaded when the unit starts.
#[derive(Debug, Default)]
pub struct Preloaded {
    sets: HashMap<&'static str, HashSet<String>>,
    maps: HashMap<&'static str, HashMap<String, i64>>,
}

impl Preloaded {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_set(&mut self, name: &'static str, set: HashSet<String>) {
        self.sets.insert(name, set);
    }

    pub fn put_map(&mut self, name: &'static str, map: HashMap<String, i64>) {
        self.maps.insert(name, map);
    }

    pub fn set(&self, name: &str) -> Result<&HashSet<String>> {
        self.sets
            .get(name)
            .ok_or_else(|| ImportError::Config(format!("no preloaded set named '{}'", name)))
    }

    pub fn map(&self, name: &str) -> Result<&HashMap<String, i64>> {
        self.maps
            .get(name)
            .ok_or_else(|| ImportError::Config(format!("no preloaded map named '{}'", name)))
    }

    pub fn contains(&self, name: &str, key: &str) -> Result<bool> {
        Ok(self.set(name)?.contains(key))
    }

    /// Add a member to a set. Returns false if it was already present.
    pub fn insert(&mut self, name: &str, key: impl Into<String>) -> Result<bool> {
        let set = self
            .sets
            .get_mut(name)
            .ok_or_else(|| ImportError::Config(format!("no preloaded set named '{}'", name)))?;
        Ok(set.insert(key.into()))
    }

    pub fn get(&self, name: &str, key: &str) -> Result<Option<i64>> {
        Ok(self.map(name)?.get(key).copied())
    }

    pub fn map_insert(&mut self, name: &str, key: impl Into<String>, id: i64) -> Result<()> {
        let map = self
            .maps
            .get_mut(name)
            .ok_or_else(|| ImportError::Config(format!("no preloaded map named '{}'", name)))?;
        map.insert(key.into(), id);
        Ok(())
    }
}

/// Everything a unit can reach while transforming rows.
pub struct UnitContext<'a> {
    unit: &'static str,
    mappings: &'a MappingStore,
    cache: &'a SharedCache,
    target: &'a dyn TargetStore,
    preloaded: Preloaded,
    original_id: Option<String>,
    self_reference: Option<i64>,
    row_warned: bool,
    warnings: Vec<RowWarning>,
    warning_count: u64,
    max_reported_warnings: usize,
}

impl<'a> UnitContext<'a> {
    pub fn new(
        unit: &'static str,
        mappings: &'a MappingStore,
        cache: &'a SharedCache,
        target: &'a dyn TargetStore,
        preloaded: Preloaded,
        max_reported_warnings: usize,
    ) -> Self {
        Self {
            unit,
            mappings,
            cache,
            target,
            preloaded,
            original_id: None,
            self_reference: None,
            row_warned: false,
            warnings: Vec::new(),
            warning_count: 0,
            max_reported_warnings,
        }
    }

    pub fn unit(&self) -> &'static str {
        self.unit
    }

    pub fn mappings(&self) -> &'a MappingStore {
        self.mappings
    }

    pub fn cache(&self) -> &'a SharedCache {
        self.cache
    }

    pub fn target(&self) -> &'a dyn TargetStore {
        self.target
    }

    pub fn preloaded(&self) -> &Preloaded {
        &self.preloaded
    }

    pub fn preloaded_mut(&mut self) -> &mut Preloaded {
        &mut self.preloaded
    }

    /// Original id of the row being transformed.
    pub fn original_id(&self) -> Option<&str> {
        self.original_id.as_deref()
    }

    /// Resolved target id of the row's self reference, if it has one.
    pub fn self_reference(&self) -> Option<i64> {
        self.self_reference
    }

    /// Look up a mapping recorded by this or an earlier unit.
    pub async fn lookup(&self, entity_type: EntityType, original_id: &str) -> Result<Option<i64>> {
        self.mappings.lookup(entity_type, original_id).await
    }

    /// Return `value` if allowed, else `default`, logging and recording a warning.
    pub fn ensure_valid<T>(&mut self, field: &str, value: T, allowed: &[T], default: T) -> T
    where
        T: PartialEq + Display,
    {
        ensure_valid_value(value, allowed, default, |invalid, default| {
            self.record_warning(field, invalid.to_string(), default.to_string());
        })
    }

    /// Truncate `value` to `max_chars`, logging and recording a warning if it was longer.
    pub fn ensure_max_length(&mut self, field: &str, value: String, max_chars: usize) -> String {
        match truncate_chars(&value, max_chars) {
            Some(truncated) => {
                self.record_warning(field, value, truncated.clone());
                truncated
            }
            None => value,
        }
    }

    /// Record a replaced value for the current row.
    pub fn record_warning(&mut self, field: &str, value: String, replaced_with: String) {
        warn!(
            unit = self.unit,
            original_id = self.original_id.as_deref().unwrap_or("-"),
            field,
            value = value.as_str(),
            replaced_with = replaced_with.as_str(),
            "Invalid value replaced"
        );
        self.row_warned = true;
        self.warning_count += 1;
        if self.warnings.len() < self.max_reported_warnings {
            self.warnings.push(RowWarning {
                unit: self.unit.to_string(),
                original_id: self.original_id.clone(),
                field: field.to_string(),
                value,
                replaced_with,
            });
        }
    }

    pub(crate) fn begin_row(&mut self, original_id: Option<String>, self_reference: Option<i64>) {
        self.original_id = original_id;
        self.self_reference = self_reference;
        self.row_warned = false;
    }

    pub(crate) fn end_row(&mut self) -> bool {
        self.original_id = None;
        self.self_reference = None;
        std::mem::take(&mut self.row_warned)
    }

    pub(crate) fn warning_count(&self) -> u64 {
        self.warning_count
    }

    pub(crate) fn take_warnings(&mut self) -> Vec<RowWarning> {
        std::mem::take(&mut self.warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::SqliteTarget;

    #[tokio::test]
    async fn test_warnings_are_recorded_and_capped() {
        let dir = tempfile::tempdir().unwrap();
        let mappings = MappingStore::open(&dir.path().join("m.db")).await.unwrap();
        let target = SqliteTarget::open(&dir.path().join("t.db")).await.unwrap();
        let cache = SharedCache::new();
        let mut ctx = UnitContext::new("users", &mappings, &cache, &target, Preloaded::new(), 1);

        ctx.begin_row(Some("u1".into()), None);
        assert_eq!(ctx.ensure_valid("trust_level", 2, &[0, 1, 2, 3, 4], 1), 2);
        assert!(!ctx.end_row());

        ctx.begin_row(Some("u2".into()), None);
        assert_eq!(ctx.ensure_valid("trust_level", 9, &[0, 1, 2, 3, 4], 1), 1);
        assert_eq!(ctx.ensure_max_length("title", "abcdef".into(), 3), "abc");
        assert!(ctx.end_row());

        assert_eq!(ctx.warning_count(), 2);
        let warnings = ctx.take_warnings();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].original_id.as_deref(), Some("u2"));
        assert_eq!(warnings[0].value, "9");
        assert_eq!(warnings[0].replaced_with, "1");
    }

    #[test]
    fn test_preloaded_sets_and_maps() {
        let mut preloaded = Preloaded::new();
        preloaded.put_set("emails", HashSet::from(["a@x".to_string()]));
        preloaded.put_map("users", HashMap::from([("u1".to_string(), 10)]));

        assert!(preloaded.contains("emails", "a@x").unwrap());
        assert!(preloaded.insert("emails", "b@x").unwrap());
        assert!(!preloaded.insert("emails", "b@x").unwrap());
        assert_eq!(preloaded.get("users", "u1").unwrap(), Some(10));
        preloaded.map_insert("users", "u2", 11).unwrap();
        assert_eq!(preloaded.get("users", "u2").unwrap(), Some(11));
        assert!(preloaded.set("missing").is_err());
    }
}
