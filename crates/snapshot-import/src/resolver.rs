//! Dependency resolution between units.

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;

use crate::error::{ImportError, Result};
use crate::unit::UnitDefinition;

/// Order in which units run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionPlan {
    order: Vec<&'static str>,
}

impl ExecutionPlan {
    /// Compute a topological order of `definitions`.
    ///
    /// Units whose dependencies are satisfied at the same time keep their
    /// declaration order. Duplicate names, unknown dependencies and cycles are
    /// configuration errors.
    pub fn resolve<'d, I>(definitions: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'d UnitDefinition>,
    {
        let definitions: Vec<&UnitDefinition> = definitions.into_iter().collect();

        let mut index: HashMap<&'static str, usize> = HashMap::with_capacity(definitions.len());
        for (i, def) in definitions.iter().enumerate() {
            if index.insert(def.name(), i).is_some() {
                return Err(ImportError::Config(format!(
                    "unit '{}' is declared more than once",
                    def.name()
                )));
            }
        }

        // Edges point from a dependency to the units waiting on it.
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); definitions.len()];
        let mut pending: Vec<usize> = vec![0; definitions.len()];
        for (i, def) in definitions.iter().enumerate() {
            for dep in def.dependencies() {
                let &d = index.get(dep).ok_or_else(|| {
                    ImportError::Config(format!(
                        "unit '{}' depends on undeclared unit '{}'",
                        def.name(),
                        dep
                    ))
                })?;
                dependents[d].push(i);
                pending[i] += 1;
            }
        }

        let mut ready: BTreeSet<usize> = (0..definitions.len()).filter(|&i| pending[i] == 0).collect();
        let mut order = Vec::with_capacity(definitions.len());

        while let Some(next) = ready.pop_first() {
            order.push(definitions[next].name());
            for &waiting in &dependents[next] {
                pending[waiting] -= 1;
                if pending[waiting] == 0 {
                    ready.insert(waiting);
                }
            }
        }

        if order.len() != definitions.len() {
            let remaining: Vec<&str> = definitions
                .iter()
                .enumerate()
                .filter(|(i, _)| pending[*i] > 0)
                .map(|(_, def)| def.name())
                .collect();
            return Err(ImportError::Config(format!(
                "dependency cycle between units: {}",
                remaining.join(", ")
            )));
        }

        Ok(Self { order })
    }

    /// Unit names in execution order.
    pub fn order(&self) -> &[&'static str] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Position of a unit in the plan.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.order.iter().position(|n| *n == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SourceQuery;

    fn unit(name: &'static str, deps: &[&'static str]) -> UnitDefinition {
        UnitDefinition::builder(name)
            .depends_on(deps)
            .table("t")
            .columns(&["c"])
            .rows_query(SourceQuery::new("SELECT 1"))
            .build()
            .unwrap()
    }

    fn resolve(defs: &[UnitDefinition]) -> Result<ExecutionPlan> {
        ExecutionPlan::resolve(defs)
    }

    #[test]
    fn test_dependencies_come_first() {
        let defs = vec![
            unit("posts", &["topics", "users"]),
            unit("topics", &["categories", "users"]),
            unit("categories", &["users"]),
            unit("users", &[]),
        ];
        let plan = resolve(&defs).unwrap();
        assert_eq!(plan.order(), &["users", "categories", "topics", "posts"]);

        for def in &defs {
            for dep in def.dependencies() {
                assert!(plan.position(dep).unwrap() < plan.position(def.name()).unwrap());
            }
        }
    }

    #[test]
    fn test_ties_keep_declaration_order() {
        let defs = vec![unit("tags", &[]), unit("users", &[]), unit("groups", &[])];
        let plan = resolve(&defs).unwrap();
        assert_eq!(plan.order(), &["tags", "users", "groups"]);
    }

    #[test]
    fn test_released_units_keep_declaration_order() {
        let defs = vec![
            unit("b", &["a"]),
            unit("c", &[]),
            unit("a", &[]),
            unit("d", &["a"]),
        ];
        let plan = resolve(&defs).unwrap();
        assert_eq!(plan.order(), &["c", "a", "b", "d"]);
    }

    #[test]
    fn test_cycle_names_units() {
        let defs = vec![unit("ok", &[]), unit("a", &["b"]), unit("b", &["a"])];
        let err = resolve(&defs).unwrap_err().to_string();
        assert!(err.contains("cycle"));
        assert!(err.contains("a, b"));
        assert!(!err.contains("ok"));
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let defs = vec![unit("a", &["a"])];
        assert!(resolve(&defs).unwrap_err().to_string().contains("cycle"));
    }

    #[test]
    fn test_missing_dependency() {
        let defs = vec![unit("a", &["ghost"])];
        let err = resolve(&defs).unwrap_err().to_string();
        assert!(err.contains("undeclared unit 'ghost'"));
    }

    #[test]
    fn test_duplicate_names() {
        let defs = vec![unit("a", &[]), unit("a", &[])];
        assert!(resolve(&defs).is_err());
    }

    #[test]
    fn test_empty() {
        assert!(resolve(&[]).unwrap().is_empty());
    }
}
