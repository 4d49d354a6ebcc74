//! Execution engine - runs units in dependency order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::cache::SharedCache;
use crate::config::Config;
use crate::core::EntityType;
use crate::error::{ImportError, Result};
use crate::mapping::{MappingStore, RunStatus, UnitStatus};
use crate::pipeline::{recover_journal, run_unit, PipelineConfig, ProgressUpdate, Stores, UnitStats};
use crate::resolver::ExecutionPlan;
use crate::snapshot::{SnapshotSource, SqliteSnapshot};
use crate::target::{self, TargetStore};
use crate::unit::{RowRejection, RowWarning, Unit};

/// Import engine.
pub struct Engine {
    snapshot: Arc<dyn SnapshotSource>,
    mappings: Arc<MappingStore>,
    target: Arc<dyn TargetStore>,
    pipeline: PipelineConfig,
    config_hash: String,
    progress: Option<mpsc::Sender<ProgressUpdate>>,
}

/// The unit that stopped a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitFailure {
    pub unit: String,
    pub message: String,
}

/// Result of an import run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Unique run identifier.
    pub run_id: String,

    /// Final status.
    pub status: RunStatus,

    /// When the run started.
    pub started_at: DateTime<Utc>,

    /// When the run completed.
    pub completed_at: DateTime<Utc>,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    /// Units in execution order.
    pub plan: Vec<String>,

    /// Stats of every unit that ran, in execution order.
    pub units: Vec<UnitStats>,

    /// Total rows inserted into the target.
    pub rows_inserted: u64,

    /// Total rows rejected.
    pub rows_rejected: u64,

    /// Replaced values over all units, including those not listed in `warnings`.
    pub warning_count: u64,

    pub warnings: Vec<RowWarning>,

    /// Rejected rows with their reasons, up to the configured limit.
    pub rejections: Vec<RowRejection>,

    /// Set when a unit failed and the run stopped.
    pub failure: Option<UnitFailure>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    /// Stats of a unit, if it ran.
    pub fn unit(&self, name: &str) -> Option<&UnitStats> {
        self.units.iter().find(|u| u.unit == name)
    }

    /// Serialize the report to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// One unit of a dry run.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedUnit {
    pub unit: String,
    pub dependencies: Vec<String>,
    pub produces: Option<EntityType>,
    /// Rows the unit would process, if it declares a total query.
    pub pending_rows: Option<i64>,
}

/// Result of a dry run.
#[derive(Debug, Clone, Serialize)]
pub struct PlanReport {
    pub units: Vec<PlannedUnit>,
}

impl PlanReport {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Result of a health check.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub snapshot_connected: bool,
    pub snapshot_latency_ms: u64,
    pub snapshot_error: Option<String>,
    pub mappings_connected: bool,
    pub mappings_latency_ms: u64,
    pub mappings_error: Option<String>,
    pub target_connected: bool,
    pub target_latency_ms: u64,
    pub target_error: Option<String>,
    pub healthy: bool,
}

impl Engine {
    /// Open every store described by the configuration.
    pub async fn connect(config: &Config) -> Result<Self> {
        // The snapshot attaches the mapping store, so it must exist first.
        let mappings = MappingStore::open(&config.mappings.path).await?;
        let snapshot = SqliteSnapshot::open(&config.snapshot.path, mappings.path()).await?;
        let target = target::connect(&config.target).await?;

        Ok(Self::new(Arc::new(snapshot), Arc::new(mappings), target)
            .with_pipeline_config(PipelineConfig::from(&config.import))
            .with_config_hash(config.hash()))
    }

    /// Create an engine over already opened stores.
    pub fn new(
        snapshot: Arc<dyn SnapshotSource>,
        mappings: Arc<MappingStore>,
        target: Arc<dyn TargetStore>,
    ) -> Self {
        Self {
            snapshot,
            mappings,
            target,
            pipeline: PipelineConfig::default(),
            config_hash: String::new(),
            progress: None,
        }
    }

    pub fn with_pipeline_config(mut self, pipeline: PipelineConfig) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Hash of the configuration, recorded with each run.
    pub fn with_config_hash(mut self, hash: impl Into<String>) -> Self {
        self.config_hash = hash.into();
        self
    }

    /// Send progress updates to `tx` while units run.
    pub fn with_progress(mut self, tx: mpsc::Sender<ProgressUpdate>) -> Self {
        self.progress = Some(tx);
        self
    }

    pub fn mappings(&self) -> &MappingStore {
        &self.mappings
    }

    pub fn target(&self) -> &dyn TargetStore {
        self.target.as_ref()
    }

    /// Run every unit once, in dependency order.
    ///
    /// Configuration errors (duplicate names, unknown dependencies, cycles)
    /// are returned before anything runs. Mappings of batches a previous run
    /// committed to the target but did not record are recovered first. A
    /// failing unit stops the run; its failure is part of the returned report,
    /// and batches committed before it stay committed.
    pub async fn run(&self, units: Vec<Box<dyn Unit>>) -> Result<RunReport> {
        let plan = ExecutionPlan::resolve(units.iter().map(|u| u.definition()))?;
        let mut by_name: HashMap<&'static str, Box<dyn Unit>> =
            units.into_iter().map(|u| (u.name(), u)).collect();

        let recovered = recover_journal(self.target.as_ref(), &self.mappings).await?;
        if recovered > 0 {
            warn!("Recovered the mappings of {} interrupted batches", recovered);
        }

        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let started = Instant::now();
        info!("Starting import run {} ({} units)", run_id, plan.len());
        self.mappings
            .begin_run(&run_id, &self.config_hash, started_at)
            .await?;

        // Shared data lives for one run only.
        let cache = SharedCache::new();
        let stores = Stores {
            snapshot: self.snapshot.as_ref(),
            mappings: self.mappings.as_ref(),
            target: self.target.as_ref(),
            cache: &cache,
        };

        let mut stats = Vec::with_capacity(plan.len());
        let mut warnings = Vec::new();
        let mut warning_count = 0;
        let mut rejections = Vec::new();
        let mut failure = None;

        for (position, &name) in plan.order().iter().enumerate() {
            let mut unit = by_name.remove(name).ok_or_else(|| {
                ImportError::Config(format!("unit '{}' is missing from the plan", name))
            })?;
            info!("[{}/{}] Running unit {}", position + 1, plan.len(), name);

            let outcome = run_unit(&mut *unit, stores, &self.pipeline, self.progress.as_ref()).await;

            let (status, message) = match &outcome.result {
                Ok(()) => (UnitStatus::Completed, None),
                Err(ImportError::Step { message, .. }) => (UnitStatus::Failed, Some(message.clone())),
                Err(e) => (UnitStatus::Failed, Some(e.to_string())),
            };
            self.mappings
                .record_unit(&run_id, &outcome.stats.to_record(status, message.clone()))
                .await?;

            warning_count += outcome.warning_count;
            let room = self.pipeline.max_reported_warnings.saturating_sub(warnings.len());
            warnings.extend(outcome.warnings.into_iter().take(room));
            let room = self
                .pipeline
                .max_reported_rejections
                .saturating_sub(rejections.len());
            rejections.extend(outcome.rejections.into_iter().take(room));
            stats.push(outcome.stats);

            if let Some(message) = message {
                failure = Some(UnitFailure {
                    unit: name.to_string(),
                    message,
                });
                break;
            }
        }

        let status = if failure.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        let completed_at = Utc::now();
        self.mappings
            .finish_run(&run_id, status, completed_at)
            .await?;

        let report = RunReport {
            run_id,
            status,
            started_at,
            completed_at,
            duration_seconds: started.elapsed().as_secs_f64(),
            plan: plan.order().iter().map(|n| n.to_string()).collect(),
            rows_inserted: stats.iter().map(|s| s.rows_inserted).sum(),
            rows_rejected: stats.iter().map(|s| s.rows_rejected).sum(),
            units: stats,
            warning_count,
            warnings,
            rejections,
            failure,
        };

        match &report.failure {
            None => info!(
                "Import completed: {} units, {} rows inserted, {} rejected in {:.1}s",
                report.units.len(),
                report.rows_inserted,
                report.rows_rejected,
                report.duration_seconds
            ),
            Some(failure) => error!(
                "Import failed at unit {}: {}",
                failure.unit, failure.message
            ),
        }
        if report.warning_count > 0 {
            warn!("{} values were replaced during validation", report.warning_count);
        }

        Ok(report)
    }

    /// Resolve the plan and count pending rows without running anything.
    pub async fn plan(&self, units: &[Box<dyn Unit>]) -> Result<PlanReport> {
        let plan = ExecutionPlan::resolve(units.iter().map(|u| u.definition()))?;
        let definitions: HashMap<&str, _> =
            units.iter().map(|u| (u.name(), u.definition())).collect();

        let mut planned = Vec::with_capacity(plan.len());
        for &name in plan.order() {
            let def = definitions.get(name).ok_or_else(|| {
                ImportError::Config(format!("unit '{}' is missing from the plan", name))
            })?;
            let pending_rows = match def.total_rows_query() {
                Some(query) => self
                    .snapshot
                    .query_scalar(query)
                    .await?
                    .and_then(|v| v.as_i64()),
                None => None,
            };
            planned.push(PlannedUnit {
                unit: name.to_string(),
                dependencies: def.dependencies().iter().map(|d| d.to_string()).collect(),
                produces: def.produces(),
                pending_rows,
            });
        }

        Ok(PlanReport { units: planned })
    }

    /// Check that every store answers.
    pub async fn health_check(&self) -> HealthCheckResult {
        let started = Instant::now();
        let snapshot = self.snapshot.ping().await;
        let snapshot_latency_ms = started.elapsed().as_millis() as u64;

        let started = Instant::now();
        let mappings = self.mappings.total_mapped().await.map(|_| ());
        let mappings_latency_ms = started.elapsed().as_millis() as u64;

        let started = Instant::now();
        let target = self.target.ping().await;
        let target_latency_ms = started.elapsed().as_millis() as u64;

        let healthy = snapshot.is_ok() && mappings.is_ok() && target.is_ok();
        HealthCheckResult {
            snapshot_connected: snapshot.is_ok(),
            snapshot_latency_ms,
            snapshot_error: snapshot.err().map(|e| e.to_string()),
            mappings_connected: mappings.is_ok(),
            mappings_latency_ms,
            mappings_error: mappings.err().map(|e| e.to_string()),
            target_connected: target.is_ok(),
            target_latency_ms,
            target_error: target.err().map(|e| e.to_string()),
            healthy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{SourceQuery, SourceRow};
    use crate::testing::{FailingTarget, TestEnv};
    use crate::unit::{NewRow, PreloadSource, Transformed, UnitContext, UnitDefinition};
    use async_trait::async_trait;
    use std::sync::Mutex;

    const SNAPSHOT: &str = "
        CREATE TABLE nodes (id INTEGER PRIMARY KEY, name TEXT, parent_id INTEGER, depth INTEGER);
        CREATE TABLE leaves (id INTEGER PRIMARY KEY, node_id INTEGER, label TEXT);
        INSERT INTO nodes VALUES (1, 'root', NULL, 0), (2, 'child', 1, 1), (3, 'grandchild', 2, 2);
        INSERT INTO leaves VALUES (1, 1, 'a'), (2, 3, 'b'), (3, 99, 'c');
    ";

    const TARGET: &str = "
        CREATE TABLE nodes (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL, parent_id INTEGER);
        CREATE TABLE leaves (id INTEGER PRIMARY KEY AUTOINCREMENT, node_id INTEGER NOT NULL, label TEXT);
    ";

    type Events = Arc<Mutex<Vec<String>>>;

    struct NodeUnit {
        def: UnitDefinition,
        events: Events,
    }

    impl NodeUnit {
        fn boxed(events: &Events) -> Box<dyn Unit> {
            let def = UnitDefinition::builder("nodes")
                .produces(EntityType::Category)
                .table("nodes")
                .columns(&["name", "parent_id"])
                .rows_query(
                    SourceQuery::new(
                        "SELECT n.id, n.name, n.parent_id FROM nodes n
                         WHERE NOT EXISTS (SELECT 1 FROM mapped.ids m
                                           WHERE m.entity_type = $1 AND m.original_id = CAST(n.id AS TEXT))",
                    )
                    .bind(EntityType::Category.as_str())
                    .order_by(&["n.depth", "n.id"]),
                )
                .total_rows_query(
                    SourceQuery::new(
                        "SELECT COUNT(*) FROM nodes n
                         WHERE NOT EXISTS (SELECT 1 FROM mapped.ids m
                                           WHERE m.entity_type = $1 AND m.original_id = CAST(n.id AS TEXT))",
                    )
                    .bind(EntityType::Category.as_str()),
                )
                .self_reference("parent_id")
                .build()
                .unwrap();
            Box::new(Self {
                def,
                events: events.clone(),
            })
        }
    }

    #[async_trait]
    impl Unit for NodeUnit {
        fn definition(&self) -> &UnitDefinition {
            &self.def
        }

        async fn transform(&mut self, ctx: &mut UnitContext<'_>, row: &SourceRow) -> Result<Transformed> {
            self.events.lock().unwrap().push("nodes:row".into());
            let name = row.text("name")?.unwrap_or_default();
            Ok(Transformed::Insert(NewRow::new(vec![
                name.into(),
                ctx.self_reference().into(),
            ])))
        }

        async fn after(&mut self, _ctx: &mut UnitContext<'_>, _inserted: u64) -> Result<()> {
            self.events.lock().unwrap().push("nodes:after".into());
            Ok(())
        }
    }

    struct LeafUnit {
        def: UnitDefinition,
        events: Events,
    }

    impl LeafUnit {
        fn boxed(events: &Events) -> Box<dyn Unit> {
            let def = UnitDefinition::builder("leaves")
                .depends_on(&["nodes"])
                .table("leaves")
                .columns(&["node_id", "label"])
                .rows_query(SourceQuery::new("SELECT l.id, l.node_id, l.label FROM leaves l").order_by(&["l.id"]))
                .requires_set(
                    "existing",
                    PreloadSource::Target,
                    SourceQuery::new("SELECT node_id, label FROM leaves"),
                )
                .build()
                .unwrap();
            Box::new(Self {
                def,
                events: events.clone(),
            })
        }
    }

    #[async_trait]
    impl Unit for LeafUnit {
        fn definition(&self) -> &UnitDefinition {
            &self.def
        }

        async fn transform(&mut self, ctx: &mut UnitContext<'_>, row: &SourceRow) -> Result<Transformed> {
            self.events.lock().unwrap().push("leaves:row".into());
            let node = row.key("node_id")?.unwrap_or_default();
            let Some(node_id) = ctx.lookup(EntityType::Category, &node).await? else {
                return Ok(Transformed::Reject(format!("unknown node {}", node)));
            };
            let label = row.text("label")?.unwrap_or_default();
            if !ctx.preloaded_mut().insert("existing", format!("{}:{}", node_id, label))? {
                return Ok(Transformed::Skip);
            }
            Ok(Transformed::Insert(NewRow::new(vec![node_id.into(), label.into()])))
        }
    }

    fn units(events: &Events) -> Vec<Box<dyn Unit>> {
        // Declared out of order on purpose.
        vec![LeafUnit::boxed(events), NodeUnit::boxed(events)]
    }

    #[tokio::test]
    async fn test_dependencies_finish_before_dependents_start() {
        let env = TestEnv::new(SNAPSHOT, TARGET).await;
        let events = Events::default();

        let report = env.engine(100).run(units(&events)).await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.plan, vec!["nodes", "leaves"]);

        let events = events.lock().unwrap();
        let after = events.iter().position(|e| e == "nodes:after").unwrap();
        let first_leaf = events.iter().position(|e| e == "leaves:row").unwrap();
        assert!(after < first_leaf);
    }

    #[tokio::test]
    async fn test_self_reference_within_run() {
        let env = TestEnv::new(SNAPSHOT, TARGET).await;
        let report = env.engine(100).run(units(&Events::default())).await.unwrap();

        let nodes = report.unit("nodes").unwrap();
        assert_eq!(nodes.rows_inserted, 3);
        // Each child forces its pending parent out first.
        assert_eq!(nodes.batches, 3);
        assert_eq!(
            env.count(
                "SELECT COUNT(*) FROM nodes c JOIN nodes p ON c.parent_id = p.id
                 WHERE (c.name = 'child' AND p.name = 'root')
                    OR (c.name = 'grandchild' AND p.name = 'child')"
            )
            .await,
            2
        );

        let leaves = report.unit("leaves").unwrap();
        assert_eq!(leaves.rows_inserted, 2);
        assert_eq!(leaves.rows_rejected, 1);
    }

    #[tokio::test]
    async fn test_second_run_is_a_no_op() {
        let env = TestEnv::new(SNAPSHOT, TARGET).await;
        let first = env.engine(2).run(units(&Events::default())).await.unwrap();
        assert_eq!(first.rows_inserted, 5);
        let mapped = env.mappings.total_mapped().await.unwrap();
        let root = env.mappings.lookup(EntityType::Category, "1").await.unwrap();

        let second = env.engine(2).run(units(&Events::default())).await.unwrap();
        assert_eq!(second.rows_inserted, 0);
        assert_eq!(second.unit("nodes").unwrap().rows_processed, 0);
        assert_eq!(second.unit("leaves").unwrap().rows_skipped, 2);
        assert_eq!(env.mappings.total_mapped().await.unwrap(), mapped);
        assert_eq!(env.mappings.lookup(EntityType::Category, "1").await.unwrap(), root);
        assert_eq!(env.count("SELECT COUNT(*) FROM nodes").await, 3);
    }

    #[tokio::test]
    async fn test_self_reference_across_runs_and_unresolved() {
        let env = TestEnv::new(
            "CREATE TABLE nodes (id INTEGER PRIMARY KEY, name TEXT, parent_id INTEGER, depth INTEGER);
             CREATE TABLE leaves (id INTEGER PRIMARY KEY, node_id INTEGER, label TEXT);
             INSERT INTO nodes VALUES (1, 'root', NULL, 0);",
            TARGET,
        )
        .await;
        env.engine(100).run(units(&Events::default())).await.unwrap();
        let root = env.mappings.lookup(EntityType::Category, "1").await.unwrap().unwrap();

        env.update_snapshot(
            "INSERT INTO nodes VALUES (2, 'child', 1, 1), (3, 'orphan', 42, 1),
                                      (10, 'late parent', NULL, 5), (11, 'early child', 10, 1);",
        )
        .await;
        let report = env.engine(100).run(units(&Events::default())).await.unwrap();
        let nodes = report.unit("nodes").unwrap();
        assert_eq!(nodes.rows_processed, 4);
        assert_eq!(nodes.rows_inserted, 2);
        assert_eq!(nodes.rows_rejected, 2);
        let reasons: Vec<(Option<&str>, &str)> = report
            .rejections
            .iter()
            .map(|r| (r.original_id.as_deref(), r.reason.as_str()))
            .collect();
        assert_eq!(
            reasons,
            vec![
                (Some("3"), "unresolved parent_id '42'"),
                (Some("11"), "unresolved parent_id '10'"),
            ]
        );

        let child = env.mappings.lookup(EntityType::Category, "2").await.unwrap().unwrap();
        assert_eq!(
            env.target
                .count(&SourceQuery::new("SELECT parent_id FROM nodes WHERE id = $1").bind(child))
                .await
                .unwrap(),
            root
        );
        assert!(env.mappings.lookup(EntityType::Category, "10").await.unwrap().is_some());
        assert!(env.mappings.lookup(EntityType::Category, "11").await.unwrap().is_none());
        assert!(env.mappings.lookup(EntityType::Category, "3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cycle_fails_before_anything_runs() {
        let env = TestEnv::new(SNAPSHOT, TARGET).await;
        let events = Events::default();
        let mut units = units(&events);
        let looped = UnitDefinition::builder("nodes")
            .depends_on(&["leaves"])
            .produces(EntityType::Category)
            .table("nodes")
            .columns(&["name", "parent_id"])
            .rows_query(SourceQuery::new("SELECT id, name, parent_id FROM nodes"))
            .build()
            .unwrap();
        units[1] = Box::new(NodeUnit {
            def: looped,
            events: events.clone(),
        });

        let err = env.engine(100).run(units).await.unwrap_err();
        assert!(matches!(err, ImportError::Config(_)));
        assert!(err.to_string().contains("cycle"));
        assert!(events.lock().unwrap().is_empty());
        assert!(env.mappings.latest_run().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failure_stops_run_and_rerun_resumes() {
        let env = TestEnv::new(SNAPSHOT, TARGET).await;
        let failing = Arc::new(FailingTarget::new(env.target.clone(), "leaves", 1));

        let report = env
            .engine_with_target(failing, 100)
            .run(units(&Events::default()))
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::Failed);
        let failure = report.failure.clone().unwrap();
        assert_eq!(failure.unit, "leaves");
        assert!(failure.message.contains("connection reset"));
        assert_eq!(env.count("SELECT COUNT(*) FROM nodes").await, 3);
        assert_eq!(env.count("SELECT COUNT(*) FROM leaves").await, 0);

        let run = env.mappings.latest_run().await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.units.len(), 2);
        assert_eq!(run.units[1].status, UnitStatus::Failed);

        let rerun = env.engine(100).run(units(&Events::default())).await.unwrap();
        assert!(rerun.is_success());
        assert_eq!(rerun.unit("nodes").unwrap().rows_processed, 0);
        assert_eq!(rerun.unit("leaves").unwrap().rows_inserted, 2);
    }

    #[tokio::test]
    async fn test_plan_counts_pending_rows() {
        let env = TestEnv::new(SNAPSHOT, TARGET).await;
        let engine = env.engine(100);

        let plan = engine.plan(&units(&Events::default())).await.unwrap();
        assert_eq!(plan.units[0].unit, "nodes");
        assert_eq!(plan.units[0].pending_rows, Some(3));
        assert_eq!(plan.units[1].dependencies, vec!["nodes"]);
        assert_eq!(plan.units[1].pending_rows, None);

        engine.run(units(&Events::default())).await.unwrap();
        let plan = engine.plan(&units(&Events::default())).await.unwrap();
        assert_eq!(plan.units[0].pending_rows, Some(0));
    }

    #[tokio::test]
    async fn test_progress_and_report_json() {
        let env = TestEnv::new(SNAPSHOT, TARGET).await;
        let (tx, mut rx) = mpsc::channel(64);
        let report = env
            .engine(100)
            .with_progress(tx)
            .run(units(&Events::default()))
            .await
            .unwrap();

        let mut finished = Vec::new();
        while let Ok(update) = rx.try_recv() {
            if update.finished {
                finished.push(update.unit);
            }
        }
        assert_eq!(finished, vec!["nodes", "leaves"]);

        let json = report.to_json().unwrap();
        assert!(json.contains("\"status\": \"completed\""));
        assert!(json.contains("\"rows_inserted\": 5"));
    }

    #[tokio::test]
    async fn test_health_check() {
        let env = TestEnv::new(SNAPSHOT, TARGET).await;
        let health = env.engine(100).health_check().await;
        assert!(health.healthy);
        assert!(health.snapshot_error.is_none());
    }
}
