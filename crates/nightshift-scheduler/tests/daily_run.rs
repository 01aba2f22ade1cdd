//! End-to-end runs against real SQLite files.

use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use nightshift_core::types::RunTrigger;
use nightshift_core::{ConfigError, NightshiftConfig};
use nightshift_scheduler::clock::{ManualClock, ScriptedClock};
use nightshift_scheduler::{
    HandlerOutcome, HandlerRegistry, RunContext, RunLock, RunOrchestrator, SchedulerEngine,
    SchedulerError, Selection,
};
use rusqlite::Connection;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn at(h: u32, m: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 9, 14)
        .unwrap()
        .and_hms_opt(h, m, 0)
        .unwrap()
}

/// Live store with resources, a workflow tree and closed orders; archive store
/// with an empty `orders` table.
struct Stores {
    dir: TempDir,
}

impl Stores {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let live = Connection::open(dir.path().join("live.db")).unwrap();
        live.execute_batch(
            "CREATE TABLE work_resources (id INTEGER PRIMARY KEY, deleted INTEGER NOT NULL);
             CREATE TABLE workflows (id INTEGER PRIMARY KEY, finished INTEGER NOT NULL);
             CREATE TABLE workflow_steps (
                 id INTEGER PRIMARY KEY,
                 workflow_id INTEGER NOT NULL REFERENCES workflows(id)
             );
             CREATE TABLE orders (id INTEGER PRIMARY KEY, total INTEGER, closed INTEGER NOT NULL);

             WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n WHERE i < 6)
             INSERT INTO work_resources SELECT i, 1 FROM n;
             INSERT INTO workflows VALUES (1, 1), (2, 0), (3, 1);
             INSERT INTO workflow_steps VALUES (1, 1), (2, 1), (3, 2), (4, 3);
             INSERT INTO orders VALUES (1, 10, 1), (2, 20, 1), (3, 30, 0);",
        )
        .unwrap();
        let archive = Connection::open(dir.path().join("archive.db")).unwrap();
        archive
            .execute_batch(
                "CREATE TABLE orders (id INTEGER PRIMARY KEY, total INTEGER, closed INTEGER NOT NULL);",
            )
            .unwrap();
        Self { dir }
    }

    fn path(&self, name: &str) -> String {
        self.dir.path().join(name).to_string_lossy().into_owned()
    }

    fn live(&self) -> Connection {
        Connection::open(self.path("live.db")).unwrap()
    }

    fn count(&self, db: &str, table: &str) -> i64 {
        Connection::open(self.path(db))
            .unwrap()
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
            .unwrap()
    }

    fn config(&self, scheduled: &[&str]) -> NightshiftConfig {
        let handlers = scheduled
            .iter()
            .map(|h| format!("\"{h}\""))
            .collect::<Vec<_>>()
            .join(", ");
        NightshiftConfig::from_toml_str(&format!(
            r#"
[scheduler]
start_time = "02:00"
handlers = [{handlers}]

[database.source]
path = "{live}"

[database.target]
path = "{archive}"

[handlers.delete_resource_handler]
table = "work_resources"
predicate = "deleted = 1"
batch_size = 2

[handlers.delete_workflow_handler]
table = "workflows"
predicate = "finished = 1"
batch_size = 10

[[handlers.delete_workflow_handler.children]]
table = "workflow_steps"
foreign_key = "workflow_id"

[handlers.migration_handler]
table = "orders"
predicate = "closed = 1"
target_table = "orders"
batch_size = 10
cut_off_time = "22:30"

[handlers.mystery]
table = "orders"
predicate = "1 = 1"
"#,
            live = self.path("live.db"),
            archive = self.path("archive.db"),
        ))
        .unwrap()
    }
}

const ALL: [&str; 3] = [
    "delete_resource_handler",
    "delete_workflow_handler",
    "migration_handler",
];

#[tokio::test]
async fn failing_batch_does_not_stop_later_handlers() {
    let stores = Stores::new();
    stores
        .live()
        .execute_batch(
            "CREATE TRIGGER keep_three BEFORE DELETE ON work_resources WHEN OLD.id = 3
             BEGIN SELECT RAISE(ABORT, 'resource 3 is locked'); END;",
        )
        .unwrap();
    let config = stores.config(&ALL);

    let ctx = RunContext::build(
        &config,
        &HandlerRegistry::with_builtins(),
        &Selection::All,
        RunTrigger::Scheduled,
        at(2, 0),
    )
    .unwrap();
    let orchestrator =
        RunOrchestrator::new(Arc::new(ManualClock::new(at(2, 0))), CancellationToken::new());
    let summary = orchestrator.execute(ctx).await;

    let order: Vec<_> = summary.handlers.iter().map(|r| r.handler.as_str()).collect();
    assert_eq!(order, ALL);

    match summary.outcome("delete_resource_handler").unwrap() {
        HandlerOutcome::Failed {
            batches,
            rows,
            cause,
        } => {
            assert_eq!((*batches, *rows), (1, 2));
            assert!(cause.contains("batch 2 failed"), "{cause}");
            assert!(cause.contains("resource 3 is locked"), "{cause}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(
        summary.outcome("delete_workflow_handler"),
        Some(&HandlerOutcome::Completed { batches: 1, rows: 2 })
    );
    assert_eq!(
        summary.outcome("migration_handler"),
        Some(&HandlerOutcome::Completed { batches: 1, rows: 2 })
    );

    // the first batch stays committed, the failed one is rolled back
    assert_eq!(stores.count("live.db", "work_resources"), 4);
    assert_eq!(stores.count("live.db", "workflows"), 1);
    assert_eq!(stores.count("live.db", "workflow_steps"), 1);
    assert_eq!(stores.count("live.db", "orders"), 1);
    assert_eq!(stores.count("archive.db", "orders"), 2);
}

#[tokio::test]
async fn cutoff_leaves_remaining_rows_for_the_next_run() {
    let stores = Stores::new();
    stores
        .live()
        .execute_batch(
            "CREATE TABLE events (id INTEGER PRIMARY KEY, expired INTEGER NOT NULL);
             WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n WHERE i < 12000)
             INSERT INTO events SELECT i, 1 FROM n;",
        )
        .unwrap();
    let mut config = stores.config(&["delete_resource_handler"]);
    let mut section = config.handlers["delete_resource_handler"].clone();
    section.table = "events".into();
    section.predicate = "expired = 1".into();
    section.batch_size = 5000;
    section.cut_off_time = chrono::NaiveTime::from_hms_opt(23, 0, 0).unwrap();
    config
        .handlers
        .insert("delete_resource_handler".into(), section);

    let ctx = RunContext::build(
        &config,
        &HandlerRegistry::with_builtins(),
        &Selection::All,
        RunTrigger::Scheduled,
        at(2, 0),
    )
    .unwrap();
    // one reading per check: before batch 1, before batch 2, before batch 3
    let clock = ScriptedClock::new([at(21, 0), at(22, 10), at(23, 0)]);
    let summary = RunOrchestrator::new(Arc::new(clock), CancellationToken::new())
        .execute(ctx)
        .await;

    assert_eq!(
        summary.outcome("delete_resource_handler"),
        Some(&HandlerOutcome::CutoffStopped {
            batches: 2,
            rows: 10_000
        })
    );
    assert_eq!(stores.count("live.db", "events"), 2_000);
    let lowest: i64 = stores
        .live()
        .query_row("SELECT MIN(id) FROM events", [], |r| r.get(0))
        .unwrap();
    assert_eq!(lowest, 10_001);
}

#[tokio::test]
async fn unresolvable_handler_aborts_before_any_mutation() {
    let stores = Stores::new();
    let config = stores.config(&["delete_resource_handler", "mystery"]);

    let err = RunContext::build(
        &config,
        &HandlerRegistry::with_builtins(),
        &Selection::All,
        RunTrigger::Scheduled,
        at(2, 0),
    )
    .err()
    .unwrap();
    assert!(matches!(err, ConfigError::UnknownHandler { ref name } if name == "mystery"));

    let mut engine = SchedulerEngine::new(
        config,
        HandlerRegistry::with_builtins(),
        Arc::new(ManualClock::new(at(2, 0))),
    );
    let result = engine
        .run_once(Selection::All, RunTrigger::Scheduled, &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(SchedulerError::Config(_))));
    assert_eq!(stores.count("live.db", "work_resources"), 6);
    assert_eq!(stores.count("live.db", "orders"), 3);
}

#[tokio::test]
async fn shutdown_before_run_stops_every_handler_untouched() {
    let stores = Stores::new();
    let config = stores.config(&ALL);
    let shutdown = CancellationToken::new();
    shutdown.cancel();

    let mut engine = SchedulerEngine::new(
        config,
        HandlerRegistry::with_builtins(),
        Arc::new(ManualClock::new(at(2, 0))),
    );
    let summary = engine
        .run_once(Selection::All, RunTrigger::OnDemand, &shutdown)
        .await
        .unwrap();
    assert_eq!(summary.handlers.len(), 3);
    for report in &summary.handlers {
        assert_eq!(
            report.outcome,
            HandlerOutcome::CutoffStopped {
                batches: 0,
                rows: 0
            }
        );
    }
    assert_eq!(stores.count("live.db", "work_resources"), 6);
}

#[tokio::test]
async fn migration_past_its_cut_off_does_nothing() {
    let stores = Stores::new();
    let config = stores.config(&["migration_handler"]);

    let mut engine = SchedulerEngine::new(
        config,
        HandlerRegistry::with_builtins(),
        Arc::new(ManualClock::new(at(22, 45))),
    );
    let summary = engine
        .run_once(
            Selection::Only("migration_handler".into()),
            RunTrigger::OnDemand,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(
        summary.outcome("migration_handler"),
        Some(&HandlerOutcome::CutoffStopped {
            batches: 0,
            rows: 0
        })
    );
    assert_eq!(stores.count("live.db", "orders"), 3);
    assert_eq!(stores.count("archive.db", "orders"), 0);
}

#[tokio::test]
async fn second_run_is_refused_while_the_store_is_locked() {
    let stores = Stores::new();
    let config = stores.config(&["delete_resource_handler"]);
    // another process mid-run on the same store
    let held = RunLock::acquire(&stores.path("live.db")).unwrap();

    let mut engine = SchedulerEngine::new(
        config,
        HandlerRegistry::with_builtins(),
        Arc::new(ManualClock::new(at(2, 0))),
    );
    let result = engine
        .run_once(
            Selection::Only("delete_resource_handler".into()),
            RunTrigger::OnDemand,
            &CancellationToken::new(),
        )
        .await;
    match result {
        Err(SchedulerError::RunInProgress { lock }) => assert_eq!(lock, held.path()),
        other => panic!("expected the run to be refused, got {other:?}"),
    }
    assert_eq!(stores.count("live.db", "work_resources"), 6);

    drop(held);
    let summary = engine
        .run_once(
            Selection::Only("delete_resource_handler".into()),
            RunTrigger::OnDemand,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(
        summary.outcome("delete_resource_handler"),
        Some(&HandlerOutcome::Completed { batches: 3, rows: 6 })
    );
    assert_eq!(stores.count("live.db", "work_resources"), 0);
}
