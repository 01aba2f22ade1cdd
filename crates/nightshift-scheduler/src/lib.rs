//! `nightshift-scheduler`: batched, time-boxed row clean-up and migration
//! over SQLite.
//!
//! # Overview
//!
//! Once a day the [`engine::SchedulerEngine`] builds an immutable
//! [`orchestrator::RunContext`] from the current configuration and hands it to
//! the [`orchestrator::RunOrchestrator`], which runs the configured handlers
//! one after another. Each handler drives the [`batch::BatchExecutor`] under a
//! [`guard::CutoffGuard`] until no eligible rows remain or its cut-off time
//! passes. Every batch is one transaction.
//!
//! Only one run touches a store at a time: each run holds a [`lock::RunLock`]
//! on the source store, across processes.
//!
//! # Built-in handlers
//!
//! | Name                      | Kind             | Per batch                                  |
//! |---------------------------|------------------|--------------------------------------------|
//! | `delete_resource_handler` | `delete`         | delete the selected rows                   |
//! | `delete_workflow_handler` | `cascade_delete` | delete dependent rows, then the parents    |
//! | `migration_handler`       | `migrate`        | copy to the target table, verify, delete   |

pub mod batch;
pub mod clock;
pub mod db;
pub mod engine;
pub mod error;
pub mod guard;
pub mod handlers;
pub mod lock;
pub mod orchestrator;
pub mod registry;
pub mod schedule;
pub mod types;

pub use clock::{Clock, SystemClock};
pub use engine::{SchedulerEngine, SchedulerHandle};
pub use error::{BatchError, Result, SchedulerError};
pub use handlers::Handler;
pub use lock::RunLock;
pub use orchestrator::{RunContext, RunOrchestrator, Selection};
pub use registry::HandlerRegistry;
pub use types::{HandlerOutcome, RunSummary, TriggerState};
