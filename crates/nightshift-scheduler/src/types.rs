use std::fmt;
use std::time::Duration;

use chrono::NaiveDateTime;
use nightshift_core::types::{RunId, RunTrigger};
use nightshift_core::HandlerConfig;
use serde::{Deserialize, Serialize};

/// What a batch does with the rows it selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Delete,
    CopyAndDelete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Delete => write!(f, "delete"),
            Operation::CopyAndDelete => write!(f, "copy_and_delete"),
        }
    }
}

/// Where and how many rows one batch selects.
#[derive(Debug, Clone)]
pub struct BatchPlan {
    pub table: String,
    pub key_column: String,
    pub predicate: String,
    pub batch_size: usize,
}

impl BatchPlan {
    pub fn from_config(config: &HandlerConfig) -> Self {
        Self {
            table: config.table.clone(),
            key_column: config.key_column.clone(),
            predicate: config.predicate.clone(),
            batch_size: config.batch_size,
        }
    }
}

/// Result of one committed batch.
#[derive(Debug, Clone)]
pub struct BatchResult {
    /// Keys selected by the predicate (at most the batch size).
    pub selected: usize,
    /// Rows removed from the handler's table (or dependent rows, when the
    /// parent rows are retained).
    pub rows_affected: usize,
    pub elapsed: Duration,
    /// A full batch was selected and it changed something.
    pub more_remain: bool,
}

/// Running totals for one handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchTotals {
    /// Non-empty batches committed.
    pub batches: u64,
    pub rows: u64,
}

impl BatchTotals {
    pub fn record(&mut self, result: &BatchResult) {
        if result.selected > 0 {
            self.batches += 1;
            self.rows += result.rows_affected as u64;
        }
    }
}

/// Why a guarded batch loop ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// No eligible rows are left.
    Exhausted,
    /// The handler's cut-off time was reached.
    Deadline,
    /// The daemon is shutting down.
    Shutdown,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Exhausted => write!(f, "exhausted"),
            StopReason::Deadline => write!(f, "deadline"),
            StopReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Terminal state of one handler in one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HandlerOutcome {
    /// Every eligible row was processed.
    Completed { batches: u64, rows: u64 },
    /// Stopped before the next batch; remaining rows are left for the next run.
    CutoffStopped { batches: u64, rows: u64 },
    /// A batch failed; its transaction was rolled back.
    Failed {
        batches: u64,
        rows: u64,
        cause: String,
    },
}

impl HandlerOutcome {
    pub fn from_stop(reason: StopReason, totals: BatchTotals) -> Self {
        let BatchTotals { batches, rows } = totals;
        match reason {
            StopReason::Exhausted => HandlerOutcome::Completed { batches, rows },
            StopReason::Deadline | StopReason::Shutdown => {
                HandlerOutcome::CutoffStopped { batches, rows }
            }
        }
    }

    pub fn failed(totals: BatchTotals, cause: impl Into<String>) -> Self {
        HandlerOutcome::Failed {
            batches: totals.batches,
            rows: totals.rows,
            cause: cause.into(),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, HandlerOutcome::Failed { .. })
    }

    pub fn totals(&self) -> BatchTotals {
        match self {
            HandlerOutcome::Completed { batches, rows }
            | HandlerOutcome::CutoffStopped { batches, rows }
            | HandlerOutcome::Failed { batches, rows, .. } => BatchTotals {
                batches: *batches,
                rows: *rows,
            },
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            HandlerOutcome::Completed { .. } => "completed",
            HandlerOutcome::CutoffStopped { .. } => "cutoff_stopped",
            HandlerOutcome::Failed { .. } => "failed",
        }
    }
}

/// One handler's line in a [`RunSummary`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerReport {
    pub handler: String,
    pub outcome: HandlerOutcome,
    pub elapsed_ms: u64,
}

/// The externally visible result of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub trigger: RunTrigger,
    pub started_at: NaiveDateTime,
    pub duration_ms: u64,
    /// In configured order, one entry per handler.
    pub handlers: Vec<HandlerReport>,
}

impl RunSummary {
    pub fn any_failed(&self) -> bool {
        self.handlers.iter().any(|r| r.outcome.is_failed())
    }

    pub fn outcome(&self, handler: &str) -> Option<&HandlerOutcome> {
        self.handlers
            .iter()
            .find(|r| r.handler == handler)
            .map(|r| &r.outcome)
    }
}

/// Lifecycle of the daily trigger, published on a `watch` channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TriggerState {
    Idle,
    Waiting { next: NaiveDateTime },
    Running { run_id: RunId, trigger: RunTrigger },
    Stopped,
}
