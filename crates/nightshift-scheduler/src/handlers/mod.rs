//! The built-in handlers and the batch loop they share.

mod cascade;
mod delete;
mod migrate;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::{
    batch::{BatchExecutor, RowMutation},
    error::BatchError,
    guard::{CutoffGuard, LoopEnd, LoopFailure},
    types::{BatchPlan, HandlerOutcome, Operation, StopReason},
};

pub use cascade::{CascadeDelete, CascadeDeleteHandler};
pub use delete::DeleteHandler;
pub use migrate::{CopyAndDelete, MigrationHandler};

/// A named unit of batch work, run once per run under a [`CutoffGuard`].
///
/// Implementations never return errors: a failing batch becomes
/// [`HandlerOutcome::Failed`], so the caller can move on to the next handler.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Configured handler name, used in logs and the run summary.
    fn name(&self) -> &str;

    fn operation(&self) -> Operation;

    async fn run(&self, guard: &CutoffGuard) -> HandlerOutcome;
}

/// Run `mutation` over `plan` batch by batch until the guard ends the loop.
///
/// Each batch runs on the blocking pool since rusqlite is synchronous.
pub(crate) async fn drive_batches(
    name: &str,
    executor: &BatchExecutor,
    plan: &Arc<BatchPlan>,
    mutation: &Arc<dyn RowMutation>,
    guard: &CutoffGuard,
) -> HandlerOutcome {
    info!(
        handler = name,
        table = %plan.table,
        operation = %mutation.operation(),
        batch_size = plan.batch_size,
        cut_off = %guard.deadline(),
        "handler started"
    );

    let result = guard
        .run(|batch| {
            let executor = executor.clone();
            let plan = Arc::clone(plan);
            let mutation = Arc::clone(mutation);
            async move {
                let joined = tokio::task::spawn_blocking(move || {
                    executor.run_batch(&plan, mutation.as_ref())
                })
                .await
                .map_err(|e| BatchError::Worker(e.to_string()))?;
                let result = joined?;
                debug!(
                    handler = name,
                    batch,
                    selected = result.selected,
                    rows = result.rows_affected,
                    elapsed_ms = result.elapsed.as_millis() as u64,
                    more_remain = result.more_remain,
                    "batch committed"
                );
                Ok(result)
            }
        })
        .await;

    match result {
        Ok(LoopEnd { reason, totals }) => {
            match reason {
                StopReason::Exhausted => {
                    info!(handler = name, rows = totals.rows, "no more eligible rows")
                }
                StopReason::Deadline => warn!(
                    handler = name,
                    rows = totals.rows,
                    "reached cut-off time; remaining rows wait for the next run"
                ),
                StopReason::Shutdown => warn!(
                    handler = name,
                    rows = totals.rows,
                    "shutdown requested; stopped before the next batch"
                ),
            }
            HandlerOutcome::from_stop(reason, totals)
        }
        Err(LoopFailure { error, totals }) => {
            HandlerOutcome::failed(totals, format!("batch {} failed: {error}", totals.batches + 1))
        }
    }
}
