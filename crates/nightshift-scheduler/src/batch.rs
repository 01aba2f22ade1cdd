use std::sync::Arc;
use std::time::Instant;

use rusqlite::{Transaction, TransactionBehavior};
use tracing::trace;

use crate::{
    db::{qualified, quote_ident, staged_keys, Connector, STAGING_TABLE},
    error::BatchError,
    types::{BatchPlan, BatchResult, Operation},
};

/// The per-row work a handler performs on one batch.
///
/// `apply` runs inside the batch transaction after the selected keys have been
/// staged (see [`staged_keys`]). Returning an error rolls the whole batch back.
pub trait RowMutation: Send + Sync {
    fn operation(&self) -> Operation;

    /// Mutate the staged rows and return how many rows were affected.
    fn apply(
        &self,
        tx: &Transaction<'_>,
        plan: &BatchPlan,
        staged: usize,
    ) -> Result<usize, BatchError>;
}

/// Plain delete of the staged rows.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteRows;

impl RowMutation for DeleteRows {
    fn operation(&self) -> Operation {
        Operation::Delete
    }

    fn apply(
        &self,
        tx: &Transaction<'_>,
        plan: &BatchPlan,
        _staged: usize,
    ) -> Result<usize, BatchError> {
        let deleted = tx.execute(&delete_staged_sql(plan), [])?;
        Ok(deleted)
    }
}

/// `DELETE` of the plan's table restricted to the staged keys.
pub(crate) fn delete_staged_sql(plan: &BatchPlan) -> String {
    format!(
        "DELETE FROM {} WHERE {} IN ({})",
        qualified("main", &plan.table),
        quote_ident(&plan.key_column),
        staged_keys()
    )
}

/// Selects and mutates one bounded chunk of rows per call.
#[derive(Debug, Clone)]
pub struct BatchExecutor {
    connector: Arc<Connector>,
}

impl BatchExecutor {
    pub fn new(connector: Arc<Connector>) -> Self {
        Self { connector }
    }

    pub fn connector(&self) -> &Connector {
        &self.connector
    }

    /// Run one batch in its own transaction.
    ///
    /// Selects up to `plan.batch_size` keys matching the predicate in ascending
    /// key order, applies `mutation` to them and commits. Nothing is committed
    /// unless every statement of the batch succeeds. The connection is closed
    /// before returning.
    pub fn run_batch(
        &self,
        plan: &BatchPlan,
        mutation: &dyn RowMutation,
    ) -> Result<BatchResult, BatchError> {
        let started = Instant::now();
        let mut conn = self.connector.open()?;
        // IMMEDIATE takes the write lock before selecting, so the selected rows
        // cannot change underneath the batch.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(&format!("DELETE FROM {STAGING_TABLE}"), [])?;
        let limit = i64::try_from(plan.batch_size).unwrap_or(i64::MAX);
        let staged = tx.execute(&select_sql(plan), [limit])?;

        let rows_affected = if staged == 0 {
            0
        } else {
            mutation.apply(&tx, plan, staged)?
        };
        tx.commit()?;

        trace!(
            table = %plan.table,
            operation = %mutation.operation(),
            staged,
            rows_affected,
            "batch transaction committed"
        );

        Ok(BatchResult {
            selected: staged,
            rows_affected,
            elapsed: started.elapsed(),
            more_remain: staged == plan.batch_size && rows_affected > 0,
        })
    }
}

fn select_sql(plan: &BatchPlan) -> String {
    let key = quote_ident(&plan.key_column);
    format!(
        "INSERT INTO {STAGING_TABLE} (batch_key)
         SELECT {key} FROM {} WHERE ({}) ORDER BY {key} LIMIT ?1",
        qualified("main", &plan.table),
        plan.predicate
    )
}
