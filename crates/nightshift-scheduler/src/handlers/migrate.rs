use std::sync::Arc;

use async_trait::async_trait;
use nightshift_core::config::ConflictPolicy;
use nightshift_core::{ConfigError, HandlerConfig};
use rusqlite::Transaction;

use super::{drive_batches, Handler};
use crate::{
    batch::{delete_staged_sql, BatchExecutor, RowMutation},
    db::{qualified, quote_ident, staged_keys, Connector},
    error::BatchError,
    guard::CutoffGuard,
    types::{BatchPlan, HandlerOutcome, Operation},
};

/// Copies the staged rows into the target table, verifies the copy and then
/// deletes them from the source, all in the batch transaction.
#[derive(Debug, Clone)]
pub struct CopyAndDelete {
    target_schema: String,
    target_table: String,
    columns: Vec<String>,
    on_conflict: ConflictPolicy,
}

impl CopyAndDelete {
    pub fn new(
        target_schema: impl Into<String>,
        target_table: impl Into<String>,
        columns: Vec<String>,
        on_conflict: ConflictPolicy,
    ) -> Self {
        Self {
            target_schema: target_schema.into(),
            target_table: target_table.into(),
            columns,
            on_conflict,
        }
    }

    fn copy_sql(&self, plan: &BatchPlan) -> String {
        let verb = match self.on_conflict {
            ConflictPolicy::Replace => "INSERT OR REPLACE",
            ConflictPolicy::Ignore => "INSERT OR IGNORE",
        };
        let target = qualified(&self.target_schema, &self.target_table);
        let source = qualified("main", &plan.table);
        let key = quote_ident(&plan.key_column);
        if self.columns.is_empty() {
            format!(
                "{verb} INTO {target} SELECT * FROM {source} WHERE {key} IN ({})",
                staged_keys()
            )
        } else {
            let list = self
                .columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ");
            format!(
                "{verb} INTO {target} ({list}) SELECT {list} FROM {source} WHERE {key} IN ({})",
                staged_keys()
            )
        }
    }
}

impl RowMutation for CopyAndDelete {
    fn operation(&self) -> Operation {
        Operation::CopyAndDelete
    }

    fn apply(
        &self,
        tx: &Transaction<'_>,
        plan: &BatchPlan,
        staged: usize,
    ) -> Result<usize, BatchError> {
        tx.execute(&self.copy_sql(plan), [])?;

        let copied: i64 = tx.query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE {} IN ({})",
                qualified(&self.target_schema, &self.target_table),
                quote_ident(&plan.key_column),
                staged_keys()
            ),
            [],
            |row| row.get(0),
        )?;
        if copied as usize != staged {
            return Err(BatchError::Verification {
                table: self.target_table.clone(),
                expected: staged,
                found: copied as usize,
            });
        }

        let deleted = tx.execute(&delete_staged_sql(plan), [])?;
        if deleted != staged {
            return Err(BatchError::Verification {
                table: plan.table.clone(),
                expected: staged,
                found: deleted,
            });
        }
        Ok(deleted)
    }
}

/// Moves eligible rows to the archive table.
pub struct MigrationHandler {
    name: String,
    executor: BatchExecutor,
    plan: Arc<BatchPlan>,
    mutation: Arc<dyn RowMutation>,
}

impl MigrationHandler {
    pub fn new(config: &HandlerConfig, connector: Arc<Connector>) -> Result<Self, ConfigError> {
        config.validate()?;
        let target_table = config
            .target_table
            .clone()
            .ok_or_else(|| ConfigError::MissingField {
                handler: config.name.clone(),
                field: "target_table",
            })?;
        let mutation = CopyAndDelete::new(
            connector.target_schema(),
            target_table,
            config.columns.clone(),
            config.on_conflict,
        );
        Ok(Self {
            name: config.name.clone(),
            executor: BatchExecutor::new(connector),
            plan: Arc::new(BatchPlan::from_config(config)),
            mutation: Arc::new(mutation),
        })
    }
}

#[async_trait]
impl Handler for MigrationHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn operation(&self) -> Operation {
        Operation::CopyAndDelete
    }

    async fn run(&self, guard: &CutoffGuard) -> HandlerOutcome {
        drive_batches(&self.name, &self.executor, &self.plan, &self.mutation, guard).await
    }
}
