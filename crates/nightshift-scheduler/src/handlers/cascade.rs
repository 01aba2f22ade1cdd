use std::sync::Arc;

use async_trait::async_trait;
use nightshift_core::config::ChildTableConfig;
use nightshift_core::{ConfigError, HandlerConfig};
use rusqlite::Transaction;
use tracing::{debug, warn};

use super::{drive_batches, Handler};
use crate::{
    batch::{delete_staged_sql, BatchExecutor, RowMutation},
    db::{qualified, quote_ident, staged_keys, Connector},
    error::BatchError,
    guard::CutoffGuard,
    types::{BatchPlan, HandlerOutcome, Operation},
};

/// Deletes each staged parent row together with its dependent rows.
///
/// Dependents are deleted depth-first (deepest table first, parent last) in
/// the batch transaction, so foreign keys are never left dangling even with
/// `PRAGMA foreign_keys = ON`.
#[derive(Debug, Clone)]
pub struct CascadeDelete {
    children: Vec<ChildTableConfig>,
    retain_parent: bool,
}

impl CascadeDelete {
    pub fn new(children: Vec<ChildTableConfig>, retain_parent: bool) -> Self {
        Self {
            children,
            retain_parent,
        }
    }
}

impl RowMutation for CascadeDelete {
    fn operation(&self) -> Operation {
        Operation::Delete
    }

    fn apply(
        &self,
        tx: &Transaction<'_>,
        plan: &BatchPlan,
        staged: usize,
    ) -> Result<usize, BatchError> {
        let parent_keys = staged_keys();
        let mut dependents = 0;
        for child in &self.children {
            dependents += delete_subtree(tx, child, &parent_keys)?;
        }

        if self.retain_parent {
            if stalled_on_kept_parents(plan, staged, dependents) {
                warn!(
                    table = %plan.table,
                    staged,
                    "full batch of kept parents had no dependents left; \
                     later parents are not visited until the predicate excludes cleaned ones"
                );
            }
            return Ok(dependents);
        }
        let parents = tx.execute(&delete_staged_sql(plan), [])?;
        debug!(table = %plan.table, parents, dependents, "cascade delete applied");
        Ok(parents)
    }
}

/// A full batch of retained parents that yielded no dependent rows ends the
/// loop while more parents may still match.
fn stalled_on_kept_parents(plan: &BatchPlan, staged: usize, dependents: usize) -> bool {
    staged == plan.batch_size && dependents == 0
}

/// Delete the rows of `child` referencing `parent_keys`, after their own
/// dependents. Returns the number of rows deleted in the whole subtree.
fn delete_subtree(
    tx: &Transaction<'_>,
    child: &ChildTableConfig,
    parent_keys: &str,
) -> Result<usize, BatchError> {
    let table = qualified("main", &child.table);
    let mut filter = format!("{} IN ({parent_keys})", quote_ident(&child.foreign_key));
    if let Some(predicate) = &child.predicate {
        filter.push_str(&format!(" AND ({predicate})"));
    }

    let mut deleted = 0;
    if !child.children.is_empty() {
        let own_keys = format!(
            "SELECT {} FROM {table} WHERE {filter}",
            quote_ident(&child.key_column)
        );
        for grandchild in &child.children {
            deleted += delete_subtree(tx, grandchild, &own_keys)?;
        }
    }

    if !child.retain {
        let n = tx.execute(&format!("DELETE FROM {table} WHERE {filter}"), [])?;
        debug!(table = %child.table, rows = n, "dependent rows deleted");
        deleted += n;
    }
    Ok(deleted)
}

/// Workflow clean-up: removes workflow rows with their steps, actors and any
/// other configured dependents.
pub struct CascadeDeleteHandler {
    name: String,
    executor: BatchExecutor,
    plan: Arc<BatchPlan>,
    mutation: Arc<dyn RowMutation>,
}

impl CascadeDeleteHandler {
    pub fn new(config: &HandlerConfig, connector: Arc<Connector>) -> Result<Self, ConfigError> {
        config.validate()?;
        if config.children.is_empty() {
            return Err(ConfigError::MissingField {
                handler: config.name.clone(),
                field: "children",
            });
        }
        Ok(Self {
            name: config.name.clone(),
            executor: BatchExecutor::new(connector),
            plan: Arc::new(BatchPlan::from_config(config)),
            mutation: Arc::new(CascadeDelete::new(
                config.children.clone(),
                config.retain_parent,
            )),
        })
    }
}

#[async_trait]
impl Handler for CascadeDeleteHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn operation(&self) -> Operation {
        Operation::Delete
    }

    async fn run(&self, guard: &CutoffGuard) -> HandlerOutcome {
        drive_batches(&self.name, &self.executor, &self.plan, &self.mutation, guard).await
    }
}
