use std::sync::Arc;

use async_trait::async_trait;
use nightshift_core::{ConfigError, HandlerConfig};

use super::{drive_batches, Handler};
use crate::{
    batch::{BatchExecutor, DeleteRows, RowMutation},
    db::Connector,
    guard::CutoffGuard,
    types::{BatchPlan, HandlerOutcome, Operation},
};

/// Deletes rows matching the predicate, one batch at a time.
pub struct DeleteHandler {
    name: String,
    executor: BatchExecutor,
    plan: Arc<BatchPlan>,
    mutation: Arc<dyn RowMutation>,
}

impl DeleteHandler {
    pub fn new(config: &HandlerConfig, connector: Arc<Connector>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            name: config.name.clone(),
            executor: BatchExecutor::new(connector),
            plan: Arc::new(BatchPlan::from_config(config)),
            mutation: Arc::new(DeleteRows),
        })
    }
}

#[async_trait]
impl Handler for DeleteHandler {
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
