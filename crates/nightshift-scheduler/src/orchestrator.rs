use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDateTime;
use nightshift_core::types::{RunId, RunTrigger};
use nightshift_core::{ConfigError, HandlerConfig, NightshiftConfig};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::{
    clock::Clock,
    db::Connector,
    guard::CutoffGuard,
    handlers::Handler,
    registry::HandlerRegistry,
    types::{BatchTotals, HandlerOutcome, HandlerReport, RunSummary},
};

/// Which handlers a run covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// The scheduled handler list, in configured order.
    All,
    /// A single configured handler.
    Only(String),
}

/// A handler resolved for one run, with the section it was built from.
pub struct PlannedHandler {
    pub config: HandlerConfig,
    pub handler: Arc<dyn Handler>,
}

/// Everything one run needs. Built per firing and never mutated.
pub struct RunContext {
    pub run_id: RunId,
    pub trigger: RunTrigger,
    pub started_at: NaiveDateTime,
    pub handlers: Vec<PlannedHandler>,
}

impl RunContext {
    /// Resolve every selected handler up front.
    ///
    /// Any handler that cannot be resolved fails the whole run before a single
    /// batch runs.
    pub fn build(
        config: &NightshiftConfig,
        registry: &HandlerRegistry,
        selection: &Selection,
        trigger: RunTrigger,
        started_at: NaiveDateTime,
    ) -> Result<Self, ConfigError> {
        let names: Vec<&str> = match selection {
            Selection::All => config.scheduler.handlers.iter().map(String::as_str).collect(),
            Selection::Only(name) => vec![name.as_str()],
        };

        let connector = Arc::new(Connector::from_config(&config.database));
        let mut handlers = Vec::with_capacity(names.len());
        for name in names {
            let section = config.handler(name).ok_or_else(|| ConfigError::UnknownHandler {
                name: name.to_string(),
            })?;
            let handler = registry.resolve(section, Arc::clone(&connector))?;
            handlers.push(PlannedHandler {
                config: section.clone(),
                handler,
            });
        }

        Ok(Self {
            run_id: RunId::new(),
            trigger,
            started_at,
            handlers,
        })
    }

    pub fn handler_names(&self) -> Vec<&str> {
        self.handlers.iter().map(|p| p.handler.name()).collect()
    }
}

/// Runs the handlers of a [`RunContext`] one after another.
#[derive(Clone)]
pub struct RunOrchestrator {
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
}

impl RunOrchestrator {
    pub fn new(clock: Arc<dyn Clock>, shutdown: CancellationToken) -> Self {
        Self { clock, shutdown }
    }

    /// Run every planned handler in order and summarize the outcomes.
    ///
    /// A failing or panicking handler is recorded and the next one still runs.
    pub async fn execute(&self, ctx: RunContext) -> RunSummary {
        let span = info_span!("run", run_id = %ctx.run_id, trigger = %ctx.trigger);
        async {
            info!(
                started_at = %ctx.started_at,
                handlers = ?ctx.handler_names(),
                "maintenance run started"
            );
            let started = Instant::now();

            let mut reports = Vec::with_capacity(ctx.handlers.len());
            for planned in &ctx.handlers {
                let handler_started = Instant::now();
                let outcome = self.run_handler(&ctx, planned).await;
                let elapsed_ms = handler_started.elapsed().as_millis() as u64;
                log_outcome(planned.handler.name(), &outcome, elapsed_ms);
                reports.push(HandlerReport {
                    handler: planned.handler.name().to_string(),
                    outcome,
                    elapsed_ms,
                });
            }

            let summary = RunSummary {
                run_id: ctx.run_id.clone(),
                trigger: ctx.trigger,
                started_at: ctx.started_at,
                duration_ms: started.elapsed().as_millis() as u64,
                handlers: reports,
            };
            info!(
                duration_ms = summary.duration_ms,
                failed = summary.any_failed(),
                "maintenance run finished"
            );
            summary
        }
        .instrument(span)
        .await
    }

    /// Run one handler under its own cut-off.
    ///
    /// The handler runs in a separate task, so a panic surfaces here as a
    /// failed outcome instead of unwinding through the run.
    pub async fn run_handler(&self, ctx: &RunContext, planned: &PlannedHandler) -> HandlerOutcome {
        let guard = CutoffGuard::for_run(
            ctx.started_at,
            planned.config.cut_off_time,
            Arc::clone(&self.clock),
            self.shutdown.clone(),
        )
        .with_pause(Duration::from_secs(planned.config.pause_secs));

        let handler = Arc::clone(&planned.handler);
        let span = info_span!("handler", handler = %handler.name());
        let task = tokio::spawn(async move { handler.run(&guard).await }.instrument(span));

        match task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                HandlerOutcome::failed(BatchTotals::default(), format!("handler task failed: {e}"))
            }
        }
    }
}

fn log_outcome(handler: &str, outcome: &HandlerOutcome, elapsed_ms: u64) {
    match outcome {
        HandlerOutcome::Completed { batches, rows } => {
            info!(handler, batches, rows, elapsed_ms, "handler completed")
        }
        HandlerOutcome::CutoffStopped { batches, rows } => {
            warn!(handler, batches, rows, elapsed_ms, "handler stopped at cut-off")
        }
        HandlerOutcome::Failed {
            batches,
            rows,
            cause,
        } => error!(handler, batches, rows, elapsed_ms, %cause, "handler failed"),
    }
}
