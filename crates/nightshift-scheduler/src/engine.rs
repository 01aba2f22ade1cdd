use std::sync::Arc;
use std::time::Duration;

use nightshift_core::types::RunTrigger;
use nightshift_core::{ConfigError, NightshiftConfig};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    clock::Clock,
    error::{Result, SchedulerError},
    orchestrator::{RunContext, RunOrchestrator, Selection},
    lock::RunLock,
    registry::HandlerRegistry,
    schedule::{following_daily_run, next_daily_run},
    types::{RunSummary, TriggerState},
};

/// Produces a fresh configuration at every firing.
pub type ConfigLoader =
    Arc<dyn Fn() -> std::result::Result<NightshiftConfig, ConfigError> + Send + Sync>;

/// Queued request for an immediate run.
struct RunRequest {
    selection: Selection,
    reply: oneshot::Sender<Result<RunSummary>>,
}

/// Cloneable handle for requesting runs and watching the trigger while the
/// engine loop runs.
#[derive(Clone)]
pub struct SchedulerHandle {
    requests: mpsc::Sender<RunRequest>,
    state: watch::Receiver<TriggerState>,
}

impl SchedulerHandle {
    /// Run now and wait for the summary.
    ///
    /// Requests made while a run is in progress are queued behind it. The
    /// next scheduled firing is not affected.
    pub async fn run_now(&self, selection: Selection) -> Result<RunSummary> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(RunRequest { selection, reply })
            .await
            .map_err(|_| SchedulerError::EngineStopped)?;
        rx.await.map_err(|_| SchedulerError::EngineStopped)?
    }

    pub fn state(&self) -> TriggerState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TriggerState> {
        self.state.clone()
    }
}

/// Daily trigger: fires the configured handlers once a day at the start time
/// and serves immediate-run requests in between.
pub struct SchedulerEngine {
    config: NightshiftConfig,
    loader: Option<ConfigLoader>,
    registry: HandlerRegistry,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    requests_tx: mpsc::Sender<RunRequest>,
    requests: mpsc::Receiver<RunRequest>,
    state: watch::Sender<TriggerState>,
    /// If set, every summary is forwarded here.
    summaries: Option<mpsc::Sender<RunSummary>>,
}

impl SchedulerEngine {
    pub fn new(config: NightshiftConfig, registry: HandlerRegistry, clock: Arc<dyn Clock>) -> Self {
        let (requests_tx, requests) = mpsc::channel(16);
        let (state, _) = watch::channel(TriggerState::Idle);
        let poll_interval = Duration::from_secs(config.scheduler.poll_interval_secs.max(1));
        Self {
            config,
            loader: None,
            registry,
            clock,
            poll_interval,
            requests_tx,
            requests,
            state,
            summaries: None,
        }
    }

    /// Reload the configuration with `loader` before every run. A failed
    /// reload keeps the last good configuration.
    pub fn with_config_loader<F>(mut self, loader: F) -> Self
    where
        F: Fn() -> std::result::Result<NightshiftConfig, ConfigError> + Send + Sync + 'static,
    {
        self.loader = Some(Arc::new(loader));
        self
    }

    /// Forward run summaries to `tx` (non-blocking; dropped if full).
    pub fn with_summaries(mut self, tx: mpsc::Sender<RunSummary>) -> Self {
        self.summaries = Some(tx);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            requests: self.requests_tx.clone(),
            state: self.state.subscribe(),
        }
    }

    pub fn config(&self) -> &NightshiftConfig {
        &self.config
    }

    /// Main loop. Runs until `shutdown` is cancelled.
    ///
    /// Shutdown during a run lets the in-flight batch finish; the remaining
    /// handlers stop before their next batch.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut next = next_daily_run(self.config.scheduler.start_time, self.clock.now());
        info!(%next, "scheduler engine started");
        self.publish(TriggerState::Waiting { next });

        loop {
            let now = self.clock.now();
            if now >= next {
                // a run that could not start is already logged; try again tomorrow
                let _ = self
                    .run_once(Selection::All, RunTrigger::Scheduled, &shutdown)
                    .await;
                if shutdown.is_cancelled() {
                    break;
                }
                let start = self.config.scheduler.start_time;
                next = following_daily_run(start, next, self.clock.now());
                info!(%next, "next run scheduled");
                self.publish(TriggerState::Waiting { next });
                continue;
            }

            let remaining = (next - now).to_std().unwrap_or_default();
            let request = tokio::select! {
                _ = shutdown.cancelled() => break,
                request = self.requests.recv() => request,
                _ = tokio::time::sleep(remaining.min(self.poll_interval)) => None,
            };

            if let Some(RunRequest { selection, reply }) = request {
                let result = self.run_once(selection, RunTrigger::OnDemand, &shutdown).await;
                if reply.send(result).is_err() {
                    warn!("run requester went away before the summary was ready");
                }
                if shutdown.is_cancelled() {
                    break;
                }
                self.publish(TriggerState::Waiting { next });
            }
        }

        info!("scheduler engine stopped");
        self.publish(TriggerState::Stopped);
    }

    /// Reload the configuration, build a run context and execute it.
    ///
    /// Fails without touching the store if any selected handler cannot be
    /// resolved, or if another run holds the store's [`RunLock`].
    pub async fn run_once(
        &mut self,
        selection: Selection,
        trigger: RunTrigger,
        shutdown: &CancellationToken,
    ) -> Result<RunSummary> {
        self.reload();

        let started_at = self.clock.now();
        let ctx = RunContext::build(&self.config, &self.registry, &selection, trigger, started_at)
            .inspect_err(|e| {
                error!(%trigger, code = e.code(), error = %e, "run aborted before any handler executed")
            })?;
        let lock = RunLock::acquire(&self.config.database.source.path).inspect_err(|e| {
            warn!(%trigger, run_id = %ctx.run_id, error = %e, "run skipped")
        })?;

        self.publish(TriggerState::Running {
            run_id: ctx.run_id.clone(),
            trigger,
        });
        let orchestrator = RunOrchestrator::new(Arc::clone(&self.clock), shutdown.clone());
        let summary = orchestrator.execute(ctx).await;
        drop(lock);

        if let Some(tx) = &self.summaries {
            if tx.try_send(summary.clone()).is_err() {
                warn!(run_id = %summary.run_id, "summary channel full or closed; summary dropped");
            }
        }
        Ok(summary)
    }

    fn reload(&mut self) {
        let Some(loader) = &self.loader else {
            return;
        };
        match loader() {
            Ok(config) => self.config = config,
            Err(e) => warn!(error = %e, "config reload failed; keeping last good configuration"),
        }
    }

    fn publish(&self, state: TriggerState) {
        self.state.send_replace(state);
    }
}
