use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDateTime, NaiveTime};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    clock::Clock,
    error::BatchError,
    types::{BatchResult, BatchTotals, StopReason},
};

/// How a guarded loop ended without an error.
#[derive(Debug, Clone, Copy)]
pub struct LoopEnd {
    pub reason: StopReason,
    pub totals: BatchTotals,
}

/// A batch failed; `totals` covers the batches committed before it.
#[derive(Debug)]
pub struct LoopFailure {
    pub error: BatchError,
    pub totals: BatchTotals,
}

/// Time-boxes a batch loop.
///
/// The deadline and the shutdown token are checked only *between* iterations,
/// so a batch that has started always runs to commit or rollback.
#[derive(Clone)]
pub struct CutoffGuard {
    deadline: NaiveDateTime,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
    pause: Duration,
}

impl CutoffGuard {
    pub fn new(deadline: NaiveDateTime, clock: Arc<dyn Clock>, shutdown: CancellationToken) -> Self {
        Self {
            deadline,
            clock,
            shutdown,
            pause: Duration::ZERO,
        }
    }

    /// Guard whose deadline is `cut_off` on the day the run started.
    ///
    /// A run started at or after its handler's cut-off gets an already-expired
    /// guard, so that handler stops before its first batch.
    pub fn for_run(
        run_started: NaiveDateTime,
        cut_off: NaiveTime,
        clock: Arc<dyn Clock>,
        shutdown: CancellationToken,
    ) -> Self {
        Self::new(run_started.date().and_time(cut_off), clock, shutdown)
    }

    /// Wait this long between two batches.
    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    pub fn deadline(&self) -> NaiveDateTime {
        self.deadline
    }

    /// Reason to stop now, if any.
    pub fn check(&self) -> Option<StopReason> {
        if self.shutdown.is_cancelled() {
            return Some(StopReason::Shutdown);
        }
        if self.clock.now() >= self.deadline {
            return Some(StopReason::Deadline);
        }
        None
    }

    /// Call `body` until it reports no more rows, the deadline passes, shutdown
    /// is requested, or it fails. `body` receives the 1-based iteration number.
    pub async fn run<F, Fut>(&self, mut body: F) -> Result<LoopEnd, LoopFailure>
    where
        F: FnMut(u64) -> Fut,
        Fut: Future<Output = Result<BatchResult, BatchError>>,
    {
        let mut totals = BatchTotals::default();
        let mut iteration = 0u64;
        loop {
            if let Some(reason) = self.check() {
                debug!(%reason, deadline = %self.deadline, iteration, "guard stopped loop");
                return Ok(LoopEnd { reason, totals });
            }

            iteration += 1;
            let result = match body(iteration).await {
                Ok(r) => r,
                Err(error) => return Err(LoopFailure { error, totals }),
            };
            totals.record(&result);

            if !result.more_remain {
                return Ok(LoopEnd {
                    reason: StopReason::Exhausted,
                    totals,
                });
            }

            if !self.pause.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.pause) => {}
                    _ = self.shutdown.cancelled() => {}
                }
            }
        }
    }
}
