use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::SchedulerSection;
use crate::history::HistoryResult;
use crate::pipeline::{Outcome, Pipeline, PipelineRun};
use crate::poller::{ItemDescriptor, PollResult, SourcePoller};

/// Counters for one poll cycle.
#[derive(Debug, Clone, Serialize, Default)]
pub struct CycleStats {
    pub listed: usize,
    pub new_items: usize,
    pub published: usize,
    pub skipped_too_short: usize,
    pub skipped_out_of_range: usize,
    pub failed_kept: usize,
    pub failed_discarded: usize,
    pub total_wait_ms: u64,
    pub duration_secs: u64,
    pub errors: Vec<String>,
}

impl CycleStats {
    fn record(&mut self, run: &PipelineRun) {
        match run.outcome {
            Outcome::Published => self.published += 1,
            Outcome::SkippedTooShort => self.skipped_too_short += 1,
            Outcome::SkippedOutOfRange => self.skipped_out_of_range += 1,
            Outcome::FailedKept => self.failed_kept += 1,
            Outcome::FailedDiscarded => self.failed_discarded += 1,
        }
        if !run.outcome.is_terminal() {
            if let Some(detail) = &run.detail {
                self.errors.push(format!("{}: {}", run.item_id, detail));
            }
        }
    }
}

/// Polls the source on an interval and feeds new items to the pipeline
/// one at a time, pacing successful publishes with a random delay.
pub struct Scheduler {
    poller: Arc<dyn SourcePoller>,
    fallback: Option<Arc<dyn SourcePoller>>,
    pipeline: Pipeline,
    config: SchedulerSection,
    rate_limiter: RateLimiter,
    stop: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(
        poller: Arc<dyn SourcePoller>,
        fallback: Option<Arc<dyn SourcePoller>>,
        pipeline: Pipeline,
        config: &SchedulerSection,
        stop: watch::Receiver<bool>,
    ) -> Self {
        let [lower_s, upper_s] = config.item_delay_seconds;
        let rate_limiter = RateLimiter::new((lower_s * 1000, upper_s * 1000));
        Self {
            poller,
            fallback,
            pipeline,
            config: config.clone(),
            rate_limiter,
            stop,
        }
    }

    /// One poll pass. Listing failures are soft and end up in
    /// `errors`; only a ledger write failure aborts, because the
    /// at-most-once guarantee is gone without it.
    pub async fn run_cycle(&mut self) -> HistoryResult<CycleStats> {
        let start = Instant::now();
        let mut stats = CycleStats::default();

        let items = match self.list_items().await {
            Ok(items) => items,
            Err(error) => {
                warn!(%error, "source listing failed");
                stats.errors.push(error.to_string());
                stats.duration_secs = start.elapsed().as_secs();
                return Ok(stats);
            }
        };
        stats.listed = items.len();

        let pending: Vec<ItemDescriptor> = items
            .into_iter()
            .filter(|item| !self.pipeline.is_handled(&item.id))
            .collect();
        stats.new_items = pending.len();
        info!(listed = stats.listed, new = stats.new_items, "poll cycle");

        let mut remaining = pending.len();
        for item in pending {
            if *self.stop.borrow() {
                info!("stop requested; cycle cut short");
                break;
            }
            remaining -= 1;

            let Some(run) = self.pipeline.process(&item).await? else {
                continue;
            };
            stats.record(&run);

            // Pace uploads so the destination sees a human-ish cadence.
            // The last item of a batch goes undelayed; the poll interval
            // covers the gap.
            if run.outcome == Outcome::Published && remaining > 0 {
                tokio::select! {
                    waited = self.rate_limiter.wait() => {
                        debug!(delay_ms = waited, "waited between publishes");
                        stats.total_wait_ms += waited;
                    }
                    _ = stopped(&mut self.stop) => {
                        info!("stop requested; cycle cut short");
                        break;
                    }
                }
            }
        }

        stats.duration_secs = start.elapsed().as_secs();
        info!(
            listed = stats.listed,
            new = stats.new_items,
            published = stats.published,
            failed = stats.failed_kept + stats.failed_discarded,
            errors = stats.errors.len(),
            "poll cycle finished"
        );
        Ok(stats)
    }

    /// Poll loop. Returns when the stop signal fires or the ledger
    /// becomes unwritable.
    pub async fn run(&mut self) -> HistoryResult<()> {
        info!(
            poll_interval_s = self.config.poll_interval_seconds,
            batch_size = self.config.batch_size,
            "scheduler started"
        );
        loop {
            if *self.stop.borrow() {
                break;
            }
            self.run_cycle().await?;
            if *self.stop.borrow() {
                break;
            }
            let interval = Duration::from_secs(self.config.poll_interval_seconds);
            tokio::select! {
                _ = sleep(interval) => {}
                _ = stopped(&mut self.stop) => break,
            }
        }
        info!("scheduler stopped");
        Ok(())
    }

    async fn list_items(&self) -> PollResult<Vec<ItemDescriptor>> {
        match self.poller.latest_items(self.config.batch_size).await {
            Ok(items) => Ok(items),
            Err(error) => {
                let Some(fallback) = &self.fallback else {
                    return Err(error);
                };
                warn!(%error, "primary listing failed; trying feed fallback");
                fallback.latest_items(self.config.batch_size).await
            }
        }
    }
}

/// Resolves once stopping is the only option: the flag flipped to true,
/// or every sender is gone and nobody can flip it any more. Callers must
/// treat resolution as a stop, not as a wakeup.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}

struct RateLimiter {
    range: (u64, u64),
}

impl RateLimiter {
    fn new(range: (u64, u64)) -> Self {
        Self { range }
    }

    async fn wait(&mut self) -> u64 {
        if self.range.0 == 0 && self.range.1 == 0 {
            return 0;
        }
        let delay = {
            let mut rng = rand::thread_rng();
            let lower = self.range.0.min(self.range.1);
            let upper = self.range.0.max(self.range.1);
            rng.gen_range(lower..=upper)
        };
        sleep(Duration::from_millis(delay)).await;
        delay
    }
}
