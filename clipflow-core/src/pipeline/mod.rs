pub mod types;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::{ClipflowConfig, RoutingSection};
use crate::fetch::Fetcher;
use crate::history::{HistoryResult, HistoryStore};
use crate::poller::ItemDescriptor;
use crate::probe::DurationProbe;
use crate::publish::Publisher;
use crate::routing::{classify, speed_factor, RoutingDecision};
use crate::transform::Transformer;

pub use self::types::{Outcome, PipelineRun, StageTimings};

/// Drives one item at a time through fetch, measure, route, transform
/// and publish, and owns the ledger that makes the whole thing
/// at-most-once.
pub struct Pipeline {
    fetcher: Arc<dyn Fetcher>,
    probe: Arc<dyn DurationProbe>,
    transformer: Arc<dyn Transformer>,
    publisher: Arc<dyn Publisher>,
    history: HistoryStore,
    routing: RoutingSection,
    work_dir: PathBuf,
    caption_limit: usize,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("routing", &self.routing)
            .field("work_dir", &self.work_dir)
            .field("caption_limit", &self.caption_limit)
            .field("history", &self.history.path())
            .finish()
    }
}

#[derive(Default)]
struct RunTrace {
    timings: StageTimings,
    measured_duration_s: Option<f64>,
    decision: Option<RoutingDecision>,
    speed_factor: Option<f64>,
    detail: Option<String>,
}

impl Pipeline {
    pub fn new(
        config: &ClipflowConfig,
        history: HistoryStore,
        fetcher: Arc<dyn Fetcher>,
        probe: Arc<dyn DurationProbe>,
        transformer: Arc<dyn Transformer>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        Self {
            fetcher,
            probe,
            transformer,
            publisher,
            history,
            routing: config.routing.clone(),
            work_dir: config.work_dir(),
            caption_limit: config.publish.caption_limit,
        }
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn is_handled(&self, id: &str) -> bool {
        self.history.is_handled(id)
    }

    /// Runs the full pipeline for one item. `Ok(None)` means the ledger
    /// already knows the id and nothing was done. Stage failures are
    /// folded into the returned outcome; only a ledger write that cannot
    /// be persisted escapes as an error, because continuing without the
    /// ledger would allow duplicates.
    pub async fn process(&mut self, item: &ItemDescriptor) -> HistoryResult<Option<PipelineRun>> {
        if self.history.is_handled(&item.id) {
            debug!(item = %item.id, "already handled");
            return Ok(None);
        }
        info!(item = %item.id, title = %item.title, "processing");

        let mut trace = RunTrace::default();
        let outcome = self.run_stages(item, &mut trace).await?;
        info!(item = %item.id, outcome = %outcome, "finished");
        Ok(Some(PipelineRun {
            item_id: item.id.clone(),
            title: item.title.clone(),
            outcome,
            measured_duration_s: trace.measured_duration_s,
            decision: trace.decision,
            speed_factor: trace.speed_factor,
            timings: trace.timings,
            detail: trace.detail,
        }))
    }

    async fn run_stages(
        &mut self,
        item: &ItemDescriptor,
        trace: &mut RunTrace,
    ) -> HistoryResult<Outcome> {
        let stem = artifact_stem(&item.id);
        let raw = self.work_dir.join(format!("raw-{stem}.mp4"));
        let scaled = self.work_dir.join(format!("scaled-{stem}.mp4"));

        let fetch_started = Instant::now();
        if let Err(error) = self.fetcher.fetch(item, &raw).await {
            warn!(item = %item.id, %error, "fetch failed");
            trace.detail = Some(error.to_string());
            discard_artifacts(&[&raw, &scaled]).await;
            return Ok(Outcome::FailedDiscarded);
        }
        trace.timings.fetch_ms = Some(elapsed_ms(fetch_started));

        let probe_started = Instant::now();
        let duration_s = match self.probe.measure(&raw).await {
            Ok(value) => value,
            Err(error) => {
                warn!(item = %item.id, %error, "duration probe failed");
                trace.detail = Some(error.to_string());
                discard_artifacts(&[&raw, &scaled]).await;
                return Ok(Outcome::FailedDiscarded);
            }
        };
        trace.timings.probe_ms = Some(elapsed_ms(probe_started));
        trace.measured_duration_s = Some(duration_s);

        let decision = classify(duration_s, &self.routing);
        trace.decision = Some(decision);
        debug!(item = %item.id, duration_s, decision = %decision, "routed");

        // Skips are terminal: the ledger entry goes in first so a crash
        // between the write and the cleanup cannot resurrect the item.
        let publishable = match decision {
            RoutingDecision::TooShort => {
                info!(item = %item.id, duration_s, "below minimum duration");
                self.history.mark_handled(&item.id)?;
                discard_artifacts(&[&raw]).await;
                return Ok(Outcome::SkippedTooShort);
            }
            RoutingDecision::OutOfRange => {
                info!(item = %item.id, duration_s, "beyond maximum duration");
                self.history.mark_handled(&item.id)?;
                discard_artifacts(&[&raw]).await;
                return Ok(Outcome::SkippedOutOfRange);
            }
            RoutingDecision::DirectUpload => raw.clone(),
            RoutingDecision::NeedsScaling => {
                let factor = speed_factor(duration_s, self.routing.target_duration_s);
                trace.speed_factor = Some(factor);
                let transform_started = Instant::now();
                let transformed = self
                    .transformer
                    .transform(&raw, &scaled, factor, self.routing.target_duration_s)
                    .await;
                if let Err(error) = transformed {
                    warn!(item = %item.id, %error, "transform failed");
                    trace.detail = Some(error.to_string());
                    discard_artifacts(&[&raw, &scaled]).await;
                    return Ok(Outcome::FailedDiscarded);
                }
                trace.timings.transform_ms = Some(elapsed_ms(transform_started));
                discard_artifacts(&[&raw]).await;
                scaled.clone()
            }
        };

        let caption = truncate_caption(&item.title, self.caption_limit);
        let publish_started = Instant::now();
        match self.publisher.publish(&publishable, &caption).await {
            Ok(receipt) => {
                trace.timings.publish_ms = Some(elapsed_ms(publish_started));
                trace.detail = receipt.detail;
                self.history.mark_handled(&item.id)?;
                discard_artifacts(&[&publishable]).await;
                Ok(Outcome::Published)
            }
            Err(error) => {
                warn!(
                    item = %item.id,
                    artifact = %publishable.display(),
                    %error,
                    "publish failed; artifact kept"
                );
                trace.detail = Some(error.to_string());
                Ok(Outcome::FailedKept)
            }
        }
    }
}

/// Filesystem-safe stem for an item's working files. The digest suffix
/// keeps two ids that sanitize to the same text from colliding.
pub fn artifact_stem(id: &str) -> String {
    let sanitized: String = id
        .chars()
        .map(|ch| match ch {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => ch,
            _ => '_',
        })
        .collect();
    let digest = Sha256::digest(id.as_bytes());
    format!("{}-{}", sanitized, hex::encode(&digest[..4]))
}

fn truncate_caption(title: &str, limit: usize) -> String {
    if title.chars().count() <= limit {
        title.to_string()
    } else {
        title.chars().take(limit).collect()
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

async fn discard_artifacts(paths: &[&Path]) {
    for path in paths {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => {
                warn!(path = %path.display(), %error, "failed to remove artifact");
            }
        }
    }
}
