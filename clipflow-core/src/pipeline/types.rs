use std::fmt;

use serde::Serialize;

use crate::routing::RoutingDecision;

/// Terminal result of pushing one item through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Published,
    SkippedTooShort,
    SkippedOutOfRange,
    FailedKept,
    FailedDiscarded,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Published => "published",
            Outcome::SkippedTooShort => "skipped_too_short",
            Outcome::SkippedOutOfRange => "skipped_out_of_range",
            Outcome::FailedKept => "failed_kept",
            Outcome::FailedDiscarded => "failed_discarded",
        }
    }

    /// Skips and successful publishes are final; the item is never
    /// looked at again. Failures leave the item eligible for the next
    /// poll.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Outcome::Published | Outcome::SkippedTooShort | Outcome::SkippedOutOfRange
        )
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wall-clock spent in each stage. A stage that never ran stays `None`.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StageTimings {
    pub fetch_ms: Option<u64>,
    pub probe_ms: Option<u64>,
    pub transform_ms: Option<u64>,
    pub publish_ms: Option<u64>,
}

/// Record of one pipeline pass over one item.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRun {
    pub item_id: String,
    pub title: String,
    pub outcome: Outcome,
    pub measured_duration_s: Option<f64>,
    pub decision: Option<RoutingDecision>,
    pub speed_factor: Option<f64>,
    pub timings: StageTimings,
    pub detail: Option<String>,
}
