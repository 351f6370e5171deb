use serde::Serialize;

use crate::config::RoutingSection;

/// Action bucket for a measured clip duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingDecision {
    TooShort,
    NeedsScaling,
    DirectUpload,
    OutOfRange,
}

impl RoutingDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingDecision::TooShort => "too_short",
            RoutingDecision::NeedsScaling => "needs_scaling",
            RoutingDecision::DirectUpload => "direct_upload",
            RoutingDecision::OutOfRange => "out_of_range",
        }
    }
}

impl std::fmt::Display for RoutingDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Total classification of a duration against the configured window.
/// Both window boundaries are inclusive; `min == max` degenerates to
/// "every in-range clip is stretched to the target".
pub fn classify(duration_s: f64, limits: &RoutingSection) -> RoutingDecision {
    if duration_s < limits.min_duration_s {
        RoutingDecision::TooShort
    } else if duration_s <= limits.max_duration_s {
        RoutingDecision::NeedsScaling
    } else if duration_s <= limits.max_duration_s + limits.direct_tolerance_s {
        RoutingDecision::DirectUpload
    } else {
        RoutingDecision::OutOfRange
    }
}

/// Playback-rate multiplier that stretches `original_duration_s` to exactly
/// the target. Values below 1 slow the clip down, values above 1 speed it
/// up; both directions are valid.
pub fn speed_factor(original_duration_s: f64, target_duration_s: f64) -> f64 {
    original_duration_s / target_duration_s
}
