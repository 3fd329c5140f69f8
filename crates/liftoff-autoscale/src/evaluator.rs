//! Score computation and the scaling decision rule.
//!
//! Raw metric values are normalized to `[0,1]`, each threshold
//! contributes a weighted term (boosted when triggered), and the final
//! score is compared against the policy's scale-up/down thresholds.

use liftoff_state::{MetricReading, ScalingMetric, ScalingPolicy};

/// The action a decision resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleAction {
    ScaleUp,
    ScaleDown,
    NoChange,
}

/// One evaluation result.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub action: ScaleAction,
    pub target_instances: u32,
    /// Weighted score in `[0,1]`.
    pub score: f64,
    /// Fraction of thresholds that triggered, in `[0,1]`.
    pub confidence: f64,
    pub reason: String,
}

impl Decision {
    pub fn no_change(current: u32, score: f64, confidence: f64, reason: &str) -> Self {
        Self {
            action: ScaleAction::NoChange,
            target_instances: current,
            score,
            confidence,
            reason: reason.to_string(),
        }
    }
}

/// Normalize a raw metric value to `[0,1]`.
///
/// cpu/memory are percentages, error rate saturates at 10%, request
/// rate at 1000 req/s, response time at 5000 ms.
pub fn normalize(metric: ScalingMetric, raw: f64) -> f64 {
    let scaled = match metric {
        ScalingMetric::Cpu | ScalingMetric::Memory => raw / 100.0,
        ScalingMetric::ErrorRate => raw / 10.0,
        ScalingMetric::Requests => raw / 1_000.0,
        ScalingMetric::ResponseTime => raw / 5_000.0,
    };
    scaled.clamp(0.0, 1.0)
}

/// Pick the raw value for a metric out of a reading.
pub fn raw_value(metric: ScalingMetric, reading: &MetricReading) -> f64 {
    match metric {
        ScalingMetric::Cpu => reading.cpu_pct,
        ScalingMetric::Memory => reading.memory_pct,
        ScalingMetric::Requests => reading.requests_per_sec,
        ScalingMetric::ResponseTime => reading.response_time_ms,
        ScalingMetric::ErrorRate => reading.error_rate_pct,
    }
}

/// Weighted score and trigger confidence for a policy against a reading.
pub fn score(policy: &ScalingPolicy, reading: &MetricReading) -> (f64, f64) {
    let mut weighted_sum = 0.0;
    let mut weight_sum = 0.0;
    let mut triggered = 0usize;

    for t in &policy.thresholds {
        let normalized = normalize(t.metric, raw_value(t.metric, reading));
        let is_triggered = t.comparison.matches(normalized, t.threshold);
        let contribution = if is_triggered {
            triggered += 1;
            (normalized + (normalized - t.threshold).abs() * 0.5) * t.weight
        } else {
            normalized * t.weight * 0.5
        };
        weighted_sum += contribution;
        weight_sum += t.weight;
    }

    if weight_sum == 0.0 || policy.thresholds.is_empty() {
        return (0.0, 0.0);
    }
    let score = weighted_sum / weight_sum;
    let confidence = triggered as f64 / policy.thresholds.len() as f64;
    (score, confidence)
}

/// Apply the decision rule given the current instance count.
pub fn decide(policy: &ScalingPolicy, reading: &MetricReading, current: u32) -> Decision {
    let (score, confidence) = score(policy, reading);

    if score > policy.scale_up_threshold {
        let target = (current + 1).min(policy.max_instances);
        if target > current {
            return Decision {
                action: ScaleAction::ScaleUp,
                target_instances: target,
                score,
                confidence,
                reason: format!(
                    "score {score:.2} above scale-up threshold {:.2}",
                    policy.scale_up_threshold
                ),
            };
        }
        return Decision::no_change(current, score, confidence, "at max instances");
    }

    if score < policy.scale_down_threshold {
        let target = current.saturating_sub(1).max(policy.min_instances);
        if target < current {
            return Decision {
                action: ScaleAction::ScaleDown,
                target_instances: target,
                score,
                confidence,
                reason: format!(
                    "score {score:.2} below scale-down threshold {:.2}",
                    policy.scale_down_threshold
                ),
            };
        }
        return Decision::no_change(current, score, confidence, "at min instances");
    }

    Decision::no_change(current, score, confidence, "score within band")
}
