//! Scaling policy validation.
//!
//! Hard violations reject the policy; soft issues are returned as
//! warnings and the policy is accepted. Validation is deterministic:
//! the same input always yields the same verdict.

use std::collections::HashSet;
use std::fmt;

use thiserror::Error;

use liftoff_state::ScalingPolicy;

/// Hard validation failures; the policy is rejected.
#[derive(Debug, Error, PartialEq)]
pub enum PolicyError {
    #[error("min_instances must be at least 1, got {0}")]
    MinTooLow(u32),

    #[error("max_instances {max} is below min_instances {min}")]
    MaxBelowMin { min: u32, max: u32 },

    #[error("scale thresholds must be in [0,1]: up={up}, down={down}")]
    ScaleThresholdOutOfRange { up: f64, down: f64 },

    #[error("scale_up_threshold {up} must exceed scale_down_threshold {down}")]
    ThresholdsInverted { up: f64, down: f64 },

    #[error("metric threshold {0} is outside [0,1]")]
    MetricThresholdOutOfRange(f64),

    #[error("weight {0} is outside [0,1]")]
    WeightOutOfRange(f64),

    #[error("policy must have at least one metric threshold")]
    NoThresholds,
}

/// Soft validation issues; the policy is accepted and the issue logged.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyWarning {
    /// Cooldown under 60 s invites thrashing.
    CooldownShort(u64),
    /// Cooldown over an hour makes the policy unresponsive.
    CooldownLong(u64),
    /// More than 100 instances exceeds the supported band.
    MaxAboveSupported(u32),
    /// Weights do not sum to 1 ± 0.01.
    WeightsNotNormalized(f64),
    /// The same metric appears more than once.
    DuplicateMetric,
    /// Gap between up and down thresholds under 0.2 invites oscillation.
    NarrowGap(f64),
}

impl fmt::Display for PolicyWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyWarning::CooldownShort(secs) => {
                write!(f, "cooldown of {secs}s is under 60s")
            }
            PolicyWarning::CooldownLong(secs) => {
                write!(f, "cooldown of {secs}s is over an hour")
            }
            PolicyWarning::MaxAboveSupported(max) => {
                write!(f, "max_instances {max} is above the supported 100")
            }
            PolicyWarning::WeightsNotNormalized(sum) => {
                write!(f, "weights sum to {sum:.3}, expected 1±0.01")
            }
            PolicyWarning::DuplicateMetric => write!(f, "duplicate metrics in thresholds"),
            PolicyWarning::NarrowGap(gap) => {
                write!(f, "scale-up/down gap of {gap:.2} is under 0.2")
            }
        }
    }
}

/// Validate a policy. Returns the accepted policy's warnings, or the
/// first hard violation.
pub fn validate(policy: &ScalingPolicy) -> Result<Vec<PolicyWarning>, PolicyError> {
    if policy.min_instances < 1 {
        return Err(PolicyError::MinTooLow(policy.min_instances));
    }
    if policy.max_instances < policy.min_instances {
        return Err(PolicyError::MaxBelowMin {
            min: policy.min_instances,
            max: policy.max_instances,
        });
    }
    let up = policy.scale_up_threshold;
    let down = policy.scale_down_threshold;
    if !(0.0..=1.0).contains(&up) || !(0.0..=1.0).contains(&down) {
        return Err(PolicyError::ScaleThresholdOutOfRange { up, down });
    }
    if up <= down {
        return Err(PolicyError::ThresholdsInverted { up, down });
    }
    if policy.thresholds.is_empty() {
        return Err(PolicyError::NoThresholds);
    }
    for t in &policy.thresholds {
        if !(0.0..=1.0).contains(&t.threshold) {
            return Err(PolicyError::MetricThresholdOutOfRange(t.threshold));
        }
        if !(0.0..=1.0).contains(&t.weight) {
            return Err(PolicyError::WeightOutOfRange(t.weight));
        }
    }

    let mut warnings = Vec::new();
    if policy.cooldown_secs < 60 {
        warnings.push(PolicyWarning::CooldownShort(policy.cooldown_secs));
    }
    if policy.cooldown_secs > 3_600 {
        warnings.push(PolicyWarning::CooldownLong(policy.cooldown_secs));
    }
    if policy.max_instances > 100 {
        warnings.push(PolicyWarning::MaxAboveSupported(policy.max_instances));
    }
    let weight_sum: f64 = policy.thresholds.iter().map(|t| t.weight).sum();
    if (weight_sum - 1.0).abs() > 0.01 {
        warnings.push(PolicyWarning::WeightsNotNormalized(weight_sum));
    }
    let metrics: HashSet<_> = policy.thresholds.iter().map(|t| t.metric).collect();
    if metrics.len() != policy.thresholds.len() {
        warnings.push(PolicyWarning::DuplicateMetric);
    }
    if up - down < 0.2 {
        warnings.push(PolicyWarning::NarrowGap(up - down));
    }

    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use liftoff_state::{Comparison, MetricThreshold, ScalingMetric};

    fn policy() -> ScalingPolicy {
        ScalingPolicy {
            id: "pol1".to_string(),
            deployment_id: "d1".to_string(),
            thresholds: vec![
                MetricThreshold {
                    metric: ScalingMetric::Cpu,
                    threshold: 0.7,
                    comparison: Comparison::Gt,
                    weight: 0.5,
                },
                MetricThreshold {
                    metric: ScalingMetric::ResponseTime,
                    threshold: 0.5,
                    comparison: Comparison::Gt,
                    weight: 0.5,
                },
            ],
            scale_up_threshold: 0.7,
            scale_down_threshold: 0.3,
            cooldown_secs: 300,
            min_instances: 1,
            max_instances: 5,
            enabled: true,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn valid_policy_has_no_warnings() {
        assert_eq!(validate(&policy()).unwrap(), vec![]);
    }

    #[test]
    fn zero_min_is_rejected() {
        let mut p = policy();
        p.min_instances = 0;
        assert_eq!(validate(&p).unwrap_err(), PolicyError::MinTooLow(0));
    }

    #[test]
    fn max_below_min_is_rejected() {
        let mut p = policy();
        p.min_instances = 5;
        p.max_instances = 2;
        assert!(matches!(
            validate(&p).unwrap_err(),
            PolicyError::MaxBelowMin { min: 5, max: 2 }
        ));
    }

    #[test]
    fn inverted_thresholds_are_rejected() {
        let mut p = policy();
        p.scale_up_threshold = 0.3;
        p.scale_down_threshold = 0.7;
        assert!(matches!(
            validate(&p).unwrap_err(),
            PolicyError::ThresholdsInverted { .. }
        ));
    }

    #[test]
    fn out_of_range_weight_is_rejected() {
        let mut p = policy();
        p.thresholds[0].weight = 1.5;
        assert_eq!(validate(&p).unwrap_err(), PolicyError::WeightOutOfRange(1.5));
    }

    #[test]
    fn empty_thresholds_are_rejected() {
        let mut p = policy();
        p.thresholds.clear();
        assert_eq!(validate(&p).unwrap_err(), PolicyError::NoThresholds);
    }

    #[test]
    fn soft_issues_warn_but_accept() {
        let mut p = policy();
        p.cooldown_secs = 30;
        p.max_instances = 150;
        p.thresholds[1].metric = ScalingMetric::Cpu; // Duplicate.
        p.thresholds[0].weight = 0.9; // Sum 1.4.
        p.scale_up_threshold = 0.45;
        p.scale_down_threshold = 0.3;

        let warnings = validate(&p).unwrap();
        assert!(warnings.contains(&PolicyWarning::CooldownShort(30)));
        assert!(warnings.contains(&PolicyWarning::MaxAboveSupported(150)));
        assert!(warnings.contains(&PolicyWarning::DuplicateMetric));
        assert!(warnings.iter().any(|w| matches!(w, PolicyWarning::WeightsNotNormalized(_))));
        assert!(warnings.iter().any(|w| matches!(w, PolicyWarning::NarrowGap(_))));
    }

    #[test]
    fn validation_is_deterministic() {
        let p = policy();
        let a = validate(&p);
        let b = validate(&p);
        assert_eq!(a, b);
    }
}
