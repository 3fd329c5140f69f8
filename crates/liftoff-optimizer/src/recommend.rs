//! Deterministic right-sizing rules.

use liftoff_state::{Recommendation, RecommendationKind};

use crate::analytics::Analytics;

/// Derive recommendations from a window's analytics.
///
/// Rules, in order: underused cpu, underused memory, saturated cpu,
/// poor overall efficiency. The same analytics always yield the same
/// recommendations.
pub fn recommendations(analytics: &Analytics, now: u64) -> Vec<Recommendation> {
    let mut recs = Vec::new();
    if analytics.sample_count == 0 {
        return recs;
    }

    if analytics.avg_cpu_pct < 30.0 {
        recs.push(Recommendation {
            deployment_id: analytics.deployment_id.clone(),
            kind: RecommendationKind::DownsizeCpu,
            reason: format!(
                "average cpu {:.1}% is below 30%; a smaller cpu allocation suffices",
                analytics.avg_cpu_pct
            ),
            estimated_cost_delta_pct: -30.0,
            created_at: now,
        });
    }
    if analytics.avg_memory_pct < 40.0 {
        recs.push(Recommendation {
            deployment_id: analytics.deployment_id.clone(),
            kind: RecommendationKind::DownsizeMemory,
            reason: format!(
                "average memory {:.1}% is below 40%; a smaller memory allocation suffices",
                analytics.avg_memory_pct
            ),
            estimated_cost_delta_pct: -20.0,
            created_at: now,
        });
    }
    if analytics.avg_cpu_pct > 85.0 {
        recs.push(Recommendation {
            deployment_id: analytics.deployment_id.clone(),
            kind: RecommendationKind::UpsizeCpu,
            reason: format!(
                "average cpu {:.1}% is above 85%; requests are likely queueing",
                analytics.avg_cpu_pct
            ),
            estimated_cost_delta_pct: 30.0,
            created_at: now,
        });
    }
    if analytics.efficiency < 0.6 {
        recs.push(Recommendation {
            deployment_id: analytics.deployment_id.clone(),
            kind: RecommendationKind::AggressivePolicy,
            reason: format!(
                "efficiency {:.2} is below 0.60; a more aggressive scaling policy would help",
                analytics.efficiency
            ),
            estimated_cost_delta_pct: 0.0,
            created_at: now,
        });
    }
    recs
}
