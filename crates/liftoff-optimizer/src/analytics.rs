//! Cost analytics and the efficiency score.

use liftoff_state::ResourceSample;

/// Fixed cost attribution ratios at this layer; refined upstream.
const COMPUTE_SHARE: f64 = 0.70;
const STORAGE_SHARE: f64 = 0.15;
const NETWORK_SHARE: f64 = 0.10;
const OTHER_SHARE: f64 = 0.05;

/// Dollar cost split across coarse categories.
#[derive(Debug, Clone, PartialEq)]
pub struct CostBreakdown {
    pub compute: f64,
    pub storage: f64,
    pub network: f64,
    pub other: f64,
}

/// Aggregated analytics over a sample window.
#[derive(Debug, Clone, PartialEq)]
pub struct Analytics {
    pub deployment_id: String,
    pub window_start: u64,
    pub window_end: u64,
    pub sample_count: usize,
    pub avg_cpu_pct: f64,
    pub avg_memory_pct: f64,
    pub total_cost: f64,
    pub breakdown: CostBreakdown,
    /// Utilization efficiency in `[0,1]`.
    pub efficiency: f64,
}

/// Compute analytics over the given samples.
///
/// `sample_interval_hours` is the spacing between samples, used to turn
/// `cost_per_hour` rates into dollars.
pub fn analyze(
    deployment_id: &str,
    samples: &[ResourceSample],
    window_start: u64,
    window_end: u64,
    sample_interval_hours: f64,
) -> Analytics {
    let count = samples.len();
    let (avg_cpu, avg_mem) = if count > 0 {
        (
            samples.iter().map(|s| s.cpu_pct).sum::<f64>() / count as f64,
            samples.iter().map(|s| s.memory_pct).sum::<f64>() / count as f64,
        )
    } else {
        (0.0, 0.0)
    };

    let total_cost: f64 = samples
        .iter()
        .map(|s| s.cost_per_hour * sample_interval_hours)
        .sum();

    Analytics {
        deployment_id: deployment_id.to_string(),
        window_start,
        window_end,
        sample_count: count,
        avg_cpu_pct: avg_cpu,
        avg_memory_pct: avg_mem,
        total_cost,
        breakdown: CostBreakdown {
            compute: total_cost * COMPUTE_SHARE,
            storage: total_cost * STORAGE_SHARE,
            network: total_cost * NETWORK_SHARE,
            other: total_cost * OTHER_SHARE,
        },
        efficiency: efficiency_score(avg_cpu / 100.0, avg_mem / 100.0),
    }
}

/// Utilization efficiency, highest when cpu and memory sit near the
/// 75% ideal-utilization band.
pub fn efficiency_score(cpu_fraction: f64, mem_fraction: f64) -> f64 {
    let score = 0.5 * (1.0 - (cpu_fraction - 0.75).abs())
        + 0.3 * (1.0 - (mem_fraction - 0.75).abs())
        + 0.2;
    score.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(cpu: f64, mem: f64, cost: f64) -> ResourceSample {
        ResourceSample {
            deployment_id: "d1".to_string(),
            timestamp: 1_000,
            cpu_pct: cpu,
            memory_pct: mem,
            network_io: 0,
            disk_io: 0,
            cost_per_hour: cost,
        }
    }

    #[test]
    fn empty_window_is_all_zeros() {
        let a = analyze("d1", &[], 0, 100, 1.0 / 12.0);
        assert_eq!(a.sample_count, 0);
        assert_eq!(a.total_cost, 0.0);
        assert_eq!(a.avg_cpu_pct, 0.0);
    }

    #[test]
    fn averages_and_cost_breakdown() {
        let samples = vec![sample(40.0, 60.0, 0.12), sample(60.0, 80.0, 0.12)];
        let a = analyze("d1", &samples, 0, 100, 1.0);

        assert_eq!(a.avg_cpu_pct, 50.0);
        assert_eq!(a.avg_memory_pct, 70.0);
        assert!((a.total_cost - 0.24).abs() < 1e-9);
        assert!((a.breakdown.compute - 0.24 * 0.70).abs() < 1e-9);
        assert!((a.breakdown.storage - 0.24 * 0.15).abs() < 1e-9);
        assert!((a.breakdown.network - 0.24 * 0.10).abs() < 1e-9);
        assert!((a.breakdown.other - 0.24 * 0.05).abs() < 1e-9);
    }

    #[test]
    fn efficiency_peaks_at_ideal_utilization() {
        let ideal = efficiency_score(0.75, 0.75);
        assert!((ideal - 1.0).abs() < 1e-9);

        assert!(efficiency_score(0.10, 0.10) < ideal);
        assert!(efficiency_score(1.0, 1.0) < ideal);
        // Clamped to [0,1] at the extremes.
        let low = efficiency_score(0.0, 0.0);
        assert!((0.0..=1.0).contains(&low));
    }
}
