//! Monthly budget tracking and alert deduplication.
//!
//! Alerts are idempotent per threshold per month: once `critical` has
//! fired for a deployment in a given month, another `critical` crossing
//! stays silent until the month rolls over.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Datelike, TimeZone, Utc};

/// A monthly dollar limit with warning/critical percent thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetConfig {
    pub monthly_limit_usd: f64,
    /// Percent of the limit at which a warning fires (default 80).
    pub warning_pct: f64,
    /// Percent of the limit at which a critical alert fires (default 95).
    pub critical_pct: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            monthly_limit_usd: 100.0,
            warning_pct: 80.0,
            critical_pct: 95.0,
        }
    }
}

/// Severity of a budget alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BudgetLevel {
    Warning,
    Critical,
}

/// A fired budget alert, fanned out to observers of the deployment.
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetAlert {
    pub deployment_id: String,
    pub level: BudgetLevel,
    pub spent_usd: f64,
    pub limit_usd: f64,
    /// Month key, e.g. "2026-08".
    pub month: String,
}

/// Tracks budget configs and which alerts already fired this month.
#[derive(Default)]
pub struct BudgetTracker {
    budgets: HashMap<String, BudgetConfig>,
    fired: HashSet<(String, String, BudgetLevel)>,
}

impl BudgetTracker {
    /// Set (or replace) the budget for a deployment.
    pub fn set_budget(&mut self, deployment_id: &str, config: BudgetConfig) {
        self.budgets.insert(deployment_id.to_string(), config);
    }

    pub fn budget(&self, deployment_id: &str) -> Option<&BudgetConfig> {
        self.budgets.get(deployment_id)
    }

    pub fn remove(&mut self, deployment_id: &str) {
        self.budgets.remove(deployment_id);
        self.fired.retain(|(id, _, _)| id != deployment_id);
    }

    /// Check spend against the deployment's budget. Returns an alert on
    /// the first crossing of each threshold per month.
    pub fn check(&mut self, deployment_id: &str, month: &str, spent_usd: f64) -> Option<BudgetAlert> {
        let config = self.budgets.get(deployment_id)?;
        let limit = config.monthly_limit_usd;

        let level = if spent_usd >= limit * config.critical_pct / 100.0 {
            BudgetLevel::Critical
        } else if spent_usd >= limit * config.warning_pct / 100.0 {
            BudgetLevel::Warning
        } else {
            return None;
        };

        let key = (deployment_id.to_string(), month.to_string(), level);
        if self.fired.contains(&key) {
            return None;
        }
        self.fired.insert(key);
        Some(BudgetAlert {
            deployment_id: deployment_id.to_string(),
            level,
            spent_usd,
            limit_usd: limit,
            month: month.to_string(),
        })
    }
}

/// Month key for a millisecond timestamp, e.g. "2026-08".
pub fn month_key(now_ms: u64) -> String {
    let dt: DateTime<Utc> = Utc
        .timestamp_millis_opt(now_ms as i64)
        .single()
        .unwrap_or_default();
    format!("{:04}-{:02}", dt.year(), dt.month())
}

/// Millisecond timestamp of the start of the month containing `now_ms`.
pub fn month_start_ms(now_ms: u64) -> u64 {
    let dt: DateTime<Utc> = Utc
        .timestamp_millis_opt(now_ms as i64)
        .single()
        .unwrap_or_default();
    Utc.with_ymd_and_hms(dt.year(), dt.month(), 1, 0, 0, 0)
        .single()
        .map(|d| d.timestamp_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_budget_no_alert() {
        let mut tracker = BudgetTracker::default();
        assert!(tracker.check("d1", "2026-08", 1_000.0).is_none());
    }

    #[test]
    fn warning_then_critical_each_fire_once() {
        let mut tracker = BudgetTracker::default();
        tracker.set_budget("d1", BudgetConfig::default()); // Limit 100.

        assert!(tracker.check("d1", "2026-08", 50.0).is_none());

        let warn = tracker.check("d1", "2026-08", 85.0).unwrap();
        assert_eq!(warn.level, BudgetLevel::Warning);

        // Same threshold, same month: silent.
        assert!(tracker.check("d1", "2026-08", 90.0).is_none());

        let crit = tracker.check("d1", "2026-08", 96.0).unwrap();
        assert_eq!(crit.level, BudgetLevel::Critical);
        assert!(tracker.check("d1", "2026-08", 120.0).is_none());
    }

    #[test]
    fn alerts_refire_next_month() {
        let mut tracker = BudgetTracker::default();
        tracker.set_budget("d1", BudgetConfig::default());

        assert!(tracker.check("d1", "2026-08", 99.0).is_some());
        assert!(tracker.check("d1", "2026-08", 99.0).is_none());
        assert!(tracker.check("d1", "2026-09", 99.0).is_some());
    }

    #[test]
    fn month_key_and_start() {
        // 2026-08-01T00:00:00Z == 1 785 542 400 s.
        let aug_first_ms = 1_785_542_400_000u64;
        let mid_aug_ms = aug_first_ms + 14 * 24 * 3_600 * 1_000;
        assert_eq!(month_key(mid_aug_ms), "2026-08");
        assert_eq!(month_start_ms(mid_aug_ms), aug_first_ms);
    }

    #[test]
    fn remove_clears_fired_state() {
        let mut tracker = BudgetTracker::default();
        tracker.set_budget("d1", BudgetConfig::default());
        assert!(tracker.check("d1", "2026-08", 99.0).is_some());

        tracker.remove("d1");
        tracker.set_budget("d1", BudgetConfig::default());
        assert!(tracker.check("d1", "2026-08", 99.0).is_some());
    }
}
