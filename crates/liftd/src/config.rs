//! Environment-driven configuration.
//!
//! Every knob has a default; keys ending in `_MS` are milliseconds,
//! `SANDBOX_MAX_AGE`/`SANDBOX_MAX_IDLE` are seconds.
//!
//! | Key | Effect |
//! |---|---|
//! | `MAX_CONCURRENT_PER_USER` | Orchestrator per-user cap |
//! | `SANDBOX_MAX_AGE`, `SANDBOX_MAX_IDLE` | Reaper thresholds (seconds) |
//! | `AUTOSCALE_TICK_MS` | Autoscaler evaluation period |
//! | `LOG_BUFFER_SIZE`, `LOG_RETENTION_MS` | LogHub ring & TTL |
//! | `WS_MAX_CONNECTIONS`, `WS_MAX_SUBSCRIPTIONS` | Gateway caps |
//! | `WS_CONNECTION_TIMEOUT_MS`, `WS_HEARTBEAT_MS` | Gateway idle reaping |
//! | `HEALTH_INTERVAL_MS`, `HEALTH_TIMEOUT_MS` | Supervisor cadence |
//! | `CIRCUIT_BREAKER_FAILURE_THRESHOLD` | Breaker opens after N failures |
//! | `CIRCUIT_BREAKER_COOLDOWN_MS` | Breaker open window |
//! | `CIRCUIT_BREAKER_HALF_OPEN_RETRIES` | Successes to close |
//! | `HEALTH_DEPENDENCY_URLS` | Comma-separated external URLs to probe |

use std::str::FromStr;
use std::time::Duration;

use liftoff_gateway::GatewayConfig;
use liftoff_health::{BreakerConfig, SupervisorConfig};
use liftoff_loghub::LogHubConfig;
use liftoff_optimizer::OptimizerConfig;
use liftoff_orchestrator::OrchestratorConfig;

/// Assembled configuration for every subsystem.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub orchestrator: OrchestratorConfig,
    pub loghub: LogHubConfig,
    pub gateway: GatewayConfig,
    pub supervisor: SupervisorConfig,
    pub optimizer: OptimizerConfig,
    pub autoscale_tick: Duration,
    pub probe_timeout: Duration,
    pub dependency_urls: Vec<String>,
}

impl DaemonConfig {
    /// Read the enumerated environment keys, falling back to defaults.
    pub fn from_env(dev_mode: bool) -> Self {
        let orchestrator = OrchestratorConfig {
            max_concurrent_per_user: env_or("MAX_CONCURRENT_PER_USER", 5),
            sandbox_max_age: Duration::from_secs(env_or("SANDBOX_MAX_AGE", 2 * 3_600)),
            sandbox_max_idle: Duration::from_secs(env_or("SANDBOX_MAX_IDLE", 30 * 60)),
            ..Default::default()
        };

        let loghub = LogHubConfig {
            max_buffer_size: env_or("LOG_BUFFER_SIZE", 1_000),
            retention: Duration::from_millis(env_or("LOG_RETENTION_MS", 3_600_000)),
            ..Default::default()
        };

        let gateway = GatewayConfig {
            max_connections: env_or("WS_MAX_CONNECTIONS", 1_000),
            max_subscriptions_per_user: env_or("WS_MAX_SUBSCRIPTIONS", 10),
            connection_timeout: Duration::from_millis(env_or("WS_CONNECTION_TIMEOUT_MS", 300_000)),
            sweep_interval: Duration::from_millis(env_or("WS_HEARTBEAT_MS", 30_000)),
            ..Default::default()
        };

        let supervisor = SupervisorConfig {
            interval: Duration::from_millis(env_or("HEALTH_INTERVAL_MS", 30_000)),
            breaker: BreakerConfig {
                failure_threshold: env_or("CIRCUIT_BREAKER_FAILURE_THRESHOLD", 3),
                cooldown: Duration::from_millis(env_or("CIRCUIT_BREAKER_COOLDOWN_MS", 30_000)),
                half_open_retries: env_or("CIRCUIT_BREAKER_HALF_OPEN_RETRIES", 3),
            },
            dev_mode,
        };

        let dependency_urls = std::env::var("HEALTH_DEPENDENCY_URLS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        Self {
            orchestrator,
            loghub,
            gateway,
            supervisor,
            optimizer: OptimizerConfig::default(),
            autoscale_tick: Duration::from_millis(env_or("AUTOSCALE_TICK_MS", 30_000)),
            probe_timeout: Duration::from_millis(env_or("HEALTH_TIMEOUT_MS", 5_000)),
            dependency_urls,
        }
    }
}

/// Parse an env var, falling back to `default` when unset or invalid.
fn env_or<T: FromStr + Copy>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
