//! LogHub — buffers log entries per deployment and fans them out.
//!
//! The hub is the single mutator of every `LogBuffer`. Appends are
//! serialized per deployment under the hub lock, so the broadcast to
//! subscribers preserves `sequence` order within one deployment. No
//! cross-deployment ordering is promised.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{RwLock, broadcast, watch};
use tracing::{debug, info};
use uuid::Uuid;

use crate::buffer::{LogBuffer, LogEntry, LogFilter, LogLevel, LogSource};

/// A log entry before the hub assigns id, timestamp, and sequence.
#[derive(Debug, Clone)]
pub struct NewLogEntry {
    pub deployment_id: String,
    pub level: LogLevel,
    pub source: LogSource,
    pub message: String,
    pub data: Option<serde_json::Value>,
    pub tags: Vec<String>,
}

impl NewLogEntry {
    pub fn new(deployment_id: &str, level: LogLevel, source: LogSource, message: &str) -> Self {
        Self {
            deployment_id: deployment_id.to_string(),
            level,
            source,
            message: message.to_string(),
            data: None,
            tags: Vec::new(),
        }
    }
}

/// Hook invoked with entries evicted from a full ring.
pub type EvictionHook = Arc<dyn Fn(&str, Vec<LogEntry>) + Send + Sync>;

/// LogHub tuning knobs.
#[derive(Debug, Clone)]
pub struct LogHubConfig {
    /// Ring capacity per deployment.
    pub max_buffer_size: usize,
    /// Buffers untouched for this long are dropped by the sweep.
    pub retention: Duration,
    /// How often the retention sweep runs.
    pub sweep_interval: Duration,
    /// Broadcast channel capacity per deployment.
    pub fanout_capacity: usize,
}

impl Default for LogHubConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: 1_000,
            retention: Duration::from_secs(3_600),
            sweep_interval: Duration::from_secs(300),
            fanout_capacity: 256,
        }
    }
}

struct BufferSlot {
    buffer: LogBuffer,
    fanout: broadcast::Sender<LogEntry>,
}

/// Per-deployment log buffering and fan-out.
#[derive(Clone)]
pub struct LogHub {
    slots: Arc<RwLock<HashMap<String, BufferSlot>>>,
    config: LogHubConfig,
    eviction_hook: Option<EvictionHook>,
}

impl LogHub {
    pub fn new(config: LogHubConfig) -> Self {
        Self {
            slots: Arc::new(RwLock::new(HashMap::new())),
            config,
            eviction_hook: None,
        }
    }

    /// Install a hook receiving entries evicted on ring overflow.
    pub fn with_eviction_hook(mut self, hook: EvictionHook) -> Self {
        self.eviction_hook = Some(hook);
        self
    }

    /// Append an entry, assigning id, timestamp, and sequence, and
    /// publish it to subscribers of that deployment.
    pub async fn append(&self, new: NewLogEntry) -> LogEntry {
        let now = epoch_ms();
        let entry = LogEntry {
            id: format!("log-{}", Uuid::new_v4()),
            deployment_id: new.deployment_id.clone(),
            timestamp: now,
            level: new.level,
            source: new.source,
            message: new.message,
            data: new.data,
            tags: new.tags,
            sequence: 0, // Assigned by the buffer.
        };

        let (stored, evicted) = {
            let mut slots = self.slots.write().await;
            let slot = slots
                .entry(new.deployment_id.clone())
                .or_insert_with(|| self.new_slot(now));
            let (stored, evicted) = slot.buffer.push(entry, now);
            // Send while still holding the lock so sequence order is
            // what subscribers observe.
            let _ = slot.fanout.send(stored.clone());
            (stored, evicted)
        };

        if !evicted.is_empty() {
            if let Some(ref hook) = self.eviction_hook {
                hook(&new.deployment_id, evicted);
            }
        }
        stored
    }

    /// Subscribe to live entries for one deployment.
    pub async fn subscribe(&self, deployment_id: &str) -> broadcast::Receiver<LogEntry> {
        let now = epoch_ms();
        let mut slots = self.slots.write().await;
        let slot = slots
            .entry(deployment_id.to_string())
            .or_insert_with(|| self.new_slot(now));
        slot.fanout.subscribe()
    }

    /// Query buffered entries with a filter. Returns a copy.
    pub async fn query(&self, deployment_id: &str, filter: &LogFilter) -> Vec<LogEntry> {
        let mut slots = self.slots.write().await;
        match slots.get_mut(deployment_id) {
            Some(slot) => {
                slot.buffer.last_access_at = epoch_ms();
                slot.buffer.query(filter)
            }
            None => Vec::new(),
        }
    }

    /// The newest `n` entries for a deployment.
    pub async fn recent(&self, deployment_id: &str, n: usize) -> Vec<LogEntry> {
        let mut slots = self.slots.write().await;
        match slots.get_mut(deployment_id) {
            Some(slot) => {
                slot.buffer.last_access_at = epoch_ms();
                slot.buffer.recent(n)
            }
            None => Vec::new(),
        }
    }

    /// Remove all buffered entries for a deployment, keeping the buffer.
    pub async fn clear(&self, deployment_id: &str) {
        let mut slots = self.slots.write().await;
        if let Some(slot) = slots.get_mut(deployment_id) {
            slot.buffer.clear();
        }
    }

    /// Drop a deployment's buffer and fan-out channel entirely.
    pub async fn drop_buffer(&self, deployment_id: &str) {
        let mut slots = self.slots.write().await;
        if slots.remove(deployment_id).is_some() {
            debug!(%deployment_id, "log buffer dropped");
        }
    }

    /// Number of live buffers.
    pub async fn buffer_count(&self) -> usize {
        self.slots.read().await.len()
    }

    /// Run the retention sweep until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            retention_secs = self.config.retention.as_secs(),
            "log hub sweep started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.sweep_interval) => {
                    self.sweep_stale().await;
                }
                _ = shutdown.changed() => {
                    info!("log hub sweep shutting down");
                    break;
                }
            }
        }
    }

    /// Drop buffers untouched for longer than the retention window.
    pub async fn sweep_stale(&self) -> usize {
        let cutoff = epoch_ms().saturating_sub(self.config.retention.as_millis() as u64);
        let mut slots = self.slots.write().await;
        let before = slots.len();
        slots.retain(|id, slot| {
            let keep = slot.buffer.last_access_at >= cutoff;
            if !keep {
                debug!(deployment_id = %id, "stale log buffer swept");
            }
            keep
        });
        before - slots.len()
    }

    fn new_slot(&self, now: u64) -> BufferSlot {
        let (fanout, _) = broadcast::channel(self.config.fanout_capacity);
        BufferSlot {
            buffer: LogBuffer::new(self.config.max_buffer_size, now),
            fanout,
        }
    }
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn hub() -> LogHub {
        LogHub::new(LogHubConfig::default())
    }

    fn new_entry(deployment: &str, message: &str) -> NewLogEntry {
        NewLogEntry::new(deployment, LogLevel::Info, LogSource::Application, message)
    }

    #[tokio::test]
    async fn append_then_tail_one_returns_it() {
        let hub = hub();
        let stored = hub.append(new_entry("d1", "hello")).await;

        let filter = LogFilter {
            tail: Some(1),
            ..Default::default()
        };
        let results = hub.query("d1", &filter).await;
        assert_eq!(results, vec![stored]);
    }

    #[tokio::test]
    async fn recent_defaults_to_latest_entries() {
        let hub = hub();
        for i in 0..10 {
            hub.append(new_entry("d1", &format!("m{i}"))).await;
        }
        let recent = hub.recent("d1", 3).await;
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[2].message, "m9");
    }

    #[tokio::test]
    async fn subscribers_see_entries_in_sequence_order() {
        let hub = hub();
        let mut rx = hub.subscribe("d1").await;

        for i in 0..5 {
            hub.append(new_entry("d1", &format!("m{i}"))).await;
        }

        let mut last = None;
        for _ in 0..5 {
            let entry = rx.recv().await.unwrap();
            if let Some(prev) = last {
                assert!(entry.sequence > prev);
            }
            last = Some(entry.sequence);
        }
    }

    #[tokio::test]
    async fn no_cross_deployment_leakage() {
        let hub = hub();
        let mut rx = hub.subscribe("d1").await;

        hub.append(new_entry("d2", "other")).await;
        hub.append(new_entry("d1", "mine")).await;

        let entry = rx.recv().await.unwrap();
        assert_eq!(entry.deployment_id, "d1");
    }

    #[tokio::test]
    async fn eviction_hands_entries_to_hook() {
        let evicted: Arc<Mutex<Vec<LogEntry>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&evicted);
        let hub = LogHub::new(LogHubConfig {
            max_buffer_size: 2,
            ..Default::default()
        })
        .with_eviction_hook(Arc::new(move |_, entries| {
            sink.lock().unwrap().extend(entries);
        }));

        for i in 0..4 {
            hub.append(new_entry("d1", &format!("m{i}"))).await;
        }

        let evicted = evicted.lock().unwrap();
        assert_eq!(evicted.len(), 2);
        assert_eq!(evicted[0].message, "m0");
        assert_eq!(evicted[1].message, "m1");
    }

    #[tokio::test]
    async fn clear_and_drop() {
        let hub = hub();
        hub.append(new_entry("d1", "a")).await;
        hub.clear("d1").await;
        assert!(hub.recent("d1", 10).await.is_empty());
        assert_eq!(hub.buffer_count().await, 1);

        hub.drop_buffer("d1").await;
        assert_eq!(hub.buffer_count().await, 0);
    }

    #[tokio::test]
    async fn sweep_drops_only_stale_buffers() {
        let hub = LogHub::new(LogHubConfig {
            retention: Duration::from_millis(50),
            ..Default::default()
        });
        hub.append(new_entry("stale", "old")).await;

        tokio::time::sleep(Duration::from_millis(80)).await;
        hub.append(new_entry("fresh", "new")).await;

        let swept = hub.sweep_stale().await;
        assert_eq!(swept, 1);
        assert_eq!(hub.buffer_count().await, 1);
        assert_eq!(hub.recent("fresh", 1).await.len(), 1);
    }
}
