//! liftoff-loghub — per-deployment log buffering and fan-out.
//!
//! Each deployment owns a bounded ring of `LogEntry`s; the hub serves
//! tail/filter queries, publishes new entries to subscribers over a
//! bounded broadcast channel, and drops untouched rings after a
//! retention window.
//!
//! # Ordering
//!
//! Within one deployment, entries carry a monotonically increasing
//! `sequence` and are delivered to every subscriber in that order. No
//! cross-deployment ordering is promised.

pub mod buffer;
pub mod hub;

pub use buffer::{LogBuffer, LogEntry, LogFilter, LogLevel, LogSource};
pub use hub::{EvictionHook, LogHub, LogHubConfig, NewLogEntry};
