//! Wire protocol: JSON frames with a top-level `type`.

use serde::{Deserialize, Serialize};

use liftoff_loghub::{LogEntry, LogFilter, LogLevel, LogSource};
use liftoff_state::DeploymentStatus;

/// Frames a client may send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe {
        deployment_id: String,
        #[serde(default)]
        options: SubscribeOptions,
    },
    Unsubscribe {
        deployment_id: String,
    },
    Ping,
}

/// Optional filter carried by a subscribe frame; shapes the initial
/// log backfill.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscribeOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tail: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<Vec<LogLevel>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<Vec<LogSource>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

impl SubscribeOptions {
    /// Default backfill when the client names no tail.
    pub const DEFAULT_TAIL: usize = 50;

    pub fn to_filter(&self) -> LogFilter {
        LogFilter {
            levels: self.level.clone(),
            sources: self.source.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
            search: self.search.clone(),
            tags: self.tags.clone(),
            tail: Some(self.tail.unwrap_or(Self::DEFAULT_TAIL)),
        }
    }
}

/// Status payload inside a `status` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusPayload {
    pub status: DeploymentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_status: Option<DeploymentStatus>,
    pub timestamp: u64,
}

/// Frames the server may send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "pong")]
    Pong { timestamp: u64 },

    #[serde(rename = "subscription:success")]
    SubscriptionSuccess {
        deployment_id: String,
        initial_logs: Vec<LogEntry>,
    },

    #[serde(rename = "subscription:error")]
    SubscriptionError {
        deployment_id: String,
        code: ErrorCode,
        error: String,
    },

    #[serde(rename = "log")]
    Log {
        deployment_id: String,
        payload: LogEntry,
        timestamp: u64,
    },

    /// Marker that at least one `log` frame was dropped for this
    /// subscriber since the last delivered frame.
    #[serde(rename = "log:dropped")]
    LogDropped { deployment_id: String },

    #[serde(rename = "status")]
    Status {
        deployment_id: String,
        payload: StatusPayload,
    },

    #[serde(rename = "budget:alert")]
    BudgetAlert {
        deployment_id: String,
        payload: serde_json::Value,
    },

    #[serde(rename = "error")]
    Error { code: ErrorCode, message: String },
}

/// Closed set of error codes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "ACCESS_DENIED")]
    AccessDenied,
    #[serde(rename = "CONNECTION_LIMIT_EXCEEDED")]
    ConnectionLimitExceeded,
    #[serde(rename = "SUBSCRIPTION_LIMIT_EXCEEDED")]
    SubscriptionLimitExceeded,
    #[serde(rename = "NOT_FOUND")]
    NotFound,
    #[serde(rename = "INVALID_MESSAGE")]
    InvalidMessage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_frame_parses_with_and_without_options() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"subscribe","deployment_id":"d1"}"#).unwrap();
        assert!(matches!(
            frame,
            ClientFrame::Subscribe { ref deployment_id, .. } if deployment_id == "d1"
        ));

        let frame: ClientFrame = serde_json::from_str(
            r#"{"type":"subscribe","deployment_id":"d1","options":{"tail":5,"level":["error"],"search":"boom"}}"#,
        )
        .unwrap();
        if let ClientFrame::Subscribe { options, .. } = frame {
            assert_eq!(options.tail, Some(5));
            assert_eq!(options.level, Some(vec![LogLevel::Error]));
            assert_eq!(options.search.as_deref(), Some("boom"));
        } else {
            panic!("wrong variant");
        }
    }

    #[test]
    fn ping_round_trips() {
        let frame: ClientFrame = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(frame, ClientFrame::Ping));
    }

    #[test]
    fn server_frames_carry_colon_types() {
        let json = serde_json::to_string(&ServerFrame::SubscriptionError {
            deployment_id: "d1".to_string(),
            code: ErrorCode::AccessDenied,
            error: "not yours".to_string(),
        })
        .unwrap();
        assert!(json.contains(r#""type":"subscription:error""#));
        assert!(json.contains(r#""code":"ACCESS_DENIED""#));

        let json = serde_json::to_string(&ServerFrame::LogDropped {
            deployment_id: "d1".to_string(),
        })
        .unwrap();
        assert!(json.contains(r#""type":"log:dropped""#));
    }

    #[test]
    fn default_tail_applies_in_filter() {
        let options = SubscribeOptions::default();
        assert_eq!(options.to_filter().tail, Some(50));
    }
}
