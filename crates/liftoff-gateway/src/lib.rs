//! liftoff-gateway — authenticated WebSocket fan-out.
//!
//! Clients connect over one long-lived socket, authenticate with a
//! bearer token in the handshake, and subscribe to per-deployment
//! rooms. The gateway bridges LogHub entries and orchestrator status
//! changes into JSON frames, enforces per-connection subscription caps
//! and a global connection cap, and never blocks a room on a slow
//! client: a full send queue drops `log` frames behind a single
//! `log:dropped` marker.

pub mod auth;
pub mod gateway;
pub mod protocol;
pub mod rooms;

pub use auth::{AuthContext, AuthError, StaticTokenVerifier, TokenVerifier};
pub use gateway::{Gateway, GatewayConfig};
pub use protocol::{ClientFrame, ErrorCode, ServerFrame, StatusPayload, SubscribeOptions};
