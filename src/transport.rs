//! Chat transport seam.
//!
//! The session manager only talks to the wire through these traits, so the
//! production adapter (see [`crate::mqtt`]) can be swapped for a stub in tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Failures surfaced by a transport or by the session manager
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("authentication rejected: {0}")]
    AuthFailure(String),
    #[error("network failure: {0}")]
    NetworkFailure(String),
    #[error("transport closed")]
    TransportClosed,
    #[error("timed out after {0}s")]
    Timeout(u64),
}

/// Account and server the transport logs in with
#[derive(Debug, Clone)]
pub struct Credentials {
    pub identity: String,
    pub host: String,
    pub port: u16,
    pub secret: String,
}

/// A message delivered by the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub from: String,
    pub body: String,
    /// Protocol-level error report rather than a regular chat message
    #[serde(default)]
    pub is_error: bool,
}

impl InboundMessage {
    pub fn chat(from: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            body: body.into(),
            is_error: false,
        }
    }

    pub fn error(from: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            body: body.into(),
            is_error: true,
        }
    }
}

/// Availability advertised with a presence broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceMode {
    /// Online and free to chat
    Available,
    Normal,
    Busy,
    Offline,
}

impl PresenceMode {
    /// Wire value of the presence
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceMode::Available => "chat",
            PresenceMode::Normal => "probe",
            PresenceMode::Busy => "subscribed",
            PresenceMode::Offline => "unavailable",
        }
    }

    /// Human-readable label used in command confirmations
    pub fn label(&self) -> &'static str {
        match self {
            PresenceMode::Available => "available",
            PresenceMode::Normal => "normal",
            PresenceMode::Busy => "busy",
            PresenceMode::Offline => "offline",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Presence {
    pub mode: PresenceMode,
    pub status: String,
}

/// A live, authenticated connection
#[async_trait]
pub trait Connection: Send + Sync {
    /// Whether the underlying link is still up
    fn is_connected(&self) -> bool;

    async fn send_message(&self, to: &[String], body: &str) -> Result<(), SessionError>;

    async fn send_presence(&self, presence: &Presence) -> Result<(), SessionError>;

    async fn close(&self);
}

/// Capacity of the queue between a transport's receive task and the agent
pub const INBOUND_QUEUE_CAPACITY: usize = 64;

/// Opens connections. Inbound messages for the connection are pushed into
/// `inbound` until the connection drops. The queue is bounded; a transport
/// drops (and logs) messages that arrive while it is full.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        credentials: &Credentials,
        inbound: mpsc::Sender<InboundMessage>,
    ) -> Result<Box<dyn Connection>, SessionError>;
}
