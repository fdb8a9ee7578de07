//! Error taxonomy for the mesh core.
//!
//! Each error is handled by the component that detects it: a
//! `ConnectionError` only stalls new joins, a `TransportError` only tears down
//! the session it belongs to, and a `ParseError` only drops one message.

/// The signaling relay could not be reached.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The relay URL is not a usable WebSocket URL
    #[error("invalid relay url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// The WebSocket handshake failed
    #[error("relay unreachable at {url}: {reason}")]
    Unreachable { url: String, reason: String },
}

/// Failure local to one peer session.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The transport could not be created
    #[error("transport setup failed: {0}")]
    Setup(String),

    /// Offer/answer generation or application failed
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// A remote ICE candidate was rejected
    #[error("candidate rejected: {0}")]
    Candidate(String),

    /// A payload could not be delivered
    #[error("send failed: {0}")]
    Send(String),

    /// The transport has no open channel
    #[error("transport closed")]
    Closed,
}

/// A single inbound message that could not be understood.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// Not JSON at all, or the wrong JSON shape
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),

    /// Binary frame that is not UTF-8
    #[error("payload is not utf-8")]
    NotUtf8,

    /// Frame without a string `type` tag
    #[error("missing message type")]
    MissingType,

    /// Frame with a tag outside the known set
    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// Known tag but invalid fields
    #[error("invalid {kind} message: {reason}")]
    Invalid { kind: String, reason: String },
}
