use thiserror::Error;

/// Top-level error type for the `fleetlink-api` crate.
///
/// Covers the transport surface only: listener setup, WebSocket
/// handshakes, frame encoding. `fleetlink-core` maps these into
/// domain-level errors.
#[derive(Debug, Error)]
pub enum Error {
    // ── Listener ────────────────────────────────────────────────────
    /// Binding or accepting on the TCP listener failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ── Handshake ───────────────────────────────────────────────────
    /// The connection query string did not describe a valid peer.
    #[error("Invalid handshake: {reason}")]
    InvalidHandshake { reason: String },

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    // ── WebSocket ───────────────────────────────────────────────────
    /// WebSocket connection failed.
    #[error("WebSocket connection failed: {0}")]
    WebSocketConnect(String),

    /// WebSocket closed unexpectedly.
    #[error("WebSocket closed (code {code}): {reason}")]
    WebSocketClosed { code: u16, reason: String },

    // ── Data ────────────────────────────────────────────────────────
    /// A frame could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The peer sent a frame type that its role may not send.
    #[error("Unexpected frame from {role} connection: {kind}")]
    UnexpectedFrame { role: String, kind: String },
}

impl Error {
    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::WebSocketConnect(_) | Self::WebSocketClosed { .. }
        )
    }
}
