//! Error types for PortLink
//!
//! One error enum for the whole tunnel layer, grouped by how far a failure
//! reaches: configuration and listener errors are fatal at startup, the rest
//! end a single session or connection attempt.

use std::net::SocketAddr;

use thiserror::Error;

/// Result type alias for PortLink operations
pub type Result<T> = std::result::Result<T, PortLinkError>;

/// Unified error type for all PortLink operations
#[derive(Error, Debug)]
pub enum PortLinkError {
    // ─────────────────────────────────────────────────────────────
    // Configuration Errors (fatal at startup)
    // ─────────────────────────────────────────────────────────────
    #[error("invalid port format: {0}")]
    InvalidPortFormat(String),

    #[error("port conflict detected: {dest} is already mapped from {original} (requested again from {src})")]
    PortConflict {
        dest: String,
        src: String,
        original: String,
    },

    #[error("invalid port number: {0}")]
    InvalidPort(String),

    #[error("missing required flag: {0}")]
    MissingFlag(&'static str),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    // ─────────────────────────────────────────────────────────────
    // Authorization Errors (per session)
    // ─────────────────────────────────────────────────────────────
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Refused unknown label: {0}")]
    UnknownLabel(String),

    // ─────────────────────────────────────────────────────────────
    // Dial Errors (per session)
    // ─────────────────────────────────────────────────────────────
    #[error("Failed to dial backend {addr}: {reason}")]
    DialFailed { addr: SocketAddr, reason: String },

    // ─────────────────────────────────────────────────────────────
    // Negotiation Errors (per connection attempt)
    // ─────────────────────────────────────────────────────────────
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Signaling error: {0}")]
    Signaling(String),

    // ─────────────────────────────────────────────────────────────
    // Listener Errors (fatal)
    // ─────────────────────────────────────────────────────────────
    #[error("Failed to bind to {addr}: {reason}")]
    ListenBind { addr: String, reason: String },

    // ─────────────────────────────────────────────────────────────
    // Transport Errors (mid session)
    // ─────────────────────────────────────────────────────────────
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("No connected link available")]
    LinkNotReady,

    #[error("Virtual stream '{0}' did not open in time")]
    StreamOpenTimeout(String),

    #[error("Virtual stream '{0}' closed before opening")]
    StreamClosed(String),

    // ─────────────────────────────────────────────────────────────
    // IO Errors
    // ─────────────────────────────────────────────────────────────
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl PortLinkError {
    /// Whether the error should terminate the process rather than a single
    /// session or attempt.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PortLinkError::InvalidPortFormat(_)
                | PortLinkError::PortConflict { .. }
                | PortLinkError::InvalidPort(_)
                | PortLinkError::MissingFlag(_)
                | PortLinkError::ConfigError(_)
                | PortLinkError::ListenBind { .. }
        )
    }
}

impl From<webrtc::Error> for PortLinkError {
    fn from(err: webrtc::Error) -> Self {
        PortLinkError::Negotiation(err.to_string())
    }
}

impl From<serde_json::Error> for PortLinkError {
    fn from(err: serde_json::Error) -> Self {
        PortLinkError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for PortLinkError {
    fn from(err: toml::de::Error) -> Self {
        PortLinkError::ConfigError(err.to_string())
    }
}
