//! PortLink Signaling Protocol
//!
//! Defines the JSON messages exchanged over the signaling connection while a
//! peer link negotiates, plus the session description types handed to and
//! from the link.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Path of the signaling endpoint on the server
pub const SIGNALING_PATH: &str = "/ice";

/// Query parameter carrying the bearer token on the upgrade request
pub const TOKEN_QUERY_PARAM: &str = "token";

/// Label of the stream every client opens before its first offer so that
/// the offer advertises data channel support. Never routed to a backend.
pub const KEEPALIVE_LABEL: &str = "init-keepalive";

// ─────────────────────────────────────────────────────────────────────────────
// Session Descriptions
// ─────────────────────────────────────────────────────────────────────────────

/// Which side of the offer/answer exchange a description belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A session description produced or consumed by a peer link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// An address candidate in its JSON form
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateInit {
    pub candidate: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,

    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Signaling Messages
// ─────────────────────────────────────────────────────────────────────────────

/// Kind of a signaling message. Unknown kinds decode to [`SignalKind::Unknown`]
/// and are ignored by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
    #[serde(other)]
    Unknown,
}

/// A message on the signaling connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub kind: SignalKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<CandidateInit>,
}

impl SignalMessage {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SignalKind::Offer,
            sdp: Some(sdp.into()),
            candidate: None,
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SignalKind::Answer,
            sdp: Some(sdp.into()),
            candidate: None,
        }
    }

    pub fn candidate(candidate: CandidateInit) -> Self {
        Self {
            kind: SignalKind::Candidate,
            sdp: None,
            candidate: Some(candidate),
        }
    }

    /// The SDP payload, empty when absent
    pub fn sdp_or_empty(&self) -> &str {
        self.sdp.as_deref().unwrap_or_default()
    }

    /// Serialize message to a JSON string
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize message from JSON bytes
    pub fn from_json(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

impl From<SessionDescription> for SignalMessage {
    fn from(desc: SessionDescription) -> Self {
        match desc.kind {
            SdpKind::Offer => SignalMessage::offer(desc.sdp),
            SdpKind::Answer => SignalMessage::answer(desc.sdp),
        }
    }
}
