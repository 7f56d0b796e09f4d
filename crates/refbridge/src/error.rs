//! Error taxonomy for the bridge.
//!
//! Separates the failure categories a caller can act on (protocol mismatch,
//! a reference that is gone, a payload that does not parse, a failed callback)
//! so the dispatch layer can turn them into structured failure payloads without
//! string parsing.

use std::fmt;

use crate::protocol::VersionPair;

/// Stable, wire-visible name of an error category.
///
/// Serialized into the `error_kind` field of failure responses, so the names
/// are part of the wire contract and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::IntoStaticStr)]
pub enum ErrorKind {
    ProtocolVersionMismatch,
    ReferenceNotFound,
    MalformedEnvelope,
    CallbackFailed,
    DispatchFailed,
}

/// Errors surfaced by decoding, handle resolution, negotiation and callbacks.
///
/// Encoding never produces a `BridgeError`: resource exhaustion during encode
/// is resolved internally by falling back to a reference.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BridgeError {
    /// The caller's protocol range does not overlap the local one.
    ///
    /// `caller` is `None` when the caller omitted its version fields and legacy
    /// mode is disabled.
    #[error("protocol version mismatch: caller {}, local {local}", DisplayCaller(.caller))]
    ProtocolVersionMismatch {
        /// The caller's `(protocol_version, min_supported_version)`, if sent.
        caller: Option<VersionPair>,
        /// The local `(protocol_version, min_supported_version)`.
        local: VersionPair,
    },
    /// The handle is unknown, expired, evicted or belongs to another session.
    #[error("reference not found: {id} (session {session_id})")]
    ReferenceNotFound {
        /// Session the lookup was scoped to.
        session_id: String,
        /// The handle id that failed to resolve.
        id: String,
    },
    /// The payload does not match the tagged-value grammar.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
    /// The far side reported a failure while executing a callback.
    #[error("callback failed: {0}")]
    CallbackFailed(String),
    /// The external dispatch engine failed to run the requested callable.
    #[error("dispatch failed: {0}")]
    DispatchFailed(String),
}

impl BridgeError {
    /// Creates a `MalformedEnvelope` error from anything displayable.
    pub fn malformed(msg: impl fmt::Display) -> Self {
        Self::MalformedEnvelope(msg.to_string())
    }

    /// Creates a `ReferenceNotFound` error.
    pub fn not_found(session_id: impl Into<String>, id: impl Into<String>) -> Self {
        Self::ReferenceNotFound {
            session_id: session_id.into(),
            id: id.into(),
        }
    }

    /// Returns the wire-visible category of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ProtocolVersionMismatch { .. } => ErrorKind::ProtocolVersionMismatch,
            Self::ReferenceNotFound { .. } => ErrorKind::ReferenceNotFound,
            Self::MalformedEnvelope(_) => ErrorKind::MalformedEnvelope,
            Self::CallbackFailed(_) => ErrorKind::CallbackFailed,
            Self::DispatchFailed(_) => ErrorKind::DispatchFailed,
        }
    }

    /// Whether the caller can reasonably recover and retry.
    ///
    /// Only a missing reference qualifies: the referenced value is gone and must
    /// be re-fetched or re-created. Every other kind is fatal to the call.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::ReferenceNotFound { .. })
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        Self::MalformedEnvelope(err.to_string())
    }
}

/// Renders an optional caller pair for error messages.
struct DisplayCaller<'a>(&'a Option<VersionPair>);

impl fmt::Display for DisplayCaller<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(pair) => write!(f, "{pair}"),
            None => f.write_str("(unspecified)"),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type BridgeResult<T> = Result<T, BridgeError>;
