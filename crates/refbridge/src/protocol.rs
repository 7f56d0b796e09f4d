//! Protocol version negotiation.
//!
//! Every call carries the caller's `(protocol_version, min_supported_version)`.
//! The check runs before any payload is decoded, so an incompatible peer fails
//! fast with both pairs in the error instead of tripping over an unknown tag.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};

/// Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u32 = 1;
/// Oldest caller protocol version this crate accepts.
pub const MIN_SUPPORTED_VERSION: u32 = 1;
/// Version assumed for senders that predate negotiation.
pub const LEGACY_PROTOCOL_VERSION: u32 = 0;

/// A `(protocol_version, min_supported_version)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionPair {
    /// Highest protocol version the side speaks.
    pub protocol_version: u32,
    /// Lowest protocol version the side accepts from its peer.
    pub min_supported_version: u32,
}

impl VersionPair {
    #[must_use]
    pub const fn new(protocol_version: u32, min_supported_version: u32) -> Self {
        Self {
            protocol_version,
            min_supported_version,
        }
    }

    /// The pair this crate advertises.
    #[must_use]
    pub const fn local() -> Self {
        Self::new(PROTOCOL_VERSION, MIN_SUPPORTED_VERSION)
    }

    /// The pair substituted for callers that omit their version fields.
    #[must_use]
    pub const fn legacy() -> Self {
        Self::new(LEGACY_PROTOCOL_VERSION, LEGACY_PROTOCOL_VERSION)
    }

    /// Builds a pair from optional envelope fields; both must be present.
    #[must_use]
    pub fn from_fields(protocol_version: Option<u32>, min_supported_version: Option<u32>) -> Option<Self> {
        Some(Self::new(protocol_version?, min_supported_version?))
    }
}

impl Default for VersionPair {
    fn default() -> Self {
        Self::local()
    }
}

impl fmt::Display for VersionPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(protocol={}, min={})",
            self.protocol_version, self.min_supported_version
        )
    }
}

/// Checks the caller's version pair against the local one.
///
/// Fails when `caller.protocol < local.min` or `caller.min > local.protocol`.
/// Returns the agreed protocol version (the lower of the two maxima).
///
/// Legacy mode is strictly opt-in: when `allow_legacy` is set, a caller that
/// omitted its version fields is treated as [`VersionPair::legacy`] and the local
/// minimum is lowered to [`LEGACY_PROTOCOL_VERSION`]. Without it, a missing pair
/// is a mismatch.
pub fn negotiate(caller: Option<VersionPair>, local: VersionPair, allow_legacy: bool) -> BridgeResult<u32> {
    let caller_pair = match caller {
        Some(pair) => pair,
        None if allow_legacy => VersionPair::legacy(),
        None => return Err(BridgeError::ProtocolVersionMismatch { caller: None, local }),
    };

    let local_min = if allow_legacy {
        local.min_supported_version.min(LEGACY_PROTOCOL_VERSION)
    } else {
        local.min_supported_version
    };

    if caller_pair.protocol_version < local_min || caller_pair.min_supported_version > local.protocol_version {
        return Err(BridgeError::ProtocolVersionMismatch {
            caller: Some(caller_pair),
            local,
        });
    }

    Ok(caller_pair.protocol_version.min(local.protocol_version))
}
