//! Configuration surface for the codec, handle table and call pipeline.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};

/// Default time-to-live of an idle handle (one hour).
pub const DEFAULT_REF_TTL_SECONDS: f64 = 3600.0;
/// Default maximum number of live handles across all sessions.
pub const DEFAULT_REF_TABLE_MAX_SIZE: usize = 10_000;
/// Default period of the background eviction worker.
pub const DEFAULT_EVICTION_INTERVAL_SECONDS: f64 = 60.0;

/// Default nesting ceiling for encode and decode.
///
/// Lower in debug mode to avoid stack overflow (debug builds use more stack space
/// per call frame).
#[cfg(debug_assertions)]
pub const DEFAULT_RECURSION_DEPTH_CEILING: usize = 200;

/// Default nesting ceiling for encode and decode.
#[cfg(not(debug_assertions))]
pub const DEFAULT_RECURSION_DEPTH_CEILING: usize = 500;

/// Bridge configuration.
///
/// Every field has a default, so a partial JSON document (or `{}`) is a valid
/// configuration. Use the builder methods for programmatic setup:
///
/// ```
/// use refbridge::BridgeConfig;
///
/// let config = BridgeConfig::new().ref_ttl_seconds(30.0).ref_table_max_size(128);
/// assert_eq!(config.ref_table_max_size, 128);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Idle lifetime of a handle in seconds. `0` means never expire by time.
    pub ref_ttl_seconds: f64,
    /// Maximum number of live handles. `0` means unbounded.
    pub ref_table_max_size: usize,
    /// Maximum container nesting the codec will traverse.
    pub recursion_depth_ceiling: usize,
    /// Accept callers that predate protocol negotiation.
    pub allow_legacy_protocol: bool,
    /// Period of the background prune pass in seconds. `0` disables the worker.
    pub eviction_interval_seconds: f64,
    /// Decode atoms as plain strings instead of `Value::Atom`.
    pub atoms_as_strings: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            ref_ttl_seconds: DEFAULT_REF_TTL_SECONDS,
            ref_table_max_size: DEFAULT_REF_TABLE_MAX_SIZE,
            recursion_depth_ceiling: DEFAULT_RECURSION_DEPTH_CEILING,
            allow_legacy_protocol: false,
            eviction_interval_seconds: DEFAULT_EVICTION_INTERVAL_SECONDS,
            atoms_as_strings: false,
        }
    }
}

impl BridgeConfig {
    /// Creates a configuration with all defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON configuration document; absent fields take their defaults.
    pub fn from_json_str(json: &str) -> BridgeResult<Self> {
        serde_json::from_str(json).map_err(|err| BridgeError::malformed(format_args!("invalid bridge config: {err}")))
    }

    /// Sets the idle TTL in seconds (`0` disables time-based expiry).
    #[must_use]
    pub fn ref_ttl_seconds(mut self, seconds: f64) -> Self {
        self.ref_ttl_seconds = seconds;
        self
    }

    /// Sets the handle table capacity (`0` means unbounded).
    #[must_use]
    pub fn ref_table_max_size(mut self, max_size: usize) -> Self {
        self.ref_table_max_size = max_size;
        self
    }

    /// Sets the encode/decode nesting ceiling.
    #[must_use]
    pub fn recursion_depth_ceiling(mut self, ceiling: usize) -> Self {
        self.recursion_depth_ceiling = ceiling;
        self
    }

    /// Enables or disables legacy protocol acceptance.
    #[must_use]
    pub fn allow_legacy_protocol(mut self, allow: bool) -> Self {
        self.allow_legacy_protocol = allow;
        self
    }

    /// Sets the background eviction period (`0` disables the worker).
    #[must_use]
    pub fn eviction_interval_seconds(mut self, seconds: f64) -> Self {
        self.eviction_interval_seconds = seconds;
        self
    }

    /// Decode atoms as plain strings.
    #[must_use]
    pub fn atoms_as_strings(mut self, enabled: bool) -> Self {
        self.atoms_as_strings = enabled;
        self
    }

    /// The idle TTL, or `None` when time-based expiry is disabled.
    ///
    /// Zero, negative and non-finite values all mean "never expire".
    #[must_use]
    pub fn ttl(&self) -> Option<Duration> {
        positive_duration(self.ref_ttl_seconds)
    }

    /// The capacity cap, or `None` when unbounded.
    #[must_use]
    pub fn max_size(&self) -> Option<usize> {
        (self.ref_table_max_size > 0).then_some(self.ref_table_max_size)
    }

    /// The eviction worker period, or `None` when the worker is disabled.
    #[must_use]
    pub fn eviction_interval(&self) -> Option<Duration> {
        positive_duration(self.eviction_interval_seconds)
    }

    /// The limits the codec itself needs.
    #[must_use]
    pub fn codec_limits(&self) -> CodecLimits {
        CodecLimits {
            depth_ceiling: self.recursion_depth_ceiling.max(1),
            atoms_as_strings: self.atoms_as_strings,
        }
    }
}

/// Codec-only subset of [`BridgeConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecLimits {
    /// Maximum container nesting traversed by encode and decode.
    pub depth_ceiling: usize,
    /// Decode atoms as plain strings.
    pub atoms_as_strings: bool,
}

impl Default for CodecLimits {
    fn default() -> Self {
        BridgeConfig::default().codec_limits()
    }
}

fn positive_duration(seconds: f64) -> Option<Duration> {
    if seconds.is_finite() && seconds > 0.0 {
        Duration::try_from_secs_f64(seconds).ok()
    } else {
        None
    }
}
