//! The call pipeline: negotiate, decode, dispatch, encode.
//!
//! [`Broker`] is the service a transport hands inbound calls to. It owns one
//! [`Codec`] (and with it one handle table) and turns every failure into a
//! structured [`CallResponse`] instead of propagating it.

use std::{sync::Arc, time::Duration};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Value as JsonValue, json};

use crate::{
    callback::CallbackTransport,
    codec::{Codec, Origin},
    config::BridgeConfig,
    error::{BridgeError, BridgeResult, ErrorKind},
    eviction::EvictionWorker,
    handle::{Clock, EvictionPolicy, HandleTable, SystemClock},
    protocol::{VersionPair, negotiate},
    value::Value,
    wire::{StreamRef, WireValue},
};

// =============================================================================
// Envelopes
// =============================================================================

/// An inbound call as it arrives on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_supported_version: Option<u32>,
    pub session_id: String,
    pub module: String,
    pub function: String,
    #[serde(default)]
    pub library: String,
    #[serde(default)]
    pub args: Vec<WireValue>,
    #[serde(default)]
    pub kwargs: IndexMap<String, WireValue>,
}

impl CallEnvelope {
    /// A call stamped with this crate's own version pair.
    pub fn new(session_id: impl Into<String>, module: impl Into<String>, function: impl Into<String>) -> Self {
        let local = VersionPair::local();
        Self {
            protocol_version: Some(local.protocol_version),
            min_supported_version: Some(local.min_supported_version),
            session_id: session_id.into(),
            module: module.into(),
            function: function.into(),
            library: String::new(),
            args: Vec::new(),
            kwargs: IndexMap::new(),
        }
    }

    #[must_use]
    pub fn library(mut self, library: impl Into<String>) -> Self {
        self.library = library.into();
        self
    }

    #[must_use]
    pub fn args(mut self, args: Vec<WireValue>) -> Self {
        self.args = args;
        self
    }

    #[must_use]
    pub fn kwarg(mut self, name: impl Into<String>, value: WireValue) -> Self {
        self.kwargs.insert(name.into(), value);
        self
    }

    /// Replaces the version fields; `None` omits them entirely.
    #[must_use]
    pub fn versions(mut self, pair: Option<VersionPair>) -> Self {
        self.protocol_version = pair.map(|p| p.protocol_version);
        self.min_supported_version = pair.map(|p| p.min_supported_version);
        self
    }

    /// The caller's version pair, if both fields were sent.
    #[must_use]
    pub fn version_pair(&self) -> Option<VersionPair> {
        VersionPair::from_fields(self.protocol_version, self.min_supported_version)
    }

    fn origin(&self) -> Origin {
        Origin::new(&self.session_id, &self.module, &self.library)
    }
}

/// Outcome of one call.
#[derive(Debug, Clone, PartialEq)]
pub enum CallResponse {
    Success { result: WireValue },
    Failure(CallFailure),
}

/// A failed call, ready to be sent back.
#[derive(Debug, Clone, PartialEq)]
pub struct CallFailure {
    pub kind: ErrorKind,
    pub message: String,
    /// Structured context, e.g. both version pairs for a protocol mismatch.
    pub details: Option<JsonValue>,
}

impl From<&BridgeError> for CallFailure {
    fn from(err: &BridgeError) -> Self {
        let details = match err {
            BridgeError::ProtocolVersionMismatch { caller, local } => Some(json!({
                "caller": caller.map(version_json),
                "local": version_json(*local),
            })),
            BridgeError::ReferenceNotFound { session_id, id } => Some(json!({
                "session_id": session_id,
                "id": id,
            })),
            _ => None,
        };
        Self {
            kind: err.kind(),
            message: err.to_string(),
            details,
        }
    }
}

fn version_json(pair: VersionPair) -> JsonValue {
    json!({
        "protocol_version": pair.protocol_version,
        "min_supported_version": pair.min_supported_version,
    })
}

impl CallResponse {
    #[must_use]
    pub fn failure(err: &BridgeError) -> Self {
        Self::Failure(err.into())
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    #[must_use]
    pub fn result(&self) -> Option<&WireValue> {
        match self {
            Self::Success { result } => Some(result),
            Self::Failure(_) => None,
        }
    }

    #[must_use]
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Success { .. } => None,
            Self::Failure(failure) => Some(failure.kind),
        }
    }

    /// `{"success": true, "result": ..}` or
    /// `{"success": false, "error_kind": .., "error": .., "details": ..}`.
    #[must_use]
    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Success { result } => json!({ "success": true, "result": result.to_json() }),
            Self::Failure(failure) => {
                let mut body = json!({
                    "success": false,
                    "error_kind": failure.kind.to_string(),
                    "error": failure.message,
                });
                if let (Some(details), Some(map)) = (&failure.details, body.as_object_mut()) {
                    map.insert("details".to_owned(), details.clone());
                }
                body
            }
        }
    }
}

impl Serialize for CallResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

/// Result of pulling from a stream reference.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Item(WireValue),
    Exhausted,
}

// =============================================================================
// Dispatch boundary
// =============================================================================

/// A decoded call, handed to the dispatch engine.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub session_id: String,
    pub module: String,
    pub function: String,
    pub library: String,
    pub args: Vec<Value>,
    pub kwargs: IndexMap<String, Value>,
}

/// Resolves `module` + `function` to a callable and runs it.
///
/// Engines report their own failures as [`BridgeError::DispatchFailed`]; other
/// error kinds (a callback that failed, a stale reference) pass through as is.
pub trait Dispatch {
    fn dispatch(&self, request: DispatchRequest) -> BridgeResult<Value>;
}

impl<F> Dispatch for F
where
    F: Fn(DispatchRequest) -> BridgeResult<Value>,
{
    fn dispatch(&self, request: DispatchRequest) -> BridgeResult<Value> {
        self(request)
    }
}

// =============================================================================
// Broker
// =============================================================================

/// Runs inbound calls against one handle table.
#[derive(Debug)]
pub struct Broker {
    codec: Codec,
    config: BridgeConfig,
    local: VersionPair,
    worker: Option<EvictionWorker>,
}

impl Broker {
    #[must_use]
    pub fn new(config: BridgeConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Creates a broker whose handle table reads time from `clock`.
    #[must_use]
    pub fn with_clock(config: BridgeConfig, clock: Arc<dyn Clock>) -> Self {
        let table = Arc::new(HandleTable::with_clock(EvictionPolicy::from_config(&config), clock));
        let worker = config
            .eviction_interval()
            .and_then(|interval| start_worker(&table, interval));
        Self {
            codec: Codec::new(table, config.codec_limits()),
            config,
            local: VersionPair::local(),
            worker,
        }
    }

    /// Routes decoded callbacks through `transport`.
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn CallbackTransport>) -> Self {
        self.codec = self.codec.with_transport(transport);
        self
    }

    #[must_use]
    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    #[must_use]
    pub fn table(&self) -> &Arc<HandleTable> {
        self.codec.table()
    }

    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    #[must_use]
    pub fn has_eviction_worker(&self) -> bool {
        self.worker.is_some()
    }

    /// Runs one call. Never panics on bad input; every failure is a response.
    pub fn handle_call(&self, envelope: &CallEnvelope, dispatch: &dyn Dispatch) -> CallResponse {
        match self.try_call(envelope, dispatch) {
            Ok(result) => CallResponse::Success { result },
            Err(err) => {
                tracing::debug!(
                    session_id = %envelope.session_id,
                    module = %envelope.module,
                    function = %envelope.function,
                    error_kind = %err.kind(),
                    "call failed: {err}"
                );
                CallResponse::failure(&err)
            }
        }
    }

    /// Parses a JSON envelope and runs it.
    ///
    /// The version fields are read and negotiated straight from the raw object,
    /// so an incompatible caller is rejected before any argument is parsed.
    pub fn handle_json(&self, envelope: JsonValue, dispatch: &dyn Dispatch) -> CallResponse {
        if let Err(err) = negotiate(raw_version_pair(&envelope), self.local, self.config.allow_legacy_protocol) {
            tracing::debug!(error_kind = %err.kind(), "call rejected before parsing: {err}");
            return CallResponse::failure(&err);
        }
        match serde_json::from_value::<CallEnvelope>(envelope) {
            Ok(envelope) => self.handle_call(&envelope, dispatch),
            Err(err) => CallResponse::failure(&BridgeError::from(err)),
        }
    }

    /// Runs calls in order, one response per envelope. A failed call does not
    /// stop the batch.
    pub fn handle_batch(&self, envelopes: &[CallEnvelope], dispatch: &dyn Dispatch) -> Vec<CallResponse> {
        envelopes
            .iter()
            .map(|envelope| self.handle_call(envelope, dispatch))
            .collect()
    }

    /// Releases one handle. Returns `false` if it was already gone.
    pub fn release(&self, session_id: &str, id: &str) -> bool {
        self.table().release(session_id, id)
    }

    /// Releases every handle of a session.
    pub fn release_session(&self, session_id: &str) -> usize {
        self.table().release_session(session_id)
    }

    /// Pulls the next item from a stream reference owned by `origin`'s session.
    pub fn stream_next(&self, stream: &StreamRef, origin: &Origin) -> BridgeResult<StreamItem> {
        match self.table().resolve(&origin.session_id, &stream.id)? {
            Value::Stream(source) => Ok(match source.next_item() {
                Some(item) => StreamItem::Item(self.codec.encode(&item, origin)),
                None => StreamItem::Exhausted,
            }),
            other => Err(BridgeError::malformed(format_args!(
                "reference {} is a {}, not a stream",
                stream.id,
                other.type_name()
            ))),
        }
    }

    fn try_call(&self, envelope: &CallEnvelope, dispatch: &dyn Dispatch) -> BridgeResult<WireValue> {
        negotiate(envelope.version_pair(), self.local, self.config.allow_legacy_protocol)?;

        let session_id = envelope.session_id.as_str();
        let args = envelope
            .args
            .iter()
            .map(|arg| self.codec.decode(arg, session_id))
            .collect::<BridgeResult<Vec<_>>>()?;
        let kwargs = envelope
            .kwargs
            .iter()
            .map(|(name, arg)| Ok((name.clone(), self.codec.decode(arg, session_id)?)))
            .collect::<BridgeResult<IndexMap<_, _>>>()?;

        let result = dispatch.dispatch(DispatchRequest {
            session_id: envelope.session_id.clone(),
            module: envelope.module.clone(),
            function: envelope.function.clone(),
            library: envelope.library.clone(),
            args,
            kwargs,
        })?;
        Ok(self.codec.encode(&result, &envelope.origin()))
    }
}

/// The version pair of an unparsed envelope. Fields that are absent or not a
/// `u32` count as missing.
fn raw_version_pair(envelope: &JsonValue) -> Option<VersionPair> {
    let field = |name: &str| {
        envelope
            .get(name)
            .and_then(JsonValue::as_u64)
            .and_then(|version| u32::try_from(version).ok())
    };
    VersionPair::from_fields(field("protocol_version"), field("min_supported_version"))
}

fn start_worker(table: &Arc<HandleTable>, interval: Duration) -> Option<EvictionWorker> {
    match EvictionWorker::spawn(table, interval) {
        Ok(worker) => Some(worker),
        Err(err) => {
            tracing::warn!("could not start eviction worker, pruning on store only: {err}");
            None
        }
    }
}
