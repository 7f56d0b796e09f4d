//! Encode live values to the wire and decode them back.
//!
//! `encode` is total: values with no wire shape are parked in the handle table
//! and replaced by reference markers, cycles are broken with a reference at the
//! back-edge, and a structure nested deeper than the configured ceiling falls
//! back to a single reference for the whole top-level value. Handles minted
//! during an abandoned attempt are released before the fallback is minted.
//!
//! `decode` is the inverse and can fail: markers are resolved against the table
//! (`ReferenceNotFound`), and payloads that break the grammar or nest too deeply
//! are `MalformedEnvelope`.

mod decode;
mod encode;

use std::{
    fmt,
    sync::{Arc, Weak},
};

use serde_json::Value as JsonValue;

use crate::{
    callback::CallbackTransport,
    config::CodecLimits,
    error::BridgeResult,
    handle::HandleTable,
    value::Value,
    wire::WireValue,
};

/// The call a value was produced by; stamped onto minted references.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Origin {
    pub session_id: String,
    /// Module of the callable that produced the value.
    pub module: String,
    /// Library the module belongs to.
    pub library: String,
}

impl Origin {
    pub fn new(session_id: impl Into<String>, module: impl Into<String>, library: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            module: module.into(),
            library: library.into(),
        }
    }

    /// An origin with only a session, for values not produced by a call.
    pub fn session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Self::default()
        }
    }
}

struct CodecInner {
    table: Arc<HandleTable>,
    limits: CodecLimits,
    transport: Option<Arc<dyn CallbackTransport>>,
}

/// Encoder/decoder bound to one handle table.
///
/// Cheap to clone; clones share the table and transport.
#[derive(Clone)]
pub struct Codec {
    inner: Arc<CodecInner>,
}

impl Codec {
    #[must_use]
    pub fn new(table: Arc<HandleTable>, limits: CodecLimits) -> Self {
        Self {
            inner: Arc::new(CodecInner {
                table,
                limits,
                transport: None,
            }),
        }
    }

    /// Returns a codec whose decoded callbacks call back through `transport`.
    #[must_use]
    pub fn with_transport(&self, transport: Arc<dyn CallbackTransport>) -> Self {
        Self {
            inner: Arc::new(CodecInner {
                table: Arc::clone(&self.inner.table),
                limits: self.inner.limits,
                transport: Some(transport),
            }),
        }
    }

    #[must_use]
    pub fn table(&self) -> &Arc<HandleTable> {
        &self.inner.table
    }

    #[must_use]
    pub fn limits(&self) -> CodecLimits {
        self.inner.limits
    }

    #[must_use]
    pub fn transport(&self) -> Option<&Arc<dyn CallbackTransport>> {
        self.inner.transport.as_ref()
    }

    /// A handle that does not keep the codec (or its table) alive.
    pub(crate) fn downgrade(&self) -> WeakCodec {
        WeakCodec {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Encodes a value produced by the call described by `origin`. Never fails.
    #[must_use]
    pub fn encode(&self, value: &Value, origin: &Origin) -> WireValue {
        encode::encode_value(&self.inner.table, self.inner.limits, value, origin)
    }

    /// [`Codec::encode`] straight to JSON.
    #[must_use]
    pub fn encode_json(&self, value: &Value, origin: &Origin) -> JsonValue {
        self.encode(value, origin).to_json()
    }

    /// Decodes a wire value in the context of `session_id`.
    pub fn decode(&self, wire: &WireValue, session_id: &str) -> BridgeResult<Value> {
        decode::decode_value(self, wire, session_id)
    }

    /// Parses and decodes a JSON wire value.
    pub fn decode_json(&self, json: JsonValue, session_id: &str) -> BridgeResult<Value> {
        let wire = WireValue::from_json(json)?;
        self.decode(&wire, session_id)
    }
}

impl fmt::Debug for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Codec")
            .field("limits", &self.inner.limits)
            .field("handles", &self.inner.table.len())
            .field("has_transport", &self.inner.transport.is_some())
            .finish()
    }
}

/// Non-owning [`Codec`]; held by values that may end up parked in the table.
#[derive(Clone)]
pub(crate) struct WeakCodec {
    inner: Weak<CodecInner>,
}

impl WeakCodec {
    pub(crate) fn upgrade(&self) -> Option<Codec> {
        self.inner.upgrade().map(|inner| Codec { inner })
    }
}

impl fmt::Debug for WeakCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakCodec")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}
