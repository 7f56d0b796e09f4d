//! Callables that live on the far side of the boundary.
//!
//! A `callback` marker decodes to a [`CallbackStub`]. Calling the stub encodes
//! the arguments, sends them back through a [`CallbackTransport`], and decodes
//! the reply in the same session.
//!
//! A stub only holds a weak link to its codec: it may be parked in the handle
//! table it would otherwise keep alive. Once the owning broker is gone, calling
//! it fails with `CallbackFailed`.

use serde::{Deserialize, Serialize};

use crate::{
    codec::{Codec, Origin, WeakCodec},
    error::{BridgeError, BridgeResult},
    value::{Invocable, Value},
    wire::{CallbackMarker, WireValue},
};

/// Tag of a result payload that reports a failed callback.
pub const CALLBACK_ERROR_TAG: &str = "callback_error";

/// A callback invocation headed for the far side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackRequest {
    pub session_id: String,
    pub callback_id: String,
    pub args: Vec<WireValue>,
}

/// The far side's answer to a [`CallbackRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackReply {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<WireValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl CallbackReply {
    #[must_use]
    pub fn ok(result: WireValue) -> Self {
        Self {
            success: true,
            result: Some(result),
            error_message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error_message: Some(message.into()),
        }
    }
}

/// Carries callback invocations back to the runtime that owns the callable.
///
/// Transport framing is the implementor's concern. Errors returned here reach
/// the caller of the stub unchanged.
pub trait CallbackTransport: Send + Sync {
    fn invoke(&self, request: CallbackRequest) -> BridgeResult<CallbackReply>;
}

impl<F> CallbackTransport for F
where
    F: Fn(CallbackRequest) -> BridgeResult<CallbackReply> + Send + Sync,
{
    fn invoke(&self, request: CallbackRequest) -> BridgeResult<CallbackReply> {
        self(request)
    }
}

/// Local stand-in for a far-side callable.
#[derive(Debug)]
pub struct CallbackStub {
    codec: WeakCodec,
    session_id: String,
    marker: CallbackMarker,
}

impl CallbackStub {
    pub fn new(codec: &Codec, session_id: impl Into<String>, marker: CallbackMarker) -> Self {
        Self {
            codec: codec.downgrade(),
            session_id: session_id.into(),
            marker,
        }
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn failed(&self, reason: impl std::fmt::Display) -> BridgeError {
        BridgeError::CallbackFailed(format!("{}: {reason}", self.marker.id))
    }
}

impl Invocable for CallbackStub {
    fn call(&self, args: Vec<Value>) -> BridgeResult<Value> {
        if let Some(arity) = self.marker.arity
            && arity != args.len()
        {
            return Err(self.failed(format_args!("expected {arity} arguments, got {}", args.len())));
        }
        let Some(codec) = self.codec.upgrade() else {
            return Err(self.failed("bridge has shut down"));
        };
        let Some(transport) = codec.transport() else {
            return Err(self.failed("no callback transport configured"));
        };

        let origin = Origin::session(self.session_id.as_str());
        let request = CallbackRequest {
            session_id: self.session_id.clone(),
            callback_id: self.marker.id.clone(),
            args: args.iter().map(|arg| codec.encode(arg, &origin)).collect(),
        };
        tracing::debug!(session_id = %self.session_id, callback_id = %self.marker.id, "invoking callback");
        let reply = transport.invoke(request)?;

        if !reply.success {
            let message = reply.error_message.unwrap_or_else(|| "remote side reported failure".to_owned());
            return Err(self.failed(message));
        }
        match reply.result {
            None => Ok(Value::None),
            Some(result) if result.tag() == Some(CALLBACK_ERROR_TAG) => {
                let reason = match &result {
                    WireValue::Unknown(fields) => fields.get("reason").and_then(|r| r.as_str()).map(str::to_owned),
                    _ => None,
                };
                Err(self.failed(reason.unwrap_or_else(|| "callback error".to_owned())))
            }
            Some(result) => codec.decode(&result, &self.session_id),
        }
    }

    fn name(&self) -> &str {
        &self.marker.id
    }

    fn arity(&self) -> Option<usize> {
        self.marker.arity
    }

    fn as_callback(&self) -> Option<&CallbackMarker> {
        Some(&self.marker)
    }
}
