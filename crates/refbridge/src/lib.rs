#![doc = include_str!("../README.md")]

mod broker;
mod callback;
mod codec;
mod config;
mod error;
mod eviction;
mod handle;
mod identity;
mod protocol;
mod session;
mod value;
mod wire;

pub use crate::{
    broker::{Broker, CallEnvelope, CallFailure, CallResponse, Dispatch, DispatchRequest, StreamItem},
    callback::{CALLBACK_ERROR_TAG, CallbackReply, CallbackRequest, CallbackStub, CallbackTransport},
    codec::{Codec, Origin},
    config::{
        BridgeConfig, CodecLimits, DEFAULT_EVICTION_INTERVAL_SECONDS, DEFAULT_RECURSION_DEPTH_CEILING,
        DEFAULT_REF_TABLE_MAX_SIZE, DEFAULT_REF_TTL_SECONDS,
    },
    error::{BridgeError, BridgeResult, ErrorKind},
    eviction::EvictionWorker,
    handle::{Clock, EvictionPolicy, HandleTable, ManualClock, PruneReport, SystemClock, TableStats},
    identity::{Identity, IdentityTracker, Visit},
    protocol::{LEGACY_PROTOCOL_VERSION, MIN_SUPPORTED_VERSION, PROTOCOL_VERSION, VersionPair, negotiate},
    value::{
        AsyncPullStream, BoxFuture, Complex, Invocable, IterStream, NativeFunction, Opaque, PullStream, Shared, Value,
        read, write,
    },
    wire::{
        CallbackMarker, IsoDateTime, RefMarker, SCHEMA_KEY, SCHEMA_VERSION, SpecialFloat, StreamKind, StreamRef,
        TAG_KEY, WireValue, date_to_iso, time_to_iso,
    },
};
