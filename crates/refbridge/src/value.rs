//! Live values as seen by the runtime that owns them.
//!
//! [`Value`] is the codec's input and output domain. Immediates are plain data.
//! Containers are shared allocations so that one object can appear at several
//! places in a structure (or inside itself), which is what makes identity
//! memoization and cycle detection meaningful. Values with no wire
//! representation are trait objects: [`Opaque`], [`PullStream`],
//! [`AsyncPullStream`] and [`Invocable`].

use std::{
    any::Any,
    fmt,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use chrono::{NaiveDate, NaiveTime};

use crate::{
    error::BridgeResult,
    identity::Identity,
    wire::{CallbackMarker, IsoDateTime, StreamKind},
};

/// A mutable container shared by reference.
pub type Shared<T> = Arc<RwLock<T>>;

/// Boxed future returned by [`AsyncPullStream::anext`].
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// How deep `Debug` output descends before eliding; keeps cyclic values printable.
const DEBUG_DEPTH: usize = 12;

// =============================================================================
// Live object traits
// =============================================================================

/// An arbitrary live object with no wire representation.
pub trait Opaque: Send + Sync + fmt::Debug {
    /// Runtime type name, reported as the reference's `type_name`.
    fn type_name(&self) -> &str;

    /// Enables downcasting after the object is resolved from a handle.
    fn as_any(&self) -> &dyn Any;
}

/// A synchronous, single-consumer pull sequence (generator or iterator).
pub trait PullStream: Send + Sync + fmt::Debug {
    /// Pulls the next item, or `None` once exhausted.
    fn next_item(&self) -> Option<Value>;

    /// Whether this stream is a generator or a plain iterator.
    fn kind(&self) -> StreamKind {
        StreamKind::Iterator
    }

    fn type_name(&self) -> &str {
        match self.kind() {
            StreamKind::Generator => "generator",
            StreamKind::AsyncGenerator => "async_generator",
            StreamKind::Iterator => "iterator",
        }
    }

    /// File-like resources iterate but are encoded as plain references.
    fn is_context_manager(&self) -> bool {
        false
    }
}

/// An asynchronous generator.
///
/// Always encoded as a plain reference, never a stream reference: its pull
/// protocol is not a synchronous `next`.
pub trait AsyncPullStream: Send + Sync + fmt::Debug {
    fn anext(&self) -> BoxFuture<'_, Option<Value>>;

    fn type_name(&self) -> &str {
        "async_generator"
    }
}

/// Anything callable with positional arguments.
pub trait Invocable: Send + Sync + fmt::Debug {
    fn call(&self, args: Vec<Value>) -> BridgeResult<Value>;

    fn name(&self) -> &str;

    /// Expected positional argument count, when known.
    fn arity(&self) -> Option<usize> {
        None
    }

    /// The far-side callback this invocable stands for, if it is a decoded stub.
    fn as_callback(&self) -> Option<&CallbackMarker> {
        None
    }
}

// =============================================================================
// Value
// =============================================================================

/// A complex number.
#[derive(Debug, Clone, Copy, Default)]
pub struct Complex {
    pub re: f64,
    pub im: f64,
}

impl Complex {
    #[must_use]
    pub const fn new(re: f64, im: f64) -> Self {
        Self { re, im }
    }
}

impl PartialEq for Complex {
    fn eq(&self, other: &Self) -> bool {
        float_eq(self.re, other.re) && float_eq(self.im, other.im)
    }
}

/// A live value.
///
/// Equality is structural for data (sets compare without regard to order, floats
/// treat `NaN` as equal to itself) and pointer identity for live objects.
#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Complex(Complex),
    DateTime(IsoDateTime),
    Date(NaiveDate),
    Time(NaiveTime),
    Atom(String),
    Tuple(Arc<Vec<Self>>),
    FrozenSet(Arc<Vec<Self>>),
    List(Shared<Vec<Self>>),
    /// Insertion-ordered pairs; keys may be any value.
    Dict(Shared<Vec<(Self, Self)>>),
    Set(Shared<Vec<Self>>),
    Object(Arc<dyn Opaque>),
    Stream(Arc<dyn PullStream>),
    AsyncStream(Arc<dyn AsyncPullStream>),
    Function(Arc<dyn Invocable>),
}

impl Value {
    pub fn str(s: impl Into<String>) -> Self {
        Self::Str(s.into())
    }

    #[must_use]
    pub fn list(items: Vec<Self>) -> Self {
        Self::List(Arc::new(RwLock::new(items)))
    }

    #[must_use]
    pub fn tuple(items: Vec<Self>) -> Self {
        Self::Tuple(Arc::new(items))
    }

    #[must_use]
    pub fn set(items: Vec<Self>) -> Self {
        Self::Set(Arc::new(RwLock::new(items)))
    }

    #[must_use]
    pub fn frozenset(items: Vec<Self>) -> Self {
        Self::FrozenSet(Arc::new(items))
    }

    #[must_use]
    pub fn dict(pairs: Vec<(Self, Self)>) -> Self {
        Self::Dict(Arc::new(RwLock::new(pairs)))
    }

    /// Creates a dict with string keys.
    pub fn str_dict<K: Into<String>>(pairs: impl IntoIterator<Item = (K, Self)>) -> Self {
        Self::dict(pairs.into_iter().map(|(k, v)| (Self::Str(k.into()), v)).collect())
    }

    pub fn object(object: impl Opaque + 'static) -> Self {
        Self::Object(Arc::new(object))
    }

    pub fn stream(stream: impl PullStream + 'static) -> Self {
        Self::Stream(Arc::new(stream))
    }

    pub fn function(function: impl Invocable + 'static) -> Self {
        Self::Function(Arc::new(function))
    }

    /// Runtime type name, used as the `type_name` of references to this value.
    #[must_use]
    pub fn type_name(&self) -> &str {
        match self {
            Self::None => "NoneType",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::Bytes(_) => "bytes",
            Self::Complex(_) => "complex",
            Self::DateTime(_) => "datetime",
            Self::Date(_) => "date",
            Self::Time(_) => "time",
            Self::Atom(_) => "atom",
            Self::Tuple(_) => "tuple",
            Self::FrozenSet(_) => "frozenset",
            Self::List(_) => "list",
            Self::Dict(_) => "dict",
            Self::Set(_) => "set",
            Self::Object(object) => object.type_name(),
            Self::Stream(stream) => stream.type_name(),
            Self::AsyncStream(stream) => stream.type_name(),
            Self::Function(_) => "function",
        }
    }

    /// Identity of the shared allocation behind this value, if it has one.
    ///
    /// Immediates are copied by value and have no identity.
    #[must_use]
    pub fn identity(&self) -> Option<Identity> {
        match self {
            Self::Tuple(items) | Self::FrozenSet(items) => Some(Identity::of(items)),
            Self::List(items) | Self::Set(items) => Some(Identity::of(items)),
            Self::Dict(pairs) => Some(Identity::of(pairs)),
            Self::Object(object) => Some(Identity::of(object)),
            Self::Stream(stream) => Some(Identity::of(stream)),
            Self::AsyncStream(stream) => Some(Identity::of(stream)),
            Self::Function(function) => Some(Identity::of(function)),
            _ => None,
        }
    }

    /// Whether two values are the same object (not merely equal).
    #[must_use]
    pub fn is(&self, other: &Self) -> bool {
        match (self.identity(), other.identity()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// Downcasts an opaque object to its concrete type.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Self::Object(object) => object.as_any().downcast_ref(),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

// =============================================================================
// Equality
// =============================================================================

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        if self.is(other) {
            return true;
        }
        match (self, other) {
            (Self::None, Self::None) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => float_eq(*a, *b),
            (Self::Str(a), Self::Str(b)) | (Self::Atom(a), Self::Atom(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::Complex(a), Self::Complex(b)) => a == b,
            (Self::DateTime(a), Self::DateTime(b)) => a == b,
            (Self::Date(a), Self::Date(b)) => a == b,
            (Self::Time(a), Self::Time(b)) => a == b,
            (Self::Tuple(a), Self::Tuple(b)) => a == b,
            (Self::FrozenSet(a), Self::FrozenSet(b)) => unordered_eq(a, b),
            (Self::List(a), Self::List(b)) => *read(a) == *read(b),
            (Self::Dict(a), Self::Dict(b)) => *read(a) == *read(b),
            (Self::Set(a), Self::Set(b)) => unordered_eq(&read(a), &read(b)),
            // live values only compare equal by identity, handled above
            _ => false,
        }
    }
}

fn float_eq(a: f64, b: f64) -> bool {
    a == b || (a.is_nan() && b.is_nan())
}

/// Multiset equality; sets hold few enough elements that quadratic is fine.
fn unordered_eq(a: &[Value], b: &[Value]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut used = vec![false; b.len()];
    a.iter().all(|x| {
        let found = b
            .iter()
            .enumerate()
            .find(|(i, y)| !used[*i] && x == *y)
            .map(|(i, _)| i);
        match found {
            Some(i) => {
                used[i] = true;
                true
            }
            None => false,
        }
    })
}

// =============================================================================
// Debug
// =============================================================================

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&Bounded(self, DEBUG_DEPTH), f)
    }
}

struct Bounded<'a>(&'a Value, usize);

impl fmt::Debug for Bounded<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self(value, depth) = *self;
        if depth == 0 {
            return write!(f, "<{} ...>", value.type_name());
        }
        match value {
            Value::None => f.write_str("None"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Int(i) => write!(f, "Int({i})"),
            Value::Float(x) => write!(f, "Float({x:?})"),
            Value::Str(s) => write!(f, "Str({s:?})"),
            Value::Bytes(b) => write!(f, "Bytes({b:?})"),
            Value::Complex(c) => write!(f, "Complex({}, {})", c.re, c.im),
            Value::DateTime(dt) => write!(f, "DateTime({dt})"),
            Value::Date(d) => write!(f, "Date({d})"),
            Value::Time(t) => write!(f, "Time({t})"),
            Value::Atom(a) => write!(f, "Atom({a})"),
            Value::Tuple(items) => f.debug_tuple("Tuple").field(&DebugSeq(items, depth)).finish(),
            Value::FrozenSet(items) => f.debug_tuple("FrozenSet").field(&DebugSeq(items, depth)).finish(),
            Value::List(items) => f.debug_tuple("List").field(&DebugSeq(&read(items), depth)).finish(),
            Value::Set(items) => f.debug_tuple("Set").field(&DebugSeq(&read(items), depth)).finish(),
            Value::Dict(pairs) => f
                .debug_map()
                .entries(read(pairs).iter().map(|(k, v)| (Bounded(k, depth - 1), Bounded(v, depth - 1))))
                .finish(),
            Value::Object(object) => write!(f, "Object({object:?})"),
            Value::Stream(stream) => write!(f, "Stream({stream:?})"),
            Value::AsyncStream(stream) => write!(f, "AsyncStream({stream:?})"),
            Value::Function(function) => write!(f, "Function({})", function.name()),
        }
    }
}

struct DebugSeq<'a>(&'a [Value], usize);

impl fmt::Debug for DebugSeq<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.iter().map(|v| Bounded(v, self.1 - 1))).finish()
    }
}

// =============================================================================
// Lock helpers
// =============================================================================

/// Read-locks a shared container, recovering from poisoning.
pub fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

/// Write-locks a shared container, recovering from poisoning.
pub fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Ready-made live values
// =============================================================================

/// A [`PullStream`] over any Rust iterator.
pub struct IterStream {
    kind: StreamKind,
    inner: Mutex<Box<dyn Iterator<Item = Value> + Send>>,
}

impl IterStream {
    /// A generator-kind stream.
    pub fn generator(iter: impl Iterator<Item = Value> + Send + 'static) -> Self {
        Self {
            kind: StreamKind::Generator,
            inner: Mutex::new(Box::new(iter)),
        }
    }

    /// An iterator-kind stream.
    pub fn iterator(iter: impl Iterator<Item = Value> + Send + 'static) -> Self {
        Self {
            kind: StreamKind::Iterator,
            inner: Mutex::new(Box::new(iter)),
        }
    }
}

impl fmt::Debug for IterStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IterStream").field("kind", &self.kind).finish_non_exhaustive()
    }
}

impl PullStream for IterStream {
    fn next_item(&self) -> Option<Value> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).next()
    }

    fn kind(&self) -> StreamKind {
        self.kind
    }
}

type NativeFn = dyn Fn(Vec<Value>) -> BridgeResult<Value> + Send + Sync;

/// An [`Invocable`] backed by a Rust closure.
pub struct NativeFunction {
    name: String,
    arity: Option<usize>,
    func: Box<NativeFn>,
}

impl NativeFunction {
    pub fn new(
        name: impl Into<String>,
        arity: Option<usize>,
        func: impl Fn(Vec<Value>) -> BridgeResult<Value> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            arity,
            func: Box::new(func),
        }
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFunction")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish_non_exhaustive()
    }
}

impl Invocable for NativeFunction {
    fn call(&self, args: Vec<Value>) -> BridgeResult<Value> {
        (self.func)(args)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn arity(&self) -> Option<usize> {
        self.arity
    }
}
