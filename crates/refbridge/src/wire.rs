//! Tagged wire value model.
//!
//! [`WireValue`] is the closed set of shapes that cross the runtime boundary.
//! Values with a native JSON representation (null, bools, integers, finite floats,
//! strings, arrays, string-keyed objects) are emitted untagged. Everything else is
//! a JSON object carrying an explicit discriminator and schema version:
//!
//! - `SpecialFloat` → `{"type": "special_float", "schema": 1, "value": "infinity" | "neg_infinity" | "nan"}`
//! - `Bytes` → `{"type": "bytes", "schema": 1, "data": "<base64>"}`
//! - `Complex` → `{"type": "complex", "schema": 1, "real": .., "imag": ..}`
//! - `DateTime`/`Date`/`Time` → `{"type": "datetime" | "date" | "time", "schema": 1, "value": "<iso8601>"}`
//! - `Atom` → `{"type": "atom", "schema": 1, "value": ".."}`
//! - `Tuple`/`Set`/`FrozenSet` → `{"type": "tuple" | "set" | "frozenset", "schema": 1, "elements": [..]}`
//! - `Map` with a non-string key → `{"type": "dict", "schema": 1, "pairs": [[k, v], ..]}`
//! - `Reference` → `{"type": "ref", "schema": 1, "id", "session_id", "type_name", "source_module", "source_library"}`
//! - `StreamReference` → `{"type": "stream_ref", "schema": 1, "id", "session_id", "stream_type"}`
//! - `Callback` → `{"type": "callback", "schema": 1, "id", "arity"}`
//!
//! A string-keyed map that itself contains the tag key, or repeats a key, is
//! also emitted in the pair-list form. User data is never mistaken for a tagged
//! value and repeated keys survive the trip.
//!
//! Objects with an unrecognised tag are kept verbatim as [`WireValue::Unknown`]
//! and re-emitted unchanged, so a payload from a newer sender survives a trip
//! through an older receiver.

use std::fmt;

use ahash::AHashSet;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de::Error as _};
use serde_json::{Map, Value as JsonValue, json};

use crate::error::{BridgeError, BridgeResult};

/// JSON key holding the tag of a tagged value.
pub const TAG_KEY: &str = "type";
/// JSON key holding the schema version of a tagged value.
pub const SCHEMA_KEY: &str = "schema";
/// Schema version written on every tagged value.
pub const SCHEMA_VERSION: u32 = 1;

const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";
const DATETIME_TZ_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f%:z";
const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S%.f";

/// A float with no JSON number representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::IntoStaticStr)]
pub enum SpecialFloat {
    #[strum(serialize = "infinity")]
    Infinity,
    #[strum(serialize = "neg_infinity")]
    NegInfinity,
    #[strum(serialize = "nan")]
    NaN,
}

impl SpecialFloat {
    /// Classifies a float, returning `None` for finite values.
    #[must_use]
    pub fn classify(value: f64) -> Option<Self> {
        if value.is_nan() {
            Some(Self::NaN)
        } else if value == f64::INFINITY {
            Some(Self::Infinity)
        } else if value == f64::NEG_INFINITY {
            Some(Self::NegInfinity)
        } else {
            None
        }
    }

    #[must_use]
    pub fn to_f64(self) -> f64 {
        match self {
            Self::Infinity => f64::INFINITY,
            Self::NegInfinity => f64::NEG_INFINITY,
            Self::NaN => f64::NAN,
        }
    }
}

/// The pull protocol behind a stream reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::IntoStaticStr)]
pub enum StreamKind {
    #[strum(serialize = "generator")]
    Generator,
    #[strum(serialize = "async_generator")]
    AsyncGenerator,
    #[strum(serialize = "iterator")]
    Iterator,
}

/// A datetime that is either timezone-naive or carries a fixed UTC offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IsoDateTime {
    Naive(NaiveDateTime),
    Aware(DateTime<FixedOffset>),
}

impl IsoDateTime {
    /// Formats as ISO-8601 with a `T` separator; fractional seconds only when non-zero.
    #[must_use]
    pub fn to_iso(&self) -> String {
        match self {
            Self::Naive(dt) => dt.format(DATETIME_FORMAT).to_string(),
            Self::Aware(dt) => dt.format(DATETIME_TZ_FORMAT).to_string(),
        }
    }

    /// Parses an ISO-8601 datetime, preferring the offset-aware form.
    #[must_use]
    pub fn parse_iso(text: &str) -> Option<Self> {
        if let Ok(dt) = DateTime::parse_from_str(text, DATETIME_TZ_FORMAT) {
            return Some(Self::Aware(dt));
        }
        if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
            return Some(Self::Aware(dt));
        }
        NaiveDateTime::parse_from_str(text, DATETIME_FORMAT)
            .ok()
            .map(Self::Naive)
    }
}

impl fmt::Display for IsoDateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_iso())
    }
}

/// Formats a date as `YYYY-MM-DD`.
#[must_use]
pub fn date_to_iso(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// Formats a time as `HH:MM:SS[.fff]`.
#[must_use]
pub fn time_to_iso(time: NaiveTime) -> String {
    time.format(TIME_FORMAT).to_string()
}

/// Non-owning marker for a live value held in the handle table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RefMarker {
    pub id: String,
    pub session_id: String,
    /// Runtime type name of the referenced value (e.g. `"list"`, `"Pattern"`).
    pub type_name: String,
    /// Module of the call that produced the value.
    pub source_module: String,
    /// Library of the call that produced the value.
    pub source_library: String,
}

/// Non-owning marker for a single-consumer pull sequence held in the handle table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamRef {
    pub id: String,
    pub session_id: String,
    pub stream_kind: StreamKind,
}

/// A callable living on the far side of the boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallbackMarker {
    pub id: String,
    /// Expected positional argument count, when the far side declared one.
    pub arity: Option<usize>,
}

/// A value in its wire shape.
///
/// Conversions: [`WireValue::to_json`] / [`WireValue::from_json`], or serde, which
/// goes through the same JSON form.
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    Null,
    Bool(bool),
    Int(i64),
    /// A finite float. Non-finite values belong in [`WireValue::SpecialFloat`];
    /// use [`WireValue::float`] to get the right variant.
    Float(f64),
    SpecialFloat(SpecialFloat),
    String(String),
    Bytes(Vec<u8>),
    Complex {
        re: f64,
        im: f64,
    },
    DateTime(IsoDateTime),
    Date(NaiveDate),
    Time(NaiveTime),
    Atom(String),
    Tuple(Vec<Self>),
    /// Elements in canonical order (see [`WireValue::canonical_sort`]).
    Set(Vec<Self>),
    FrozenSet(Vec<Self>),
    List(Vec<Self>),
    /// Insertion-ordered key/value pairs.
    Map(Vec<(Self, Self)>),
    Reference(RefMarker),
    StreamReference(StreamRef),
    Callback(CallbackMarker),
    /// A tagged object whose tag this build does not know, kept verbatim.
    Unknown(Map<String, JsonValue>),
}

impl WireValue {
    /// Wraps a float, routing non-finite values to [`WireValue::SpecialFloat`].
    #[must_use]
    pub fn float(value: f64) -> Self {
        match SpecialFloat::classify(value) {
            Some(special) => Self::SpecialFloat(special),
            None => Self::Float(value),
        }
    }

    /// Creates a string-keyed map from `(key, value)` pairs.
    pub fn string_map<K: Into<String>>(pairs: impl IntoIterator<Item = (K, Self)>) -> Self {
        Self::Map(pairs.into_iter().map(|(k, v)| (Self::String(k.into()), v)).collect())
    }

    /// Returns the wire tag of this value, or `None` for untagged shapes.
    #[must_use]
    pub fn tag(&self) -> Option<&str> {
        match self {
            Self::Null | Self::Bool(_) | Self::Int(_) | Self::Float(_) | Self::String(_) | Self::List(_) => None,
            Self::Map(pairs) => (!is_plain_string_map(pairs)).then_some("dict"),
            Self::SpecialFloat(_) => Some("special_float"),
            Self::Bytes(_) => Some("bytes"),
            Self::Complex { .. } => Some("complex"),
            Self::DateTime(_) => Some("datetime"),
            Self::Date(_) => Some("date"),
            Self::Time(_) => Some("time"),
            Self::Atom(_) => Some("atom"),
            Self::Tuple(_) => Some("tuple"),
            Self::Set(_) => Some("set"),
            Self::FrozenSet(_) => Some("frozenset"),
            Self::Reference(_) => Some("ref"),
            Self::StreamReference(_) => Some("stream_ref"),
            Self::Callback(_) => Some("callback"),
            Self::Unknown(fields) => fields.get(TAG_KEY).and_then(JsonValue::as_str),
        }
    }

    #[must_use]
    pub fn as_reference(&self) -> Option<&RefMarker> {
        match self {
            Self::Reference(marker) => Some(marker),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_stream_reference(&self) -> Option<&StreamRef> {
        match self {
            Self::StreamReference(marker) => Some(marker),
            _ => None,
        }
    }

    /// Looks up a string key in a map value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Self> {
        match self {
            Self::Map(pairs) => pairs
                .iter()
                .find(|(k, _)| matches!(k, Self::String(s) if s == key))
                .map(|(_, v)| v),
            _ => None,
        }
    }

    /// Compact JSON text of this value; the total order used for set elements.
    #[must_use]
    pub fn canonical_key(&self) -> String {
        self.to_json().to_string()
    }

    /// Sorts set elements into their canonical, deterministic order.
    ///
    /// The sort is stable and keyed by [`WireValue::canonical_key`], so equal sets
    /// always serialize to identical bytes.
    pub fn canonical_sort(elements: &mut [Self]) {
        elements.sort_by_cached_key(Self::canonical_key);
    }

    /// Converts to the JSON wire form.
    #[must_use]
    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Null => JsonValue::Null,
            Self::Bool(b) => JsonValue::Bool(*b),
            Self::Int(i) => json!(i),
            Self::Float(f) => float_to_json(*f),
            Self::SpecialFloat(special) => tagged("special_float", [("value", json!(special.to_string()))]),
            Self::String(s) => JsonValue::String(s.clone()),
            Self::Bytes(bytes) => tagged("bytes", [("data", json!(BASE64.encode(bytes)))]),
            Self::Complex { re, im } => tagged("complex", [("real", float_to_json(*re)), ("imag", float_to_json(*im))]),
            Self::DateTime(dt) => tagged("datetime", [("value", json!(dt.to_iso()))]),
            Self::Date(date) => tagged("date", [("value", json!(date_to_iso(*date)))]),
            Self::Time(time) => tagged("time", [("value", json!(time_to_iso(*time)))]),
            Self::Atom(name) => tagged("atom", [("value", json!(name))]),
            Self::Tuple(items) => tagged("tuple", [("elements", json_array(items))]),
            Self::Set(items) => tagged("set", [("elements", json_array(items))]),
            Self::FrozenSet(items) => tagged("frozenset", [("elements", json_array(items))]),
            Self::List(items) => json_array(items),
            Self::Map(pairs) => {
                if is_plain_string_map(pairs) {
                    let map: Map<String, JsonValue> = pairs
                        .iter()
                        .filter_map(|(k, v)| match k {
                            Self::String(key) => Some((key.clone(), v.to_json())),
                            _ => None,
                        })
                        .collect();
                    JsonValue::Object(map)
                } else {
                    let pairs: Vec<JsonValue> = pairs
                        .iter()
                        .map(|(k, v)| JsonValue::Array(vec![k.to_json(), v.to_json()]))
                        .collect();
                    tagged("dict", [("pairs", JsonValue::Array(pairs))])
                }
            }
            Self::Reference(marker) => tagged(
                "ref",
                [
                    ("id", json!(marker.id)),
                    ("session_id", json!(marker.session_id)),
                    ("type_name", json!(marker.type_name)),
                    ("source_module", json!(marker.source_module)),
                    ("source_library", json!(marker.source_library)),
                ],
            ),
            Self::StreamReference(marker) => tagged(
                "stream_ref",
                [
                    ("id", json!(marker.id)),
                    ("session_id", json!(marker.session_id)),
                    ("stream_type", json!(marker.stream_kind.to_string())),
                ],
            ),
            Self::Callback(marker) => tagged("callback", [("id", json!(marker.id)), ("arity", json!(marker.arity))]),
            Self::Unknown(fields) => JsonValue::Object(fields.clone()),
        }
    }

    /// Parses the JSON wire form.
    ///
    /// Fails with `MalformedEnvelope` when a known tag is missing a required
    /// field or a field has the wrong shape. Unknown tags never fail.
    pub fn from_json(value: JsonValue) -> BridgeResult<Self> {
        match value {
            JsonValue::Null => Ok(Self::Null),
            JsonValue::Bool(b) => Ok(Self::Bool(b)),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Self::Int(i))
                } else if let Some(f) = n.as_f64() {
                    // u64 beyond i64 lands here too; JSON gives us no better option
                    Ok(Self::Float(f))
                } else {
                    Err(BridgeError::malformed(format_args!("unrepresentable number {n}")))
                }
            }
            JsonValue::String(s) => Ok(Self::String(s)),
            JsonValue::Array(items) => Ok(Self::List(parse_elements(items)?)),
            JsonValue::Object(map) => {
                if let Some(JsonValue::String(tag)) = map.get(TAG_KEY) {
                    let tag = tag.clone();
                    Self::from_tagged(&tag, map)
                } else {
                    let pairs = map
                        .into_iter()
                        .map(|(k, v)| Ok((Self::String(k), Self::from_json(v)?)))
                        .collect::<BridgeResult<Vec<_>>>()?;
                    Ok(Self::Map(pairs))
                }
            }
        }
    }

    fn from_tagged(tag: &str, mut map: Map<String, JsonValue>) -> BridgeResult<Self> {
        let value = match tag {
            "special_float" => {
                let name = take_str(&mut map, tag, "value")?;
                let special = name
                    .parse::<SpecialFloat>()
                    .map_err(|_| BridgeError::malformed(format_args!("special_float: unknown value {name:?}")))?;
                Self::SpecialFloat(special)
            }
            "infinity" => Self::SpecialFloat(SpecialFloat::Infinity),
            "neg_infinity" => Self::SpecialFloat(SpecialFloat::NegInfinity),
            "nan" => Self::SpecialFloat(SpecialFloat::NaN),
            "bytes" => {
                let data = match map.remove("data") {
                    Some(data) => data,
                    None => take(&mut map, tag, "value")?,
                };
                let JsonValue::String(encoded) = data else {
                    return Err(field_error(tag, "data", "a base64 string"));
                };
                let bytes = BASE64
                    .decode(encoded.as_bytes())
                    .map_err(|err| BridgeError::malformed(format_args!("bytes: invalid base64: {err}")))?;
                Self::Bytes(bytes)
            }
            "complex" => {
                let re = float_from_json(take(&mut map, tag, "real")?, tag, "real")?;
                let im = float_from_json(take(&mut map, tag, "imag")?, tag, "imag")?;
                Self::Complex { re, im }
            }
            "datetime" => {
                let text = take_str(&mut map, tag, "value")?;
                let dt = IsoDateTime::parse_iso(&text)
                    .ok_or_else(|| BridgeError::malformed(format_args!("datetime: invalid ISO-8601 {text:?}")))?;
                Self::DateTime(dt)
            }
            "date" => {
                let text = take_str(&mut map, tag, "value")?;
                let date = NaiveDate::parse_from_str(&text, DATE_FORMAT)
                    .map_err(|err| BridgeError::malformed(format_args!("date: invalid ISO-8601 {text:?}: {err}")))?;
                Self::Date(date)
            }
            "time" => {
                let text = take_str(&mut map, tag, "value")?;
                let time = NaiveTime::parse_from_str(&text, TIME_FORMAT)
                    .map_err(|err| BridgeError::malformed(format_args!("time: invalid ISO-8601 {text:?}: {err}")))?;
                Self::Time(time)
            }
            "atom" => Self::Atom(take_str(&mut map, tag, "value")?),
            "tuple" => Self::Tuple(take_elements(&mut map, tag)?),
            "set" => Self::Set(take_elements(&mut map, tag)?),
            "frozenset" => Self::FrozenSet(take_elements(&mut map, tag)?),
            "dict" => {
                let JsonValue::Array(raw_pairs) = take(&mut map, tag, "pairs")? else {
                    return Err(field_error(tag, "pairs", "an array"));
                };
                let pairs = raw_pairs
                    .into_iter()
                    .map(|pair| match pair {
                        JsonValue::Array(kv) if kv.len() == 2 => {
                            let mut kv = kv.into_iter();
                            let key = Self::from_json(kv.next().unwrap_or(JsonValue::Null))?;
                            let value = Self::from_json(kv.next().unwrap_or(JsonValue::Null))?;
                            Ok((key, value))
                        }
                        _ => Err(field_error(tag, "pairs", "an array of [key, value] pairs")),
                    })
                    .collect::<BridgeResult<Vec<_>>>()?;
                Self::Map(pairs)
            }
            "ref" => Self::Reference(RefMarker {
                id: take_str(&mut map, tag, "id")?,
                session_id: take_str(&mut map, tag, "session_id")?,
                type_name: take_opt_str(&mut map, &["type_name"]),
                source_module: take_opt_str(&mut map, &["source_module", "python_module"]),
                source_library: take_opt_str(&mut map, &["source_library", "library"]),
            }),
            "stream_ref" => {
                let id = take_str(&mut map, tag, "id")?;
                let session_id = take_str(&mut map, tag, "session_id")?;
                let kind_name = take_str(&mut map, tag, "stream_type")?;
                let stream_kind = kind_name
                    .parse::<StreamKind>()
                    .map_err(|_| BridgeError::malformed(format_args!("stream_ref: unknown stream_type {kind_name:?}")))?;
                Self::StreamReference(StreamRef {
                    id,
                    session_id,
                    stream_kind,
                })
            }
            "callback" => {
                let id = ["id", "callback_id", "ref_id"]
                    .iter()
                    .find_map(|key| match map.remove(*key) {
                        Some(JsonValue::String(id)) => Some(id),
                        Some(JsonValue::Number(n)) => Some(n.to_string()),
                        _ => None,
                    })
                    .ok_or_else(|| field_error(tag, "id", "a string"))?;
                let arity = match map.remove("arity") {
                    None | Some(JsonValue::Null) => None,
                    Some(JsonValue::Number(n)) => Some(
                        n.as_u64()
                            .and_then(|a| usize::try_from(a).ok())
                            .ok_or_else(|| field_error(tag, "arity", "a non-negative integer"))?,
                    ),
                    Some(_) => return Err(field_error(tag, "arity", "a non-negative integer")),
                };
                Self::Callback(CallbackMarker { id, arity })
            }
            _ => Self::Unknown(map),
        };
        Ok(value)
    }
}

impl fmt::Display for WireValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl Serialize for WireValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for WireValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = JsonValue::deserialize(deserializer)?;
        Self::from_json(json).map_err(|err| match err {
            // serde_json re-wraps this as MalformedEnvelope on the way out
            BridgeError::MalformedEnvelope(msg) => D::Error::custom(msg),
            other => D::Error::custom(other),
        })
    }
}

impl From<RefMarker> for WireValue {
    fn from(marker: RefMarker) -> Self {
        Self::Reference(marker)
    }
}

impl From<StreamRef> for WireValue {
    fn from(marker: StreamRef) -> Self {
        Self::StreamReference(marker)
    }
}

/// A map is emitted natively only if every key is a string and none collides
/// with the tag key.
fn is_plain_string_map(pairs: &[(WireValue, WireValue)]) -> bool {
    let mut seen = AHashSet::with_capacity(pairs.len());
    pairs
        .iter()
        .all(|(k, _)| matches!(k, WireValue::String(key) if key != TAG_KEY && seen.insert(key.as_str())))
}

fn tagged<const N: usize>(tag: &str, fields: [(&str, JsonValue); N]) -> JsonValue {
    let mut map = Map::with_capacity(N + 2);
    map.insert(TAG_KEY.to_owned(), json!(tag));
    map.insert(SCHEMA_KEY.to_owned(), json!(SCHEMA_VERSION));
    for (key, value) in fields {
        map.insert(key.to_owned(), value);
    }
    JsonValue::Object(map)
}

fn json_array(items: &[WireValue]) -> JsonValue {
    JsonValue::Array(items.iter().map(WireValue::to_json).collect())
}

fn float_to_json(value: f64) -> JsonValue {
    match SpecialFloat::classify(value) {
        Some(special) => WireValue::SpecialFloat(special).to_json(),
        None => json!(value),
    }
}

fn float_from_json(value: JsonValue, tag: &str, field: &str) -> BridgeResult<f64> {
    match WireValue::from_json(value)? {
        WireValue::Float(f) => Ok(f),
        WireValue::Int(i) => Ok(i as f64),
        WireValue::SpecialFloat(special) => Ok(special.to_f64()),
        _ => Err(field_error(tag, field, "a number")),
    }
}

fn parse_elements(items: Vec<JsonValue>) -> BridgeResult<Vec<WireValue>> {
    items.into_iter().map(WireValue::from_json).collect()
}

fn take_elements(map: &mut Map<String, JsonValue>, tag: &str) -> BridgeResult<Vec<WireValue>> {
    let raw = match map.remove("elements") {
        Some(raw) => raw,
        None => take(map, tag, "value")?,
    };
    match raw {
        JsonValue::Array(items) => parse_elements(items),
        _ => Err(field_error(tag, "elements", "an array")),
    }
}

fn take(map: &mut Map<String, JsonValue>, tag: &str, field: &str) -> BridgeResult<JsonValue> {
    map.remove(field)
        .ok_or_else(|| BridgeError::malformed(format_args!("{tag}: missing field {field:?}")))
}

fn take_str(map: &mut Map<String, JsonValue>, tag: &str, field: &str) -> BridgeResult<String> {
    match take(map, tag, field)? {
        JsonValue::String(s) => Ok(s),
        _ => Err(field_error(tag, field, "a string")),
    }
}

/// Takes the first present string field among `keys`, or an empty string.
fn take_opt_str(map: &mut Map<String, JsonValue>, keys: &[&str]) -> String {
    keys.iter()
        .find_map(|key| match map.remove(*key) {
            Some(JsonValue::String(s)) => Some(s),
            _ => None,
        })
        .unwrap_or_default()
}

fn field_error(tag: &str, field: &str, expected: &str) -> BridgeError {
    BridgeError::malformed(format_args!("{tag}: field {field:?} must be {expected}"))
}
