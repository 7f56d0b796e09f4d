use std::sync::Arc;

use crate::{
    callback::CallbackStub,
    error::{BridgeError, BridgeResult},
    value::{Complex, Value},
    wire::WireValue,
};

use super::Codec;

struct Decoder<'a> {
    codec: &'a Codec,
    session_id: &'a str,
    ceiling: usize,
    depth: usize,
    atoms_as_strings: bool,
}

pub(super) fn decode_value(codec: &Codec, wire: &WireValue, session_id: &str) -> BridgeResult<Value> {
    let limits = codec.limits();
    let mut decoder = Decoder {
        codec,
        session_id,
        ceiling: limits.depth_ceiling,
        depth: 0,
        atoms_as_strings: limits.atoms_as_strings,
    };
    decoder.decode(wire)
}

impl Decoder<'_> {
    fn decode(&mut self, wire: &WireValue) -> BridgeResult<Value> {
        let value = match wire {
            WireValue::Null => Value::None,
            WireValue::Bool(b) => Value::Bool(*b),
            WireValue::Int(i) => Value::Int(*i),
            WireValue::Float(f) => Value::Float(*f),
            WireValue::SpecialFloat(special) => Value::Float(special.to_f64()),
            WireValue::String(s) => Value::Str(s.clone()),
            WireValue::Bytes(bytes) => Value::Bytes(bytes.clone()),
            WireValue::Complex { re, im } => Value::Complex(Complex::new(*re, *im)),
            WireValue::DateTime(dt) => Value::DateTime(*dt),
            WireValue::Date(date) => Value::Date(*date),
            WireValue::Time(time) => Value::Time(*time),
            WireValue::Atom(name) if self.atoms_as_strings => Value::Str(name.clone()),
            WireValue::Atom(name) => Value::Atom(name.clone()),
            WireValue::Tuple(items) => Value::tuple(self.nested(|dec| dec.sequence(items))?),
            WireValue::Set(items) => Value::set(self.nested(|dec| dec.sequence(items))?),
            WireValue::FrozenSet(items) => Value::frozenset(self.nested(|dec| dec.sequence(items))?),
            WireValue::List(items) => Value::list(self.nested(|dec| dec.sequence(items))?),
            WireValue::Map(pairs) => Value::dict(self.nested(|dec| {
                pairs
                    .iter()
                    .map(|(k, v)| Ok((dec.decode(k)?, dec.decode(v)?)))
                    .collect::<BridgeResult<Vec<_>>>()
            })?),
            WireValue::Reference(marker) => self.codec.table().resolve(self.session_id, &marker.id)?,
            WireValue::StreamReference(marker) => self.codec.table().resolve(self.session_id, &marker.id)?,
            WireValue::Callback(marker) => Value::Function(Arc::new(CallbackStub::new(
                self.codec,
                self.session_id,
                marker.clone(),
            ))),
            WireValue::Unknown(fields) => {
                tracing::debug!(tag = wire.tag().unwrap_or_default(), "decoding unknown tag field by field");
                Value::dict(self.nested(|dec| {
                    fields
                        .iter()
                        .map(|(key, field)| {
                            let field = WireValue::from_json(field.clone())?;
                            Ok((Value::Str(key.clone()), dec.decode(&field)?))
                        })
                        .collect::<BridgeResult<Vec<_>>>()
                })?)
            }
        };
        Ok(value)
    }

    fn sequence(&mut self, items: &[WireValue]) -> BridgeResult<Vec<Value>> {
        items.iter().map(|item| self.decode(item)).collect()
    }

    fn nested<T>(&mut self, body: impl FnOnce(&mut Self) -> BridgeResult<T>) -> BridgeResult<T> {
        if self.depth >= self.ceiling {
            return Err(BridgeError::malformed(format_args!(
                "nesting exceeds depth ceiling of {}",
                self.ceiling
            )));
        }
        self.depth += 1;
        let result = body(self);
        self.depth -= 1;
        result
    }
}
