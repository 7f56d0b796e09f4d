use ahash::AHashSet;

use crate::{
    config::CodecLimits,
    handle::HandleTable,
    identity::{IdentityTracker, Visit},
    value::{Value, read},
    wire::{RefMarker, StreamKind, StreamRef, WireValue},
};

use super::Origin;

/// The depth ceiling was hit; unwinds to the top-level encode.
#[derive(Debug)]
pub(crate) struct EncodeOverflow;

/// Handles minted by one encode attempt.
///
/// Releases all of them on drop unless committed, so an attempt that is
/// abandoned (overflow or unwinding panic) leaves nothing behind. Until then
/// the ids are pinned against capacity eviction by the attempt's own stores.
struct MintLog<'a> {
    table: &'a HandleTable,
    session_id: &'a str,
    ids: AHashSet<String>,
    committed: bool,
}

impl<'a> MintLog<'a> {
    fn new(table: &'a HandleTable, session_id: &'a str) -> Self {
        Self {
            table,
            session_id,
            ids: AHashSet::new(),
            committed: false,
        }
    }

    fn record(&mut self, id: String) {
        self.ids.insert(id);
    }

    fn commit(&mut self) {
        self.committed = true;
    }

    fn rollback(&mut self) -> usize {
        let count = self.ids.len();
        for id in self.ids.drain() {
            self.table.release(self.session_id, &id);
        }
        count
    }
}

impl Drop for MintLog<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.rollback();
        }
    }
}

struct Encoder<'a> {
    table: &'a HandleTable,
    origin: &'a Origin,
    ceiling: usize,
    depth: usize,
    tracker: IdentityTracker,
    minted: MintLog<'a>,
}

pub(super) fn encode_value(table: &HandleTable, limits: CodecLimits, value: &Value, origin: &Origin) -> WireValue {
    let mut encoder = Encoder {
        table,
        origin,
        ceiling: limits.depth_ceiling,
        depth: 0,
        tracker: IdentityTracker::new(),
        minted: MintLog::new(table, &origin.session_id),
    };

    match encoder.encode(value) {
        Ok(wire) => {
            encoder.minted.commit();
            wire
        }
        Err(EncodeOverflow) => {
            let discarded = encoder.minted.rollback();
            drop(encoder);
            tracing::warn!(
                session_id = %origin.session_id,
                type_name = value.type_name(),
                ceiling = limits.depth_ceiling,
                discarded,
                "encode exceeded depth ceiling, falling back to a reference"
            );
            let id = table.store(&origin.session_id, value.clone());
            reference_marker(id, value, origin)
        }
    }
}

fn reference_marker(id: String, value: &Value, origin: &Origin) -> WireValue {
    WireValue::Reference(RefMarker {
        id,
        session_id: origin.session_id.clone(),
        type_name: value.type_name().to_owned(),
        source_module: origin.module.clone(),
        source_library: origin.library.clone(),
    })
}

impl Encoder<'_> {
    fn encode(&mut self, value: &Value) -> Result<WireValue, EncodeOverflow> {
        let wire = match value {
            Value::None => WireValue::Null,
            Value::Bool(b) => WireValue::Bool(*b),
            Value::Int(i) => WireValue::Int(*i),
            Value::Float(f) => WireValue::float(*f),
            Value::Str(s) => WireValue::String(s.clone()),
            Value::Bytes(bytes) => WireValue::Bytes(bytes.clone()),
            Value::Complex(c) => WireValue::Complex { re: c.re, im: c.im },
            Value::DateTime(dt) => WireValue::DateTime(*dt),
            Value::Date(date) => WireValue::Date(*date),
            Value::Time(time) => WireValue::Time(*time),
            Value::Atom(name) => WireValue::Atom(name.clone()),
            Value::Tuple(items) => self.container(value, |enc| Ok(WireValue::Tuple(enc.sequence(items)?)))?,
            Value::FrozenSet(items) => self.container(value, |enc| {
                let mut elements = enc.sequence(items)?;
                WireValue::canonical_sort(&mut elements);
                Ok(WireValue::FrozenSet(elements))
            })?,
            Value::List(items) => self.container(value, |enc| {
                let snapshot = read(items).clone();
                Ok(WireValue::List(enc.sequence(&snapshot)?))
            })?,
            Value::Set(items) => self.container(value, |enc| {
                let snapshot = read(items).clone();
                let mut elements = enc.sequence(&snapshot)?;
                WireValue::canonical_sort(&mut elements);
                Ok(WireValue::Set(elements))
            })?,
            Value::Dict(pairs) => self.container(value, |enc| {
                let snapshot = read(pairs).clone();
                let mut encoded = Vec::with_capacity(snapshot.len());
                for (k, v) in &snapshot {
                    encoded.push((enc.encode(k)?, enc.encode(v)?));
                }
                Ok(WireValue::Map(encoded))
            })?,
            Value::Stream(stream) if !stream.is_context_manager() => self.live(value, Some(stream.kind())),
            Value::Function(function) => match function.as_callback() {
                Some(marker) => WireValue::Callback(marker.clone()),
                None => self.live(value, None),
            },
            Value::Object(_) | Value::Stream(_) | Value::AsyncStream(_) => self.live(value, None),
        };
        Ok(wire)
    }

    fn sequence(&mut self, items: &[Value]) -> Result<Vec<WireValue>, EncodeOverflow> {
        items.iter().map(|item| self.encode(item)).collect()
    }

    /// Encodes a container, consulting the memo before cycle detection.
    fn container(
        &mut self,
        value: &Value,
        body: impl FnOnce(&mut Self) -> Result<WireValue, EncodeOverflow>,
    ) -> Result<WireValue, EncodeOverflow> {
        let Some(identity) = value.identity() else {
            return body(self);
        };
        if let Some(marker) = self.tracker.memo_id(identity) {
            return Ok(marker.clone());
        }
        if self.tracker.visit(identity) == Visit::AlreadyVisiting {
            // back-edge: the container stays shaped above, referenced here
            return Ok(self.live(value, None));
        }
        if self.depth >= self.ceiling {
            return Err(EncodeOverflow);
        }
        self.depth += 1;
        let result = body(self);
        self.depth -= 1;
        self.tracker.leave(identity);
        result
    }

    /// Parks a live value in the table, once per identity per encode.
    fn live(&mut self, value: &Value, stream_kind: Option<StreamKind>) -> WireValue {
        let identity = value.identity();
        if let Some(marker) = identity.and_then(|identity| self.tracker.memo_id(identity)) {
            return marker.clone();
        }

        let id = self
            .table
            .store_pinned(&self.origin.session_id, value.clone(), &self.minted.ids);
        self.minted.record(id.clone());
        let marker = match stream_kind {
            Some(stream_kind) => WireValue::StreamReference(StreamRef {
                id,
                session_id: self.origin.session_id.clone(),
                stream_kind,
            }),
            None => reference_marker(id, value, self.origin),
        };
        if let Some(identity) = identity {
            self.tracker.remember(identity, value.clone(), marker.clone());
        }
        marker
    }
}
