//! Tests for the JSON wire form of `WireValue`.

use chrono::{NaiveDate, NaiveTime};
use pretty_assertions::assert_eq;
use refbridge::{
    BridgeError, CallbackMarker, IsoDateTime, RefMarker, SpecialFloat, StreamKind, StreamRef, WireValue,
};
use serde_json::json;

fn parse(json: serde_json::Value) -> WireValue {
    WireValue::from_json(json).unwrap()
}

fn parse_err(json: serde_json::Value) -> String {
    match WireValue::from_json(json) {
        Err(BridgeError::MalformedEnvelope(msg)) => msg,
        other => panic!("expected MalformedEnvelope, got {other:?}"),
    }
}

// =============================================================================
// Emitted shapes
// =============================================================================

#[test]
fn special_floats() {
    assert_eq!(WireValue::float(1.25), WireValue::Float(1.25));
    assert_eq!(WireValue::float(f64::NEG_INFINITY), WireValue::SpecialFloat(SpecialFloat::NegInfinity));
    assert_eq!(
        WireValue::float(f64::INFINITY).to_json(),
        json!({"type": "special_float", "schema": 1, "value": "infinity"})
    );
    // a non-finite value smuggled into Float is still emitted tagged
    assert_eq!(
        WireValue::Float(f64::NAN).to_json(),
        json!({"type": "special_float", "schema": 1, "value": "nan"})
    );
}

#[test]
fn bytes_are_base64() {
    let wire = WireValue::Bytes(b"hello".to_vec());
    assert_eq!(wire.to_json(), json!({"type": "bytes", "schema": 1, "data": "aGVsbG8="}));
    assert_eq!(parse(wire.to_json()), wire);
}

#[test]
fn temporal_values_are_iso8601() {
    let naive = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap().and_hms_opt(3, 4, 5).unwrap();
    let wire = WireValue::DateTime(IsoDateTime::Naive(naive));
    assert_eq!(wire.to_json()["value"], json!("2024-01-02T03:04:05"));

    let aware = parse(json!({"type": "datetime", "schema": 1, "value": "2024-01-02T03:04:05+02:00"}));
    let WireValue::DateTime(IsoDateTime::Aware(dt)) = &aware else {
        panic!("offset must be kept, got {aware:?}");
    };
    assert_eq!(dt.offset().local_minus_utc(), 7200);
    assert_eq!(aware.to_json()["value"], json!("2024-01-02T03:04:05+02:00"));

    let zulu = parse(json!({"type": "datetime", "schema": 1, "value": "2024-01-02T03:04:05Z"}));
    assert!(matches!(zulu, WireValue::DateTime(IsoDateTime::Aware(_))));

    let date = WireValue::Date(NaiveDate::from_ymd_opt(2020, 2, 29).unwrap());
    assert_eq!(date.to_json(), json!({"type": "date", "schema": 1, "value": "2020-02-29"}));

    let time = WireValue::Time(NaiveTime::from_hms_micro_opt(12, 0, 1, 500).unwrap());
    assert_eq!(parse(time.to_json()), time);
}

#[test]
fn containers() {
    let tuple = WireValue::Tuple(vec![WireValue::Int(1), WireValue::Null]);
    assert_eq!(tuple.to_json(), json!({"type": "tuple", "schema": 1, "elements": [1, null]}));

    let list = WireValue::List(vec![tuple.clone(), WireValue::Bool(true)]);
    assert_eq!(
        list.to_json(),
        json!([{"type": "tuple", "schema": 1, "elements": [1, null]}, true])
    );
    assert_eq!(parse(list.to_json()), list);
}

#[test]
fn string_keyed_maps_are_native_objects() {
    let map = WireValue::string_map([("b", WireValue::Int(2)), ("a", WireValue::Int(1))]);
    assert_eq!(map.to_json(), json!({"b": 2, "a": 1}));
    assert_eq!(map.tag(), None);
    assert_eq!(map.get("a"), Some(&WireValue::Int(1)));
    assert_eq!(map.to_json().to_string(), r#"{"b":2,"a":1}"#, "insertion order is kept");
}

#[test]
fn non_string_keys_use_pair_form() {
    let map = WireValue::Map(vec![(WireValue::Int(1), WireValue::String("one".to_owned()))]);
    assert_eq!(map.to_json(), json!({"type": "dict", "schema": 1, "pairs": [[1, "one"]]}));
    assert_eq!(parse(map.to_json()), map);
}

#[test]
fn map_with_tag_key_uses_pair_form() {
    let map = WireValue::string_map([("type", WireValue::String("user data".to_owned()))]);
    let json = map.to_json();
    assert_eq!(json["type"], json!("dict"));
    assert_eq!(json["pairs"], json!([["type", "user data"]]));
    assert_eq!(parse(json), map);
}

#[test]
fn repeated_keys_use_pair_form() {
    let map = WireValue::string_map([("k", WireValue::Int(1)), ("k", WireValue::Int(2))]);
    let json = map.to_json();
    assert_eq!(json, json!({"type": "dict", "schema": 1, "pairs": [["k", 1], ["k", 2]]}));
    assert_eq!(parse(json), map);
}

#[test]
fn sets_sort_canonically() {
    let mut elements = vec![
        WireValue::Int(3),
        WireValue::String("a".to_owned()),
        WireValue::Int(1),
        WireValue::Null,
    ];
    WireValue::canonical_sort(&mut elements);
    let set = WireValue::Set(elements);
    assert_eq!(set.to_json()["elements"], json!(["a", 1, 3, null]));
}

#[test]
fn markers() {
    let reference = WireValue::Reference(RefMarker {
        id: "abc".to_owned(),
        session_id: "s1".to_owned(),
        type_name: "Pattern".to_owned(),
        source_module: "re".to_owned(),
        source_library: "stdlib".to_owned(),
    });
    assert_eq!(
        reference.to_json(),
        json!({
            "type": "ref",
            "schema": 1,
            "id": "abc",
            "session_id": "s1",
            "type_name": "Pattern",
            "source_module": "re",
            "source_library": "stdlib",
        })
    );
    assert_eq!(parse(reference.to_json()), reference);

    let stream = WireValue::StreamReference(StreamRef {
        id: "def".to_owned(),
        session_id: "s1".to_owned(),
        stream_kind: StreamKind::AsyncGenerator,
    });
    assert_eq!(stream.to_json()["stream_type"], json!("async_generator"));
    assert_eq!(parse(stream.to_json()), stream);

    let callback = WireValue::Callback(CallbackMarker {
        id: "cb".to_owned(),
        arity: Some(2),
    });
    assert_eq!(callback.to_json(), json!({"type": "callback", "schema": 1, "id": "cb", "arity": 2}));
    assert_eq!(parse(callback.to_json()), callback);
}

// =============================================================================
// Decoding leniency and strictness
// =============================================================================

#[test]
fn legacy_spellings_are_accepted() {
    assert_eq!(parse(json!({"type": "infinity"})), WireValue::SpecialFloat(SpecialFloat::Infinity));
    assert_eq!(
        parse(json!({"type": "tuple", "value": [1]})),
        WireValue::Tuple(vec![WireValue::Int(1)])
    );
    assert_eq!(
        parse(json!({"type": "bytes", "value": "AA=="})),
        WireValue::Bytes(vec![0])
    );
    assert_eq!(
        parse(json!({"type": "callback", "callback_id": "x"})),
        WireValue::Callback(CallbackMarker {
            id: "x".to_owned(),
            arity: None
        })
    );
    let WireValue::Reference(marker) = parse(json!({
        "type": "ref", "id": "r", "session_id": "s", "python_module": "m", "library": "l"
    })) else {
        panic!("expected a reference");
    };
    assert_eq!((marker.source_module.as_str(), marker.source_library.as_str()), ("m", "l"));
    assert_eq!(marker.type_name, "");
}

#[test]
fn unknown_tags_survive_verbatim() {
    let json = json!({"type": "matrix", "schema": 7, "rows": [[1, 2]], "meta": {"x": null}});
    let wire = parse(json.clone());
    assert!(matches!(wire, WireValue::Unknown(_)));
    assert_eq!(wire.tag(), Some("matrix"));
    assert_eq!(wire.to_json().to_string(), json.to_string());
}

#[test]
fn malformed_known_tags_name_the_problem() {
    assert!(parse_err(json!({"type": "bytes", "schema": 1})).contains("bytes"));
    assert!(parse_err(json!({"type": "bytes", "data": "***"})).contains("base64"));
    assert!(parse_err(json!({"type": "ref", "schema": 1, "id": "x"})).contains("session_id"));
    assert!(parse_err(json!({"type": "special_float", "value": "huge"})).contains("huge"));
    assert!(parse_err(json!({"type": "date", "value": "2024-13-40"})).contains("date"));
    assert!(parse_err(json!({"type": "dict", "pairs": [[1]]})).contains("pairs"));
    assert!(parse_err(json!({"type": "stream_ref", "id": "a", "session_id": "s", "stream_type": "pipe"})).contains("pipe"));
    assert!(parse_err(json!({"type": "callback", "id": "a", "arity": -1})).contains("arity"));
}

#[test]
fn plain_numbers() {
    assert_eq!(parse(json!(7)), WireValue::Int(7));
    assert_eq!(parse(json!(7.5)), WireValue::Float(7.5));
    assert_eq!(parse(json!(u64::MAX)), WireValue::Float(u64::MAX as f64));
}

#[test]
fn serde_goes_through_the_json_form() {
    let wire = WireValue::List(vec![
        WireValue::Complex { re: 1.0, im: f64::INFINITY },
        WireValue::FrozenSet(vec![WireValue::Atom("ok".to_owned())]),
    ]);
    let text = serde_json::to_string(&wire).unwrap();
    assert!(text.contains(r#""type":"complex""#));
    let back: WireValue = serde_json::from_str(&text).unwrap();
    assert_eq!(back, wire);

    let err = serde_json::from_str::<WireValue>(r#"{"type":"atom"}"#).unwrap_err();
    assert!(err.to_string().contains("atom"));
}
