//! Unit tests for payload transformers.

use rstest::rstest;
use serde_json::{Value, json};

use super::*;

#[rstest]
#[case::null(Value::Null)]
#[case::number(json!(42))]
#[case::nested(json!({"user": {"name": "Ada", "tags": ["a", "b"]}}))]
fn identity_passes_values_through(#[case] value: Value) {
    let transformer = IdentityTransformer;
    let wire = transformer.serialize(value.clone()).expect("serialise");
    assert_eq!(wire, value);
    assert_eq!(transformer.deserialize(wire).expect("deserialise"), value);
}

#[test]
fn envelope_wraps_with_version() {
    let wire = EnvelopeTransformer.serialize(json!("hi")).expect("serialise");
    assert_eq!(wire, json!({"json": "hi", "meta": {"v": 1}}));
}

#[test]
fn envelope_round_trips_null() {
    let wire = EnvelopeTransformer.serialize(Value::Null).expect("serialise");
    assert_eq!(EnvelopeTransformer.deserialize(wire).expect("deserialise"), Value::Null);
}

#[test]
fn envelope_rejects_bare_values() {
    let error = EnvelopeTransformer
        .deserialize(json!("raw"))
        .expect_err("bare values are rejected");
    assert!(matches!(error, TransformError::MissingField { field: "json" }));
}

#[test]
fn envelope_rejects_missing_meta() {
    let error = EnvelopeTransformer
        .deserialize(json!({"json": 1}))
        .expect_err("meta is required");
    assert!(matches!(error, TransformError::MissingField { field: "meta" }));
}

#[test]
fn envelope_rejects_other_versions() {
    let error = EnvelopeTransformer
        .deserialize(json!({"json": 1, "meta": {"v": 2}}))
        .expect_err("version 2 is unknown");
    assert_eq!(error.to_string(), "unsupported transformer version: 2");
}
