//! Payload transformers.
//!
//! A transformer maps application values to wire values before a frame is
//! posted and back again after it is received. Both ends of a connection must
//! use the same transformer; [`IdentityTransformer`] is the default.

use std::sync::Arc;

use serde_json::{Map, Value, json};
use thiserror::Error;

/// Version tag written by [`EnvelopeTransformer`].
pub const ENVELOPE_VERSION: u64 = 1;

/// Errors raised while transforming a payload.
#[derive(Debug, Clone, Error)]
pub enum TransformError {
    /// The wire value lacks a field the transformer requires.
    #[error("transformed payload is missing the '{field}' field")]
    MissingField {
        /// Name of the absent field.
        field: &'static str,
    },
    /// The wire value was produced by an incompatible transformer version.
    #[error("unsupported transformer version: {found}")]
    UnsupportedVersion {
        /// Version found on the wire.
        found: Value,
    },
    /// A typed value could not be converted to or from JSON.
    #[error("payload conversion failed: {0}")]
    Serde(#[source] Arc<serde_json::Error>),
}

impl From<serde_json::Error> for TransformError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serde(Arc::new(error))
    }
}

/// Two-way mapping between application values and wire values.
///
/// Implementations must be deterministic and `deserialize(serialize(v))`
/// must yield `v` for every value the application sends.
pub trait Transformer: Send + Sync {
    /// Maps an application value to its wire form.
    ///
    /// # Errors
    ///
    /// Returns [`TransformError`] when the value cannot be represented.
    fn serialize(&self, value: Value) -> Result<Value, TransformError>;

    /// Maps a wire value back to its application form.
    ///
    /// # Errors
    ///
    /// Returns [`TransformError`] when the wire value is not something this
    /// transformer produced.
    fn deserialize(&self, value: Value) -> Result<Value, TransformError>;
}

/// Passes values through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityTransformer;

impl Transformer for IdentityTransformer {
    fn serialize(&self, value: Value) -> Result<Value, TransformError> {
        Ok(value)
    }

    fn deserialize(&self, value: Value) -> Result<Value, TransformError> {
        Ok(value)
    }
}

/// Wraps every value as `{"json": value, "meta": {"v": 1}}`.
///
/// The envelope makes transformed payloads self-describing, so a peer using
/// a different transformer fails loudly rather than silently misreading
/// data.
///
/// # Examples
///
/// ```
/// use portlink_protocol::{EnvelopeTransformer, Transformer};
/// use serde_json::json;
///
/// let transformer = EnvelopeTransformer;
/// let wire = transformer.serialize(json!({"a": 1}))?;
/// assert_eq!(wire, json!({"json": {"a": 1}, "meta": {"v": 1}}));
/// assert_eq!(transformer.deserialize(wire)?, json!({"a": 1}));
/// # Ok::<(), portlink_protocol::TransformError>(())
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvelopeTransformer;

impl Transformer for EnvelopeTransformer {
    fn serialize(&self, value: Value) -> Result<Value, TransformError> {
        Ok(json!({ "json": value, "meta": { "v": ENVELOPE_VERSION } }))
    }

    fn deserialize(&self, value: Value) -> Result<Value, TransformError> {
        let Value::Object(mut fields) = value else {
            return Err(TransformError::MissingField { field: "json" });
        };
        check_version(&fields)?;
        fields
            .remove("json")
            .ok_or(TransformError::MissingField { field: "json" })
    }
}

fn check_version(fields: &Map<String, Value>) -> Result<(), TransformError> {
    let version = fields
        .get("meta")
        .and_then(|meta| meta.get("v"))
        .ok_or(TransformError::MissingField { field: "meta" })?;
    if version.as_u64() == Some(ENVELOPE_VERSION) {
        Ok(())
    } else {
        Err(TransformError::UnsupportedVersion {
            found: version.clone(),
        })
    }
}

#[cfg(test)]
mod tests;
