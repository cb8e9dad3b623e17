//! Correlation identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Correlation id chosen by the caller and echoed in every response frame.
///
/// Both numeric and string ids are accepted on the wire. Ids compare by
/// variant and value, so `1` and `"1"` are distinct calls.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric id, the form produced by the link's own id counter.
    Number(i64),
    /// Caller-supplied string id.
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(value) => write!(f, "{value}"),
            Self::String(value) => write!(f, "\"{value}\""),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}
