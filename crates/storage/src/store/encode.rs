#![forbid(unsafe_code)]

use gm_core::{EntityIdentity, Scalar, StoreError};
use std::collections::BTreeMap;

// Canonical row key: the JSON encoding of the ordered identity components.
// Component order comes from the schema, so equal identities always encode to
// the same string.
pub(crate) fn ident_key(identity: &EntityIdentity) -> Result<String, StoreError> {
    serde_json::to_string(identity.components()).map_err(json_err)
}

pub(crate) fn fields_to_json(fields: &BTreeMap<String, Scalar>) -> Result<String, StoreError> {
    serde_json::to_string(fields).map_err(json_err)
}

pub(crate) fn fields_from_json(raw: &str) -> Result<BTreeMap<String, Scalar>, StoreError> {
    serde_json::from_str(raw).map_err(json_err)
}

pub(crate) fn json_err(err: serde_json::Error) -> StoreError {
    StoreError::Backend(Box::new(err))
}

pub(crate) fn sql_err(err: rusqlite::Error) -> StoreError {
    StoreError::Backend(Box::new(err))
}

// Single-column integer keys participate in counter-based generation; the
// counter floor keeps generated keys above any explicitly written one.
pub(crate) fn key_floor(key: &[String], fields: &BTreeMap<String, Scalar>) -> Option<i64> {
    match key {
        [only] => match fields.get(only) {
            Some(Scalar::Int(value)) => Some(*value),
            _ => None,
        },
        _ => None,
    }
}
