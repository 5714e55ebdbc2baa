//! Contract for values kept in sync with remote documents.
//!
//! A synchronized item needs three capabilities:
//! - a stable, optional identity (the document id),
//! - a total order, which decides its position in the local cache,
//! - a serde codec to and from the document's field map.
//!
//! Identity is not part of the stored fields: it is the document's key and is
//! assigned after decoding via [`Identifiable::set_id`]. Types usually mark
//! their id field `#[serde(skip)]`.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::SyncError;
use crate::protocol::{DocumentSnapshot, Fields};

/// Stable identity of a synchronized value.
pub trait Identifiable {
    /// The document id, if this value has one yet.
    fn id(&self) -> Option<&str>;

    /// Assign the document id after decoding.
    fn set_id(&mut self, id: String);
}

/// Any value that can be stored as a single document.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> Record for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// A value kept in an ordered, identity-unique collection cache.
///
/// The order relation (`Ord`) is independent of identity.
pub trait SyncItem: Record + Identifiable + Ord {}

impl<T> SyncItem for T where T: Record + Identifiable + Ord {}

/// Encode a value as a document field map.
pub fn encode_fields<T: Serialize>(value: &T) -> Result<Fields, SyncError> {
    match serde_json::to_value(value) {
        Ok(Value::Object(fields)) => Ok(fields),
        Ok(other) => Err(SyncError::Encode(format!(
            "expected a JSON object, got {}",
            type_name(&other)
        ))),
        Err(e) => Err(SyncError::Encode(e.to_string())),
    }
}

/// Decode a single-document value.
pub fn decode_record<T: DeserializeOwned>(snapshot: &DocumentSnapshot) -> Result<T, SyncError> {
    serde_json::from_value(Value::Object(snapshot.fields.clone()))
        .map_err(|e| SyncError::Decode(format!("{}: {e}", snapshot.id)))
}

/// Decode a collection item and stamp it with the document identity.
pub fn decode_item<T: SyncItem>(snapshot: &DocumentSnapshot) -> Result<T, SyncError> {
    let mut item: T = decode_record(snapshot)?;
    item.set_id(snapshot.id.clone());
    Ok(item)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
