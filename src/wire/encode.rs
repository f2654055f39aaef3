//! Serializer: in-memory values to wire JSON.

use std::collections::HashSet;

use serde_json::{json, Map, Value as Json};
use thiserror::Error;

use super::{ModelLookup, Value};
use crate::buffer::buffer_to_base64;
use crate::model::ModelId;

/// Largest integer magnitude that survives a round trip through an IEEE-754
/// double on the receiving side.
pub const MAX_SAFE_INT: i64 = (1 << 53) - 1;

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("Model '{0}' is not available for serialization")]
    UnknownModel(ModelId),

    #[error("Serialization error: {0}")]
    Custom(String),
}

/// A type that knows how to write itself to the wire through a [`Serializer`].
pub trait Serializable {
    fn to_serializable(&self, serializer: &mut Serializer<'_>) -> Result<Json, EncodeError>;
}

/// Encodes values, emitting each model's full definition once and a bare
/// back-reference everywhere else.
///
/// Ids passed through [`Serializer::with_known`] are treated as already
/// held by the receiver and are always sent as back-references. A serializer
/// without a model lookup writes every reference as `{"id": ...}`.
pub struct Serializer<'a> {
    models: Option<&'a dyn ModelLookup>,
    known: HashSet<ModelId>,
    emitted: HashSet<ModelId>,
    binary: bool,
}

impl<'a> Serializer<'a> {
    pub fn new(models: &'a dyn ModelLookup) -> Self {
        Self {
            models: Some(models),
            known: HashSet::new(),
            emitted: HashSet::new(),
            binary: true,
        }
    }

    /// A serializer that writes references as plain ids.
    pub fn detached() -> Serializer<'static> {
        Serializer {
            models: None,
            known: HashSet::new(),
            emitted: HashSet::new(),
            binary: true,
        }
    }

    pub fn with_known(mut self, known: &HashSet<ModelId>) -> Self {
        self.known = known.clone();
        self
    }

    /// When false, numeric buffers are written as plain JSON lists.
    pub fn with_binary(mut self, binary: bool) -> Self {
        self.binary = binary;
        self
    }

    /// Ids whose full definition this serializer has written.
    pub fn emitted(&self) -> &HashSet<ModelId> {
        &self.emitted
    }

    pub fn into_emitted(self) -> HashSet<ModelId> {
        self.emitted
    }

    pub fn encode_with<T: Serializable + ?Sized>(&mut self, obj: &T) -> Result<Json, EncodeError> {
        obj.to_serializable(self)
    }

    pub fn encode(&mut self, value: &Value) -> Result<Json, EncodeError> {
        Ok(match value {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => {
                if (-MAX_SAFE_INT..=MAX_SAFE_INT).contains(i) {
                    Json::from(*i)
                } else {
                    log::warn!("Integer {} is outside the safe range, encoding as float", i);
                    encode_float(*i as f64)
                }
            }
            Value::Float(f) => encode_float(*f),
            Value::String(s) => Json::String(s.clone()),
            Value::List(items) => Json::Array(self.encode_all(items.iter())?),
            Value::Set(set) => json!({
                "type": "set",
                "entries": self.encode_all(set.iter())?,
            }),
            Value::Map(map) => {
                let mut entries = Vec::with_capacity(map.len());
                for (k, v) in map.iter() {
                    entries.push(Json::Array(vec![self.encode(k)?, self.encode(v)?]));
                }
                json!({"type": "map", "entries": entries})
            }
            Value::Bytes(bytes) => json!({"type": "bytes", "data": buffer_to_base64(bytes)}),
            Value::NdArray(array) => {
                if self.binary {
                    serde_json::to_value(array.to_rep())
                        .map_err(|e| EncodeError::Custom(e.to_string()))?
                } else {
                    let scalars = array.scalars().into_iter().map(Value::from).collect::<Vec<_>>();
                    Json::Array(self.encode_all(scalars.iter())?)
                }
            }
            Value::Slice(slice) => json!({
                "type": "slice",
                "start": slice.start,
                "stop": slice.stop,
                "step": slice.step,
            }),
            Value::Ref(id) => self.encode_model(id)?,
        })
    }

    /// Encode a model reference: the full definition the first time the
    /// receiver could be missing it, a back-reference afterwards.
    pub fn encode_model(&mut self, id: &ModelId) -> Result<Json, EncodeError> {
        if self.known.contains(id) || self.emitted.contains(id) {
            return Ok(json!({"type": "object", "id": id}));
        }
        let models = match self.models {
            Some(models) => models,
            None => return Ok(json!({"id": id})),
        };
        let model = models
            .lookup(id)
            .ok_or_else(|| EncodeError::UnknownModel(id.clone()))?;

        self.emitted.insert(id.clone());
        let mut attributes = Map::new();
        for (name, value) in model.attributes() {
            attributes.insert(name.to_string(), self.encode(value)?);
        }
        Ok(json!({
            "type": "object",
            "name": model.type_name(),
            "id": id,
            "attributes": attributes,
        }))
    }

    fn encode_all<'v>(&mut self, values: impl Iterator<Item = &'v Value>) -> Result<Vec<Json>, EncodeError> {
        values.map(|v| self.encode(v)).collect()
    }
}

/// Finite floats are plain JSON numbers; anything JSON cannot hold is tagged.
fn encode_float(f: f64) -> Json {
    match serde_json::Number::from_f64(f) {
        Some(number) => Json::Number(number),
        None => {
            let value = if f.is_nan() {
                "nan"
            } else if f > 0.0 {
                "+inf"
            } else {
                "-inf"
            };
            json!({"type": "number", "value": value})
        }
    }
}
