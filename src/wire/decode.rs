//! Deserializer: wire JSON to in-memory values.

use std::collections::HashSet;

use serde_json::{Map, Number, Value as Json};
use thiserror::Error;

use super::{ModelLookup, Slice, Value, ValueMap};
use crate::buffer::{base64_to_buffer, BufferError, NdArray, NdArrayRep};
use crate::model::{DefinitionError, Model, ModelId};
use crate::registry::TypeResolver;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Malformed wire value ({reason}): {value}")]
    Malformed { reason: String, value: Json },

    #[error("Unresolved reference to model '{0}'")]
    UnresolvedReference(ModelId),

    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("Definition error: {0}")]
    Definition(#[from] DefinitionError),
}

fn malformed(reason: impl Into<String>, value: &Json) -> DecodeError {
    DecodeError::Malformed {
        reason: reason.into(),
        value: value.clone(),
    }
}

/// Decodes one batch of wire values.
///
/// References may point forward to a model whose full definition appears
/// later in the same batch; they are checked when the batch is closed with
/// [`Deserializer::finish`], which also hands back every model the batch
/// defined.
pub struct Deserializer<'a> {
    types: &'a dyn TypeResolver,
    models: Option<&'a dyn ModelLookup>,
    known_ids: HashSet<ModelId>,
    decoded: Vec<Model>,
    decoded_ids: HashSet<ModelId>,
    pending: Vec<ModelId>,
}

impl<'a> Deserializer<'a> {
    pub fn new(types: &'a dyn TypeResolver) -> Self {
        Self {
            types,
            models: None,
            known_ids: HashSet::new(),
            decoded: Vec::new(),
            decoded_ids: HashSet::new(),
            pending: Vec::new(),
        }
    }

    /// Resolve references against models the receiver already holds.
    pub fn with_lookup(mut self, models: &'a dyn ModelLookup) -> Self {
        self.models = Some(models);
        self
    }

    /// Treat these ids as resolvable without a definition in the batch.
    pub fn with_known_ids(mut self, ids: HashSet<ModelId>) -> Self {
        self.known_ids = ids;
        self
    }

    pub fn decode(&mut self, json: &Json) -> Result<Value, DecodeError> {
        match json {
            Json::Null => Ok(Value::Null),
            Json::Bool(b) => Ok(Value::Bool(*b)),
            Json::Number(n) => Ok(decode_number(n)),
            Json::String(s) => Ok(Value::String(s.clone())),
            Json::Array(items) => self.decode_list(items).map(Value::List),
            Json::Object(obj) => self.decode_object(obj, json),
        }
    }

    /// Close the batch: every reference must now resolve.
    pub fn finish(self) -> Result<Vec<Model>, DecodeError> {
        if let Some(missing) = self.pending.iter().find(|id| !self.is_known(id)) {
            return Err(DecodeError::UnresolvedReference(missing.clone()));
        }
        Ok(self.decoded)
    }

    fn is_known(&self, id: &ModelId) -> bool {
        self.decoded_ids.contains(id)
            || self.known_ids.contains(id)
            || self.models.map_or(false, |models| models.lookup(id).is_some())
    }

    fn decode_list(&mut self, items: &[Json]) -> Result<Vec<Value>, DecodeError> {
        items.iter().map(|item| self.decode(item)).collect()
    }

    fn decode_object(&mut self, obj: &Map<String, Json>, json: &Json) -> Result<Value, DecodeError> {
        if obj.contains_key("__ndarray__") {
            let rep: NdArrayRep =
                serde_json::from_value(json.clone()).map_err(|e| malformed(e.to_string(), json))?;
            return Ok(Value::NdArray(NdArray::from_rep(&rep)?));
        }

        let tag = match obj.get("type") {
            Some(Json::String(tag)) => tag.as_str(),
            Some(_) => return Err(malformed("type tag must be a string", json)),
            None => {
                if let (1, Some(id)) = (obj.len(), obj.get("id")) {
                    return self.decode_ref(id, json);
                }
                return self.decode_plain_map(obj);
            }
        };

        match tag {
            "number" => decode_number_rep(obj, json),
            "array" => {
                let items = entries(obj, json)?;
                self.decode_list(items).map(Value::List)
            }
            "set" => {
                let items = self.decode_list(entries(obj, json)?)?;
                Ok(Value::Set(items.into_iter().collect()))
            }
            "map" => {
                let mut map = ValueMap::new();
                for entry in entries(obj, json)? {
                    match entry.as_array().map(Vec::as_slice) {
                        Some([key, value]) => {
                            let key = self.decode(key)?;
                            let value = self.decode(value)?;
                            map.insert(key, value);
                        }
                        _ => return Err(malformed("map entries must be [key, value] pairs", json)),
                    }
                }
                Ok(Value::Map(map))
            }
            "bytes" => {
                let data = obj
                    .get("data")
                    .and_then(Json::as_str)
                    .ok_or_else(|| malformed("bytes without data", json))?;
                Ok(Value::Bytes(base64_to_buffer(data)?))
            }
            "slice" => Ok(Value::Slice(Slice {
                start: slice_bound(obj, "start", json)?,
                stop: slice_bound(obj, "stop", json)?,
                step: slice_bound(obj, "step", json)?,
            })),
            "ref" => {
                let id = obj.get("id").ok_or_else(|| malformed("ref without id", json))?;
                self.decode_ref(id, json)
            }
            "object" => {
                if obj.contains_key("attributes") {
                    self.decode_full_object(obj, json)
                } else {
                    let id = obj.get("id").ok_or_else(|| malformed("object without id", json))?;
                    self.decode_ref(id, json)
                }
            }
            other => Err(malformed(format!("unknown type tag '{other}'"), json)),
        }
    }

    fn decode_plain_map(&mut self, obj: &Map<String, Json>) -> Result<Value, DecodeError> {
        let mut map = ValueMap::new();
        for (key, value) in obj {
            let value = self.decode(value)?;
            map.insert(Value::String(key.clone()), value);
        }
        Ok(Value::Map(map))
    }

    fn decode_ref(&mut self, id: &Json, json: &Json) -> Result<Value, DecodeError> {
        let id = id
            .as_str()
            .map(ModelId::from)
            .ok_or_else(|| malformed("model id must be a string", json))?;
        if !self.is_known(&id) {
            self.pending.push(id.clone());
        }
        Ok(Value::Ref(id))
    }

    fn decode_full_object(&mut self, obj: &Map<String, Json>, json: &Json) -> Result<Value, DecodeError> {
        let id = obj
            .get("id")
            .and_then(Json::as_str)
            .map(ModelId::from)
            .ok_or_else(|| malformed("object without id", json))?;
        let name = obj
            .get("name")
            .and_then(Json::as_str)
            .ok_or_else(|| malformed("object without name", json))?;

        if self.is_known(&id) {
            log::warn!("Ignoring repeated definition of model '{}'", id);
            return Ok(Value::Ref(id));
        }

        let attributes = match obj.get("attributes") {
            Some(Json::Object(attributes)) => attributes,
            _ => return Err(malformed("attributes must be an object", json)),
        };
        let descriptor = self
            .types
            .resolve_type(name)
            .ok_or_else(|| DefinitionError::UnknownType(name.to_string()))?;

        // Registered before the attributes so cycles back to this model resolve.
        self.decoded_ids.insert(id.clone());
        let mut attrs = Vec::with_capacity(attributes.len());
        for (attr, value) in attributes {
            attrs.push((attr.clone(), self.decode(value)?));
        }

        let instance = descriptor.instantiate(id.clone(), attrs)?;
        self.decoded.push(instance.model);
        for copy in instance.defaults {
            self.decoded_ids.insert(copy.id().clone());
            self.decoded.push(copy);
        }
        Ok(Value::Ref(id))
    }
}

fn decode_number(n: &Number) -> Value {
    match n.as_i64() {
        Some(i) => Value::Int(i),
        None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
    }
}

fn decode_number_rep(obj: &Map<String, Json>, json: &Json) -> Result<Value, DecodeError> {
    match obj.get("value") {
        Some(Json::String(special)) => match special.as_str() {
            "nan" => Ok(Value::Float(f64::NAN)),
            "+inf" | "inf" => Ok(Value::Float(f64::INFINITY)),
            "-inf" => Ok(Value::Float(f64::NEG_INFINITY)),
            other => Err(malformed(format!("unknown number '{other}'"), json)),
        },
        Some(Json::Number(n)) => Ok(decode_number(n)),
        _ => Err(malformed("number without value", json)),
    }
}

fn entries<'j>(obj: &'j Map<String, Json>, json: &Json) -> Result<&'j Vec<Json>, DecodeError> {
    obj.get("entries")
        .and_then(Json::as_array)
        .ok_or_else(|| malformed("missing entries", json))
}

fn slice_bound(obj: &Map<String, Json>, key: &str, json: &Json) -> Result<Option<i64>, DecodeError> {
    match obj.get(key) {
        None | Some(Json::Null) => Ok(None),
        Some(bound) => bound
            .as_i64()
            .map(Some)
            .ok_or_else(|| malformed(format!("slice {key} must be an integer"), json)),
    }
}
