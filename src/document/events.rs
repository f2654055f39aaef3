//! Change events: the vocabulary of document mutations and their wire form.

use serde_json::{json, Map, Value as Json};
use uuid::Uuid;

use crate::model::ModelId;
use crate::wire::{DecodeError, Deserializer, EncodeError, Serializable, Serializer, Slice, Value, ValueMap};

static NULL: Json = Json::Null;

/// Identity of whoever applied a mutation. Sessions stamp inbound events with
/// their own setter id so they can recognise and skip their own echoes.
pub type SetterId = Uuid;

/// Position targeted by one column patch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatchIndex {
    Index(usize),
    Slice {
        start: usize,
        stop: Option<usize>,
        step: usize,
    },
}

/// Patches per column, each a list of `(index, value)` pairs.
pub type ColumnPatches = Vec<(String, Vec<(PatchIndex, Value)>)>;

/// One atomic document mutation.
#[derive(Clone, Debug, PartialEq)]
pub enum DocumentEvent {
    ModelChanged {
        model: ModelId,
        attr: String,
        new: Value,
    },
    ColumnsPatched {
        model: ModelId,
        attr: String,
        patches: ColumnPatches,
    },
    ColumnsStreamed {
        model: ModelId,
        attr: String,
        data: ValueMap,
        rollover: Option<usize>,
    },
    RootAdded {
        model: ModelId,
    },
    RootRemoved {
        model: ModelId,
    },
    TitleChanged {
        title: String,
    },
    MessageSent {
        msg_type: String,
        msg_data: Value,
    },
}

/// An emitted event together with its document-local sequence number and
/// the setter that caused it, if any.
#[derive(Clone, Debug, PartialEq)]
pub struct ChangeEvent {
    pub seq: u64,
    pub setter: Option<SetterId>,
    pub event: DocumentEvent,
}

impl DocumentEvent {
    /// The wire `kind` discriminator.
    pub fn kind(&self) -> &'static str {
        match self {
            DocumentEvent::ModelChanged { .. } => "ModelChanged",
            DocumentEvent::ColumnsPatched { .. } => "ColumnsPatched",
            DocumentEvent::ColumnsStreamed { .. } => "ColumnsStreamed",
            DocumentEvent::RootAdded { .. } => "RootAdded",
            DocumentEvent::RootRemoved { .. } => "RootRemoved",
            DocumentEvent::TitleChanged { .. } => "TitleChanged",
            DocumentEvent::MessageSent { .. } => "MessageSent",
        }
    }

    /// The model this event targets, if any.
    pub fn model(&self) -> Option<&ModelId> {
        match self {
            DocumentEvent::ModelChanged { model, .. }
            | DocumentEvent::ColumnsPatched { model, .. }
            | DocumentEvent::ColumnsStreamed { model, .. }
            | DocumentEvent::RootAdded { model }
            | DocumentEvent::RootRemoved { model } => Some(model),
            DocumentEvent::TitleChanged { .. } | DocumentEvent::MessageSent { .. } => None,
        }
    }

    /// Decode an event. Full model definitions embedded in it are collected by
    /// `de` and must be inserted into the document before the event applies.
    pub fn from_json(json: &Json, de: &mut Deserializer<'_>) -> Result<Self, DecodeError> {
        let obj = json
            .as_object()
            .ok_or_else(|| malformed("event must be an object", json))?;
        let kind = obj
            .get("kind")
            .and_then(Json::as_str)
            .ok_or_else(|| malformed("event without kind", json))?;

        let event = match kind {
            "ModelChanged" => DocumentEvent::ModelChanged {
                model: model_field(obj, de, json)?,
                attr: str_field(obj, "attr", json)?,
                new: de.decode(obj.get("new").unwrap_or(&NULL))?,
            },
            "ColumnsPatched" => DocumentEvent::ColumnsPatched {
                model: model_field(obj, de, json)?,
                attr: str_field(obj, "attr", json)?,
                patches: decode_patches(obj.get("patches"), de, json)?,
            },
            "ColumnsStreamed" => {
                let model = model_field(obj, de, json)?;
                let attr = str_field(obj, "attr", json)?;
                let columns = obj
                    .get("data")
                    .and_then(Json::as_object)
                    .ok_or_else(|| malformed("streamed data must be an object", json))?;
                let mut data = ValueMap::new();
                for (column, value) in columns {
                    data.insert(Value::string(column.as_str()), de.decode(value)?);
                }
                let rollover = match obj.get("rollover") {
                    None | Some(Json::Null) => None,
                    Some(n) => Some(
                        n.as_u64()
                            .ok_or_else(|| malformed("rollover must be a non-negative integer", json))?
                            as usize,
                    ),
                };
                DocumentEvent::ColumnsStreamed {
                    model,
                    attr,
                    data,
                    rollover,
                }
            }
            "RootAdded" => DocumentEvent::RootAdded {
                model: model_field(obj, de, json)?,
            },
            "RootRemoved" => DocumentEvent::RootRemoved {
                model: model_field(obj, de, json)?,
            },
            "TitleChanged" => DocumentEvent::TitleChanged {
                title: str_field(obj, "title", json)?,
            },
            "MessageSent" => DocumentEvent::MessageSent {
                msg_type: str_field(obj, "msg_type", json)?,
                msg_data: de.decode(obj.get("msg_data").unwrap_or(&NULL))?,
            },
            other => return Err(malformed(format!("unknown event kind '{other}'"), json)),
        };
        Ok(event)
    }
}

impl Serializable for DocumentEvent {
    fn to_serializable(&self, serializer: &mut Serializer<'_>) -> Result<Json, EncodeError> {
        let mut out = Map::new();
        out.insert("kind".to_string(), json!(self.kind()));
        match self {
            DocumentEvent::ModelChanged { model, attr, new } => {
                out.insert("model".to_string(), serializer.encode_model(model)?);
                out.insert("attr".to_string(), json!(attr));
                out.insert("new".to_string(), serializer.encode(new)?);
            }
            DocumentEvent::ColumnsPatched { model, attr, patches } => {
                out.insert("model".to_string(), serializer.encode_model(model)?);
                out.insert("attr".to_string(), json!(attr));
                let mut columns = Map::new();
                for (column, entries) in patches {
                    let mut encoded = Vec::with_capacity(entries.len());
                    for (index, value) in entries {
                        encoded.push(json!([encode_index(index), serializer.encode(value)?]));
                    }
                    columns.insert(column.clone(), Json::Array(encoded));
                }
                out.insert("patches".to_string(), Json::Object(columns));
            }
            DocumentEvent::ColumnsStreamed {
                model,
                attr,
                data,
                rollover,
            } => {
                out.insert("model".to_string(), serializer.encode_model(model)?);
                out.insert("attr".to_string(), json!(attr));
                let mut columns = Map::new();
                for (column, value) in data.iter() {
                    let name = column
                        .as_str()
                        .ok_or_else(|| EncodeError::Custom("column names must be strings".to_string()))?;
                    columns.insert(name.to_string(), serializer.encode(value)?);
                }
                out.insert("data".to_string(), Json::Object(columns));
                if let Some(rollover) = rollover {
                    out.insert("rollover".to_string(), json!(rollover));
                }
            }
            DocumentEvent::RootAdded { model } | DocumentEvent::RootRemoved { model } => {
                out.insert("model".to_string(), serializer.encode_model(model)?);
            }
            DocumentEvent::TitleChanged { title } => {
                out.insert("title".to_string(), json!(title));
            }
            DocumentEvent::MessageSent { msg_type, msg_data } => {
                out.insert("msg_type".to_string(), json!(msg_type));
                out.insert("msg_data".to_string(), serializer.encode(msg_data)?);
            }
        }
        Ok(Json::Object(out))
    }
}

fn malformed(reason: impl Into<String>, json: &Json) -> DecodeError {
    DecodeError::Malformed {
        reason: reason.into(),
        value: json.clone(),
    }
}

fn str_field(obj: &Map<String, Json>, key: &str, json: &Json) -> Result<String, DecodeError> {
    obj.get(key)
        .and_then(Json::as_str)
        .map(str::to_string)
        .ok_or_else(|| malformed(format!("missing string field '{key}'"), json))
}

fn model_field(
    obj: &Map<String, Json>,
    de: &mut Deserializer<'_>,
    json: &Json,
) -> Result<ModelId, DecodeError> {
    let model = obj
        .get("model")
        .ok_or_else(|| malformed("event without model", json))?;
    match de.decode(model)? {
        Value::Ref(id) => Ok(id),
        _ => Err(malformed("model must be a model reference", json)),
    }
}

fn encode_index(index: &PatchIndex) -> Json {
    match index {
        PatchIndex::Index(i) => json!(i),
        PatchIndex::Slice { start, stop, step } => json!({
            "type": "slice",
            "start": start,
            "stop": stop,
            "step": step,
        }),
    }
}

fn decode_index(value: Value, json: &Json) -> Result<PatchIndex, DecodeError> {
    let bound = |b: Option<i64>| -> Result<Option<usize>, DecodeError> {
        b.map(|b| usize::try_from(b).map_err(|_| malformed("negative slice bound", json)))
            .transpose()
    };
    match value {
        Value::Int(i) => usize::try_from(i)
            .map(PatchIndex::Index)
            .map_err(|_| malformed("negative patch index", json)),
        Value::Slice(Slice { start, stop, step }) => Ok(PatchIndex::Slice {
            start: bound(start)?.unwrap_or(0),
            stop: bound(stop)?,
            step: bound(step)?.unwrap_or(1),
        }),
        _ => Err(malformed("patch index must be an integer or a slice", json)),
    }
}

fn decode_patches(
    patches: Option<&Json>,
    de: &mut Deserializer<'_>,
    json: &Json,
) -> Result<ColumnPatches, DecodeError> {
    let columns = patches
        .and_then(Json::as_object)
        .ok_or_else(|| malformed("patches must be an object", json))?;
    let mut decoded = Vec::with_capacity(columns.len());
    for (column, entries) in columns {
        let entries = entries
            .as_array()
            .ok_or_else(|| malformed("column patches must be a list", json))?;
        let mut ops = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry.as_array().map(Vec::as_slice) {
                Some([index, value]) => {
                    let index = decode_index(de.decode(index)?, json)?;
                    ops.push((index, de.decode(value)?));
                }
                _ => return Err(malformed("patches must be [index, value] pairs", json)),
            }
        }
        decoded.push((column.clone(), ops));
    }
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ModelRegistry;

    fn round_trip(event: &DocumentEvent) -> DocumentEvent {
        let json = Serializer::detached().encode_with(event).unwrap();
        let registry = ModelRegistry::new();
        let mut de = Deserializer::new(&registry).with_known_ids([ModelId::from("m1")].into_iter().collect());
        let decoded = DocumentEvent::from_json(&json, &mut de).unwrap();
        de.finish().unwrap();
        decoded
    }

    #[test]
    fn test_patch_wire_form() {
        let event = DocumentEvent::ColumnsPatched {
            model: ModelId::from("m1"),
            attr: "data".to_string(),
            patches: vec![(
                "foo".to_string(),
                vec![
                    (PatchIndex::Index(0), Value::Int(2)),
                    (
                        PatchIndex::Slice {
                            start: 1,
                            stop: Some(3),
                            step: 1,
                        },
                        Value::List(vec![Value::Int(5), Value::Int(6)]),
                    ),
                ],
            )],
        };
        let json = Serializer::detached().encode_with(&event).unwrap();
        assert_eq!(
            json,
            json!({
                "kind": "ColumnsPatched",
                "model": {"id": "m1"},
                "attr": "data",
                "patches": {"foo": [
                    [0, 2],
                    [{"type": "slice", "start": 1, "stop": 3, "step": 1}, [5, 6]]
                ]}
            })
        );
        assert_eq!(round_trip(&event), event);
    }

    #[test]
    fn test_stream_rollover_is_optional() {
        let data: ValueMap = [(Value::string("x"), Value::List(vec![Value::Float(1.5)]))]
            .into_iter()
            .collect();
        let event = DocumentEvent::ColumnsStreamed {
            model: ModelId::from("m1"),
            attr: "data".to_string(),
            data,
            rollover: None,
        };
        let json = Serializer::detached().encode_with(&event).unwrap();
        assert!(json.get("rollover").is_none());
        assert_eq!(round_trip(&event), event);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let registry = ModelRegistry::new();
        let mut de = Deserializer::new(&registry);
        let result = DocumentEvent::from_json(&json!({"kind": "Exploded"}), &mut de);
        assert!(matches!(result, Err(DecodeError::Malformed { .. })));

        let negative = json!({"kind": "ColumnsPatched", "model": {"id": "m1"}, "attr": "data", "patches": {"a": [[-1, 0]]}});
        assert!(DocumentEvent::from_json(&negative, &mut de).is_err());
    }

    #[test]
    fn test_title_and_message() {
        let title = DocumentEvent::TitleChanged {
            title: "Sales".to_string(),
        };
        assert_eq!(title.model(), None);
        assert_eq!(round_trip(&title), title);

        let message = DocumentEvent::MessageSent {
            msg_type: "ping".to_string(),
            msg_data: Value::dict([("n", Value::Int(1))]),
        };
        assert_eq!(round_trip(&message), message);
    }
}
