//! Property kinds: the value constraints a property declares.
//!
//! On the wire a kind is either a bare name (`"Int"`) or an array whose
//! head names a composite kind (`["Array", "Number"]`, `["Or", "Int", "Null"]`).

use std::fmt;

use serde_json::{json, Value as Json};

use super::DefinitionError;
use crate::wire::Value;

/// A compiled regular expression compared by its source pattern.
#[derive(Clone, Debug)]
pub struct Pattern(regex::Regex);

impl Pattern {
    pub fn new(source: &str) -> Result<Self, DefinitionError> {
        regex::Regex::new(source)
            .map(Pattern)
            .map_err(|e| DefinitionError::InvalidKind(format!("bad regex '{source}': {e}")))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.0.is_match(text)
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum PropertyKind {
    Any,
    Bool,
    Number,
    Int,
    String,
    Null,
    Enum(Vec<String>),
    Array(Box<PropertyKind>),
    /// String-keyed map.
    Dict(Box<PropertyKind>),
    Map(Box<PropertyKind>, Box<PropertyKind>),
    Struct(Vec<(String, PropertyKind)>),
    Tuple(Vec<PropertyKind>),
    /// Model reference, optionally naming the expected type.
    Ref(Option<String>),
    Or(Vec<PropertyKind>),
    Nullable(Box<PropertyKind>),
    Regex(Pattern),
}

impl PropertyKind {
    pub fn array(item: PropertyKind) -> Self {
        PropertyKind::Array(Box::new(item))
    }

    pub fn dict(item: PropertyKind) -> Self {
        PropertyKind::Dict(Box::new(item))
    }

    pub fn nullable(inner: PropertyKind) -> Self {
        PropertyKind::Nullable(Box::new(inner))
    }

    /// Whether `value` satisfies this kind. References are checked for
    /// shape only; the referenced model's type is not consulted.
    pub fn validate(&self, value: &Value) -> bool {
        match (self, value) {
            (PropertyKind::Any, _) => true,
            (PropertyKind::Bool, Value::Bool(_)) => true,
            (PropertyKind::Number, Value::Int(_) | Value::Float(_)) => true,
            (PropertyKind::Int, Value::Int(_)) => true,
            (PropertyKind::String, Value::String(_)) => true,
            (PropertyKind::Null, Value::Null) => true,
            (PropertyKind::Enum(options), Value::String(s)) => options.contains(s),
            (PropertyKind::Array(item), Value::List(items)) => items.iter().all(|v| item.validate(v)),
            (PropertyKind::Array(_), Value::NdArray(_)) => true,
            (PropertyKind::Dict(item), Value::Map(map)) => map
                .iter()
                .all(|(k, v)| matches!(k, Value::String(_)) && item.validate(v)),
            (PropertyKind::Map(key, item), Value::Map(map)) => {
                map.iter().all(|(k, v)| key.validate(k) && item.validate(v))
            }
            (PropertyKind::Struct(fields), Value::Map(map)) => {
                map.keys().all(|k| {
                    k.as_str()
                        .map_or(false, |name| fields.iter().any(|(field, _)| field == name))
                }) && fields.iter().all(|(name, kind)| match map.get_str(name) {
                    Some(v) => kind.validate(v),
                    None => kind.validate(&Value::Null),
                })
            }
            (PropertyKind::Tuple(kinds), Value::List(items)) => {
                kinds.len() == items.len() && kinds.iter().zip(items).all(|(k, v)| k.validate(v))
            }
            (PropertyKind::Ref(_), Value::Ref(_)) => true,
            (PropertyKind::Or(kinds), v) => kinds.iter().any(|k| k.validate(v)),
            (PropertyKind::Nullable(_), Value::Null) => true,
            (PropertyKind::Nullable(inner), v) => inner.validate(v),
            (PropertyKind::Regex(pattern), Value::String(s)) => pattern.is_match(s),
            _ => false,
        }
    }

    pub fn from_json(json: &Json) -> Result<Self, DefinitionError> {
        match json {
            Json::String(name) => match name.as_str() {
                "Any" => Ok(PropertyKind::Any),
                "Bool" | "Boolean" => Ok(PropertyKind::Bool),
                "Number" | "Float" => Ok(PropertyKind::Number),
                "Int" => Ok(PropertyKind::Int),
                "String" | "Str" => Ok(PropertyKind::String),
                "Null" => Ok(PropertyKind::Null),
                "Ref" => Ok(PropertyKind::Ref(None)),
                other => Err(DefinitionError::InvalidKind(other.to_string())),
            },
            Json::Array(parts) => {
                let (head, args) = parts.split_first().ok_or_else(|| invalid(json))?;
                let head = head.as_str().ok_or_else(|| invalid(json))?;
                match (head, args) {
                    ("Enum", options) if !options.is_empty() => options
                        .iter()
                        .map(|o| o.as_str().map(str::to_string).ok_or_else(|| invalid(json)))
                        .collect::<Result<Vec<_>, _>>()
                        .map(PropertyKind::Enum),
                    ("Array" | "List", [item]) => Ok(PropertyKind::array(Self::from_json(item)?)),
                    ("Dict", [item]) => Ok(PropertyKind::dict(Self::from_json(item)?)),
                    ("Map", [key, item]) => Ok(PropertyKind::Map(
                        Box::new(Self::from_json(key)?),
                        Box::new(Self::from_json(item)?),
                    )),
                    ("Struct", fields) => fields
                        .iter()
                        .map(|field| match field.as_array().map(Vec::as_slice) {
                            Some([Json::String(name), kind]) => {
                                Ok((name.clone(), Self::from_json(kind)?))
                            }
                            _ => Err(invalid(json)),
                        })
                        .collect::<Result<Vec<_>, _>>()
                        .map(PropertyKind::Struct),
                    ("Tuple", kinds) if !kinds.is_empty() => kinds
                        .iter()
                        .map(Self::from_json)
                        .collect::<Result<Vec<_>, _>>()
                        .map(PropertyKind::Tuple),
                    ("Ref", []) => Ok(PropertyKind::Ref(None)),
                    ("Ref", [Json::String(target)]) => Ok(PropertyKind::Ref(Some(target.clone()))),
                    ("Or", kinds) if !kinds.is_empty() => kinds
                        .iter()
                        .map(Self::from_json)
                        .collect::<Result<Vec<_>, _>>()
                        .map(PropertyKind::Or),
                    ("Nullable", [inner]) => Ok(PropertyKind::nullable(Self::from_json(inner)?)),
                    ("Regex", [Json::String(source)]) => Ok(PropertyKind::Regex(Pattern::new(source)?)),
                    _ => Err(invalid(json)),
                }
            }
            _ => Err(invalid(json)),
        }
    }

    pub fn to_json(&self) -> Json {
        match self {
            PropertyKind::Any => json!("Any"),
            PropertyKind::Bool => json!("Bool"),
            PropertyKind::Number => json!("Number"),
            PropertyKind::Int => json!("Int"),
            PropertyKind::String => json!("String"),
            PropertyKind::Null => json!("Null"),
            PropertyKind::Enum(options) => {
                let mut parts = vec![json!("Enum")];
                parts.extend(options.iter().map(|o| json!(o)));
                Json::Array(parts)
            }
            PropertyKind::Array(item) => json!(["Array", item.to_json()]),
            PropertyKind::Dict(item) => json!(["Dict", item.to_json()]),
            PropertyKind::Map(key, item) => json!(["Map", key.to_json(), item.to_json()]),
            PropertyKind::Struct(fields) => {
                let mut parts = vec![json!("Struct")];
                parts.extend(fields.iter().map(|(name, kind)| json!([name, kind.to_json()])));
                Json::Array(parts)
            }
            PropertyKind::Tuple(kinds) => composite("Tuple", kinds),
            PropertyKind::Ref(None) => json!("Ref"),
            PropertyKind::Ref(Some(target)) => json!(["Ref", target]),
            PropertyKind::Or(kinds) => composite("Or", kinds),
            PropertyKind::Nullable(inner) => json!(["Nullable", inner.to_json()]),
            PropertyKind::Regex(pattern) => json!(["Regex", pattern.as_str()]),
        }
    }
}

fn composite(head: &str, kinds: &[PropertyKind]) -> Json {
    let mut parts = vec![json!(head)];
    parts.extend(kinds.iter().map(PropertyKind::to_json));
    Json::Array(parts)
}

fn invalid(json: &Json) -> DefinitionError {
    DefinitionError::InvalidKind(json.to_string())
}

impl fmt::Display for PropertyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}
