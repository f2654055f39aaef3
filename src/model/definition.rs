//! Wire form of model type definitions.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use thiserror::Error;

use super::ModelId;

/// Errors raised while resolving definitions or instantiating types.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DefinitionError {
    #[error("Unresolved base type '{base}' for definition '{name}'")]
    UnresolvedBase { name: String, base: String },

    #[error("Unknown type '{0}'")]
    UnknownType(String),

    #[error("Definition '{name}' uses type '{type_name}' before it is registered")]
    ForwardReference { name: String, type_name: String },

    #[error("Definition '{name}' references unknown default instance '{id}'")]
    UnknownReference { name: String, id: ModelId },

    #[error("Invalid property kind: {0}")]
    InvalidKind(String),

    #[error("Type '{type_name}' has no property '{property}'")]
    UnknownProperty { type_name: String, property: String },

    #[error("Property '{property}' is declared twice on '{type_name}'")]
    DuplicateProperty { type_name: String, property: String },

    #[error("Value for '{type_name}.{property}' does not match kind {kind}")]
    InvalidValue {
        type_name: String,
        property: String,
        kind: String,
    },

    #[error("Invalid default in '{name}': {reason}")]
    InvalidDefault { name: String, reason: String },

    #[error("Type '{0}' is already registered with a different definition")]
    AlreadyRegistered(String),

    #[error("Type registry lock poisoned")]
    RegistryPoisoned,
}

/// A type named by `name` within an optional `module`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TypeRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
}

impl TypeRef {
    pub fn qualified_name(&self) -> String {
        qualify(&self.name, self.module.as_deref())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PropertyDef {
    pub name: String,
    #[serde(default = "any_kind")]
    pub kind: Json,
    /// `Some(Json::Null)` is a null default; `None` means no default at all.
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub default: Option<Json>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OverrideDef {
    pub name: String,
    pub default: Json,
}

/// An entry of the default-value side table: a model instance that
/// defaults may point at with `{"id": ...}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReferenceDef {
    pub id: ModelId,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub attributes: serde_json::Map<String, Json>,
}

/// A model type definition as exchanged between peers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extends: Option<TypeRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub properties: Vec<PropertyDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub overrides: Vec<OverrideDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<ReferenceDef>,
}

impl ModelDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            module: None,
            extends: None,
            properties: Vec::new(),
            overrides: Vec::new(),
            references: Vec::new(),
        }
    }

    pub fn module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }

    pub fn extends(mut self, name: impl Into<String>, module: Option<&str>) -> Self {
        self.extends = Some(TypeRef {
            name: name.into(),
            module: module.map(str::to_string),
        });
        self
    }

    pub fn property(mut self, name: impl Into<String>, kind: Json, default: Option<Json>) -> Self {
        self.properties.push(PropertyDef {
            name: name.into(),
            kind,
            default,
        });
        self
    }

    pub fn override_default(mut self, name: impl Into<String>, default: Json) -> Self {
        self.overrides.push(OverrideDef {
            name: name.into(),
            default,
        });
        self
    }

    pub fn reference(
        mut self,
        id: impl Into<ModelId>,
        type_name: impl Into<String>,
        attributes: serde_json::Map<String, Json>,
    ) -> Self {
        self.references.push(ReferenceDef {
            id: id.into(),
            type_name: type_name.into(),
            attributes,
        });
        self
    }

    pub fn qualified_name(&self) -> String {
        qualify(&self.name, self.module.as_deref())
    }
}

pub(crate) fn qualify(name: &str, module: Option<&str>) -> String {
    match module {
        Some(module) => format!("{module}.{name}"),
        None => name.to_string(),
    }
}

fn any_kind() -> Json {
    Json::String("Any".to_string())
}

fn present<'de, D>(deserializer: D) -> Result<Option<Json>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Json::deserialize(deserializer).map(Some)
}
