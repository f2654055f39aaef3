//! Models and their type system
//!
//! A [`Model`] is a typed node in a document's object graph. Its type is a
//! [`TypeDescriptor`], usually resolved from a wire [`ModelDef`], which fixes
//! the ordered list of properties, their [`PropertyKind`]s and defaults.

mod definition;
mod descriptor;
mod kind;

pub use definition::{DefinitionError, ModelDef, OverrideDef, PropertyDef, ReferenceDef, TypeRef};
pub use descriptor::{Instance, PropertyDescriptor, TypeDescriptor, TypeDescriptorBuilder};
pub use kind::{Pattern, PropertyKind};

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::wire::Value;

/// Globally unique, never reused model identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelId(String);

impl ModelId {
    /// Allocate a fresh id.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ModelId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for ModelId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ModelId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A model instance: identity, qualified type name and attributes in
/// property order.
#[derive(Clone, Debug, PartialEq)]
pub struct Model {
    id: ModelId,
    type_name: String,
    attributes: Vec<(String, Value)>,
}

impl Model {
    pub(crate) fn from_parts(id: ModelId, type_name: String, attributes: Vec<(String, Value)>) -> Self {
        Self {
            id,
            type_name,
            attributes,
        }
    }

    pub fn id(&self) -> &ModelId {
        &self.id
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn get(&self, attr: &str) -> Option<&Value> {
        self.attributes
            .iter()
            .find(|(name, _)| name == attr)
            .map(|(_, value)| value)
    }

    /// Replace an existing attribute, returning the previous value.
    /// Returns `None` without storing anything if the attribute is unknown.
    pub(crate) fn set(&mut self, attr: &str, value: Value) -> Option<Value> {
        self.attributes
            .iter_mut()
            .find(|(name, _)| name == attr)
            .map(|(_, slot)| std::mem::replace(slot, value))
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.attributes.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Ids of every model referenced from this model's attributes.
    pub fn references(&self) -> Vec<ModelId> {
        let mut refs = Vec::new();
        for (_, value) in &self.attributes {
            value.collect_refs(&mut refs);
        }
        refs
    }
}
