//! Wire values
//!
//! The value universe carried by models and events, and the
//! [`Serializer`]/[`Deserializer`] pair that maps it to and from JSON.
//! Models cross the wire by identity: the first occurrence in a batch
//! carries the full `{type:"object", name, id, attributes}` form and every
//! later occurrence is a back-reference.

mod decode;
mod encode;
mod value;

pub use decode::{DecodeError, Deserializer};
pub use encode::{EncodeError, Serializable, Serializer, MAX_SAFE_INT};
pub use value::{Slice, Value, ValueMap, ValueSet};

use std::collections::HashMap;

use crate::model::{Model, ModelId};

/// Read access to a set of models by id.
pub trait ModelLookup {
    fn lookup(&self, id: &ModelId) -> Option<&Model>;
}

impl ModelLookup for HashMap<ModelId, Model> {
    fn lookup(&self, id: &ModelId) -> Option<&Model> {
        self.get(id)
    }
}
