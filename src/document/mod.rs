//! document/mod.rs
//!
//! A Document owns an arena of models, an ordered set of roots and a title.
//! Every mutation, local or inbound, goes through [`Document::apply`], which
//! validates first, mutates second and emits exactly one [`ChangeEvent`]
//! last. A mutation that fails validation changes nothing and emits nothing.

mod columns;
mod events;
mod snapshot;

pub use events::{ChangeEvent, ColumnPatches, DocumentEvent, PatchIndex, SetterId};
pub use snapshot::{DocJson, DEFAULT_TITLE, PROTOCOL_VERSION};

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use crate::model::{DefinitionError, Model, ModelId};
use crate::registry::ModelRegistry;
use crate::wire::{DecodeError, EncodeError, Value, ValueMap};

/// Errors raised by document mutations and snapshots.
#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("Unknown model '{0}'")]
    UnknownModel(ModelId),

    #[error("Model '{model}' has no attribute '{attr}'")]
    UnknownAttribute { model: ModelId, attr: String },

    #[error("Value for '{model}.{attr}' does not match kind {kind}")]
    InvalidValue {
        model: ModelId,
        attr: String,
        kind: String,
    },

    #[error("Attribute '{model}.{attr}' is not a column table")]
    NotColumnar { model: ModelId, attr: String },

    #[error("Column '{column}' holds a {found}, not a sequence")]
    ColumnType { column: String, found: &'static str },

    #[error("Unknown column '{0}'")]
    UnknownColumn(String),

    #[error("Streamed columns do not match the table (missing {missing:?}, extra {extra:?})")]
    ColumnSetMismatch {
        missing: Vec<String>,
        extra: Vec<String>,
    },

    #[error("Column '{column}' has length {actual}, expected {expected}")]
    ColumnLengthMismatch {
        column: String,
        expected: usize,
        actual: usize,
    },

    #[error("Patch index {index} is beyond the end of column '{column}' (length {len})")]
    PatchOutOfBounds {
        column: String,
        index: usize,
        len: usize,
    },

    #[error("Invalid patch for column '{column}': {reason}")]
    InvalidPatch { column: String, reason: String },

    #[error("Model '{0}' is listed as a root more than once")]
    DuplicateRoot(ModelId),

    #[error("Multiple models are named '{0}'")]
    DuplicateName(String),

    #[error("Definition error: {0}")]
    Definition(#[from] DefinitionError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Handle returned when registering a callback, used to remove it again.
pub type CallbackId = Uuid;

/// Called once per emitted change with read-only access to the document.
pub type ChangeCallback = Box<dyn FnMut(&ChangeEvent, &Document) + Send>;

/// Called with the payload of an inbound `MessageSent` event.
pub type MessageCallback = Box<dyn FnMut(&Value, &Document) + Send>;

pub struct Document {
    title: String,
    version: String,
    roots: Vec<ModelId>,
    models: HashMap<ModelId, Model>,
    registry: Arc<ModelRegistry>,
    callbacks: Vec<(CallbackId, ChangeCallback)>,
    message_callbacks: Vec<(CallbackId, String, MessageCallback)>,
    next_seq: u64,
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("title", &self.title)
            .field("version", &self.version)
            .field("roots", &self.roots)
            .field("models", &self.models.len())
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

impl Document {
    /// Create an empty document whose types resolve through `registry`.
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self {
            title: DEFAULT_TITLE.to_string(),
            version: PROTOCOL_VERSION.to_string(),
            roots: Vec::new(),
            models: HashMap::new(),
            registry,
            callbacks: Vec::new(),
            message_callbacks: Vec::new(),
            next_seq: 0,
        }
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn roots(&self) -> &[ModelId] {
        &self.roots
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn models(&self) -> &HashMap<ModelId, Model> {
        &self.models
    }

    pub fn get_model(&self, id: &ModelId) -> Option<&Model> {
        self.models.get(id)
    }

    /// The model whose `name` attribute is `name`, if exactly one has it.
    pub fn get_model_by_name(&self, name: &str) -> Result<Option<&ModelId>, DocumentError> {
        let mut found = self
            .models
            .iter()
            .filter(|(_, model)| matches!(model.get("name"), Some(Value::String(n)) if n == name))
            .map(|(id, _)| id);
        match (found.next(), found.next()) {
            (Some(_), Some(_)) => Err(DocumentError::DuplicateName(name.to_string())),
            (first, _) => Ok(first),
        }
    }

    pub fn model_ids(&self) -> Vec<ModelId> {
        self.models.keys().cloned().collect()
    }

    /// Ids of every model reachable from a root.
    pub fn all_models(&self) -> HashSet<ModelId> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<ModelId> = self.roots.iter().cloned().collect();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(model) = self.models.get(&id) {
                queue.extend(model.references());
            }
        }
        seen
    }

    /// Instantiate a registered type inside this document. The new model is
    /// not a root until [`Document::add_root`] is called.
    pub fn create_model(
        &mut self,
        type_name: &str,
        attrs: Vec<(String, Value)>,
    ) -> Result<ModelId, DocumentError> {
        let instance = self.registry.instantiate(type_name, attrs)?;
        for reference in instance.model.references() {
            let is_copy = instance.defaults.iter().any(|m| m.id() == &reference);
            if !is_copy && !self.models.contains_key(&reference) {
                return Err(DocumentError::UnknownModel(reference));
            }
        }
        let id = instance.model.id().clone();
        self.models.insert(id.clone(), instance.model);
        for copy in instance.defaults {
            self.models.insert(copy.id().clone(), copy);
        }
        Ok(id)
    }

    /// Add decoded models, keeping any copy the document already holds.
    pub(crate) fn insert_models(&mut self, models: Vec<Model>) {
        for model in models {
            self.models.entry(model.id().clone()).or_insert(model);
        }
    }

    /// Drop models added by [`Document::insert_models`] for an event that
    /// was then rejected.
    pub(crate) fn remove_models(&mut self, ids: &[ModelId]) {
        for id in ids {
            self.models.remove(id);
        }
    }

    pub fn on_change<F>(&mut self, callback: F) -> CallbackId
    where
        F: FnMut(&ChangeEvent, &Document) + Send + 'static,
    {
        let id = Uuid::new_v4();
        self.callbacks.push((id, Box::new(callback)));
        id
    }

    pub fn remove_on_change(&mut self, id: CallbackId) -> bool {
        let before = self.callbacks.len();
        self.callbacks.retain(|(existing, _)| *existing != id);
        self.callbacks.len() != before
    }

    /// Receive payloads of inbound `MessageSent` events of type `msg_type`.
    pub fn on_message<F>(&mut self, msg_type: impl Into<String>, callback: F) -> CallbackId
    where
        F: FnMut(&Value, &Document) + Send + 'static,
    {
        let id = Uuid::new_v4();
        self.message_callbacks
            .push((id, msg_type.into(), Box::new(callback)));
        id
    }

    pub fn remove_on_message(&mut self, id: CallbackId) -> bool {
        let before = self.message_callbacks.len();
        self.message_callbacks.retain(|(existing, _, _)| *existing != id);
        self.message_callbacks.len() != before
    }

    pub fn add_root(&mut self, model: &ModelId) -> Result<(), DocumentError> {
        self.apply(DocumentEvent::RootAdded { model: model.clone() }, None)
            .map(|_| ())
    }

    pub fn remove_root(&mut self, model: &ModelId) -> Result<(), DocumentError> {
        self.apply(DocumentEvent::RootRemoved { model: model.clone() }, None)
            .map(|_| ())
    }

    /// Remove every root, one `RootRemoved` event each. Models stay in the
    /// arena.
    pub fn clear(&mut self) -> Result<(), DocumentError> {
        for root in self.roots.clone() {
            self.remove_root(&root)?;
        }
        Ok(())
    }

    pub fn set_title(&mut self, title: impl Into<String>) -> Result<(), DocumentError> {
        self.apply(DocumentEvent::TitleChanged { title: title.into() }, None)
            .map(|_| ())
    }

    /// Replace one attribute of a model.
    pub fn set_attr(
        &mut self,
        model: &ModelId,
        attr: &str,
        value: impl Into<Value>,
    ) -> Result<(), DocumentError> {
        let event = DocumentEvent::ModelChanged {
            model: model.clone(),
            attr: attr.to_string(),
            new: value.into(),
        };
        self.apply(event, None).map(|_| ())
    }

    /// Append rows to a column table, keeping at most `rollover` rows.
    pub fn stream(
        &mut self,
        model: &ModelId,
        attr: &str,
        data: ValueMap,
        rollover: Option<usize>,
    ) -> Result<(), DocumentError> {
        let event = DocumentEvent::ColumnsStreamed {
            model: model.clone(),
            attr: attr.to_string(),
            data,
            rollover,
        };
        self.apply(event, None).map(|_| ())
    }

    pub fn patch(
        &mut self,
        model: &ModelId,
        attr: &str,
        patches: ColumnPatches,
    ) -> Result<(), DocumentError> {
        let event = DocumentEvent::ColumnsPatched {
            model: model.clone(),
            attr: attr.to_string(),
            patches,
        };
        self.apply(event, None).map(|_| ())
    }

    /// Send an out-of-band payload to the peers of this document.
    pub fn send_message(
        &mut self,
        msg_type: impl Into<String>,
        msg_data: Value,
    ) -> Result<(), DocumentError> {
        let event = DocumentEvent::MessageSent {
            msg_type: msg_type.into(),
            msg_data,
        };
        self.apply(event, None).map(|_| ())
    }

    /// Apply one event and emit it. Returns whether anything changed; no-op
    /// events (re-adding a root, setting an equal value) emit nothing.
    ///
    /// `setter` identifies the origin of an inbound event and travels with the
    /// emitted [`ChangeEvent`]. Message callbacks only fire for events with a
    /// setter.
    pub fn apply(
        &mut self,
        event: DocumentEvent,
        setter: Option<SetterId>,
    ) -> Result<bool, DocumentError> {
        let changed = match &event {
            DocumentEvent::ModelChanged { model, attr, new } => {
                if self.attribute(model, attr)? == new {
                    false
                } else {
                    self.check_value(model, attr, new)?;
                    self.store(model, attr, new.clone());
                    true
                }
            }
            DocumentEvent::ColumnsPatched {
                model,
                attr,
                patches,
            } => {
                for (_, ops) in patches {
                    for (_, value) in ops {
                        self.check_refs(value)?;
                    }
                }
                let updated = Value::Map(columns::patch(self.column_table(model, attr)?, patches)?);
                self.check_value(model, attr, &updated)?;
                self.store(model, attr, updated);
                true
            }
            DocumentEvent::ColumnsStreamed {
                model,
                attr,
                data,
                rollover,
            } => {
                for value in data.values() {
                    self.check_refs(value)?;
                }
                let table = self.column_table(model, attr)?;
                let updated = Value::Map(columns::stream(table, data, *rollover)?);
                self.check_value(model, attr, &updated)?;
                self.store(model, attr, updated);
                true
            }
            DocumentEvent::RootAdded { model } => {
                if !self.models.contains_key(model) {
                    return Err(DocumentError::UnknownModel(model.clone()));
                }
                if self.roots.contains(model) {
                    false
                } else {
                    self.roots.push(model.clone());
                    true
                }
            }
            DocumentEvent::RootRemoved { model } => {
                match self.roots.iter().position(|root| root == model) {
                    Some(index) => {
                        self.roots.remove(index);
                        true
                    }
                    None => false,
                }
            }
            DocumentEvent::TitleChanged { title } => {
                if &self.title == title {
                    false
                } else {
                    self.title = title.clone();
                    true
                }
            }
            DocumentEvent::MessageSent { msg_type, msg_data } => {
                self.check_refs(msg_data)?;
                if setter.is_some() {
                    self.notify_message(msg_type, msg_data);
                }
                true
            }
        };

        if changed {
            self.emit(event, setter);
        }
        Ok(changed)
    }

    /// The single place change events leave the document.
    fn emit(&mut self, event: DocumentEvent, setter: Option<SetterId>) {
        self.next_seq += 1;
        let change = ChangeEvent {
            seq: self.next_seq,
            setter,
            event,
        };
        let mut callbacks = std::mem::take(&mut self.callbacks);
        for (_, callback) in callbacks.iter_mut() {
            callback(&change, self);
        }
        self.callbacks = callbacks;
    }

    fn notify_message(&mut self, msg_type: &str, msg_data: &Value) {
        let mut callbacks = std::mem::take(&mut self.message_callbacks);
        for (_, wanted, callback) in callbacks.iter_mut() {
            if wanted == msg_type {
                callback(msg_data, self);
            }
        }
        self.message_callbacks = callbacks;
    }

    fn attribute(&self, model: &ModelId, attr: &str) -> Result<&Value, DocumentError> {
        let found = self
            .models
            .get(model)
            .ok_or_else(|| DocumentError::UnknownModel(model.clone()))?;
        found.get(attr).ok_or_else(|| DocumentError::UnknownAttribute {
            model: model.clone(),
            attr: attr.to_string(),
        })
    }

    fn column_table(&self, model: &ModelId, attr: &str) -> Result<&ValueMap, DocumentError> {
        match self.attribute(model, attr)? {
            Value::Map(table) => Ok(table),
            _ => Err(DocumentError::NotColumnar {
                model: model.clone(),
                attr: attr.to_string(),
            }),
        }
    }

    /// Kind check against the model's type, plus reference check.
    fn check_value(&self, model: &ModelId, attr: &str, value: &Value) -> Result<(), DocumentError> {
        let type_name = self
            .models
            .get(model)
            .map(|m| m.type_name().to_string())
            .ok_or_else(|| DocumentError::UnknownModel(model.clone()))?;
        let descriptor = self
            .registry
            .lookup(&type_name)
            .ok_or(DefinitionError::UnknownType(type_name))?;
        if let Some(property) = descriptor.property(attr) {
            if !property.kind.validate(value) {
                return Err(DocumentError::InvalidValue {
                    model: model.clone(),
                    attr: attr.to_string(),
                    kind: property.kind.to_string(),
                });
            }
        }
        self.check_refs(value)
    }

    fn check_refs(&self, value: &Value) -> Result<(), DocumentError> {
        let mut refs = Vec::new();
        value.collect_refs(&mut refs);
        match refs.into_iter().find(|id| !self.models.contains_key(id)) {
            Some(missing) => Err(DocumentError::UnknownModel(missing)),
            None => Ok(()),
        }
    }

    fn store(&mut self, model: &ModelId, attr: &str, value: Value) {
        if let Some(target) = self.models.get_mut(model) {
            target.set(attr, value);
        }
    }
}
