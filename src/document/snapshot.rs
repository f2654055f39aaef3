//! Whole-document snapshots: the pull reply and the at-rest file format.

use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use super::{Document, DocumentError};
use crate::model::{ModelDef, ModelId};
use crate::registry::ModelRegistry;
use crate::wire::{DecodeError, Deserializer, Serializer, Value};

pub const DEFAULT_TITLE: &str = "Untitled Document";

/// Version marker written into every snapshot.
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Serialized document: definitions for dynamic types first, then roots.
/// Shared models are written in full once and referenced by id afterwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DocJson {
    pub version: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub defs: Vec<ModelDef>,
    pub roots: Vec<Json>,
}

impl Document {
    pub fn to_json(&self) -> Result<DocJson, DocumentError> {
        Ok(self.encode_snapshot(true)?.0)
    }

    /// Encode the document, returning the ids of every model written in full
    /// alongside the snapshot.
    pub(crate) fn encode_snapshot(
        &self,
        binary: bool,
    ) -> Result<(DocJson, HashSet<ModelId>), DocumentError> {
        let mut serializer = Serializer::new(&self.models).with_binary(binary);
        let mut roots = Vec::with_capacity(self.roots.len());
        for root in &self.roots {
            roots.push(serializer.encode_model(root)?);
        }
        let emitted = serializer.into_emitted();

        let type_names: BTreeSet<&str> = emitted
            .iter()
            .filter_map(|id| self.models.get(id))
            .map(|model| model.type_name())
            .collect();
        let type_names: Vec<&str> = type_names.into_iter().collect();
        let defs = self.registry.export_defs(&type_names)?;

        let snapshot = DocJson {
            version: self.version.clone(),
            title: self.title.clone(),
            defs,
            roots,
        };
        Ok((snapshot, emitted))
    }

    /// Rebuild a document from a snapshot, registering its definitions first.
    pub fn from_json(snapshot: &DocJson, registry: Arc<ModelRegistry>) -> Result<Self, DocumentError> {
        registry.resolve_defs(&snapshot.defs)?;

        let (roots, models) = {
            let mut de = Deserializer::new(registry.as_ref());
            let mut roots: Vec<ModelId> = Vec::with_capacity(snapshot.roots.len());
            for root in &snapshot.roots {
                match de.decode(root)? {
                    Value::Ref(id) if roots.contains(&id) => return Err(DocumentError::DuplicateRoot(id)),
                    Value::Ref(id) => roots.push(id),
                    _ => {
                        return Err(DecodeError::Malformed {
                            reason: "root must be a model".to_string(),
                            value: root.clone(),
                        }
                        .into())
                    }
                }
            }
            (roots, de.finish()?)
        };

        let mut document = Document::new(registry);
        document.title = snapshot.title.clone();
        document.version = snapshot.version.clone();
        document.insert_models(models);
        for root in &roots {
            if !document.models.contains_key(root) {
                return Err(DocumentError::UnknownModel(root.clone()));
            }
        }
        document.roots = roots;
        Ok(document)
    }

    pub fn to_json_string(&self) -> Result<String, DocumentError> {
        Ok(serde_json::to_string_pretty(&self.to_json()?)?)
    }

    pub fn from_json_str(json: &str, registry: Arc<ModelRegistry>) -> Result<Self, DocumentError> {
        let snapshot: DocJson = serde_json::from_str(json)?;
        Self::from_json(&snapshot, registry)
    }

    /// Write the snapshot to `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), DocumentError> {
        std::fs::write(path.as_ref(), self.to_json_string()?)?;
        log::debug!("Saved document snapshot to {}", path.as_ref().display());
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>, registry: Arc<ModelRegistry>) -> Result<Self, DocumentError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&contents, registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::NdArray;
    use serde_json::json;
    use tempfile::tempdir;

    fn registry() -> Arc<ModelRegistry> {
        let registry = ModelRegistry::with_builtins();
        registry
            .resolve_defs(&[
                ModelDef::new("Node")
                    .module("graph")
                    .property("next", json!(["Nullable", "Ref"]), Some(json!(null))),
                ModelDef::new("Series").property("values", json!(["Array", "Number"]), None),
            ])
            .unwrap();
        Arc::new(registry)
    }

    #[test]
    fn test_float64_buffer_wire_form() {
        let mut doc = Document::new(registry());
        let values = NdArray::from_slice(&[1.0f64, 2.0, 3.0, 4.0]);
        let series = doc
            .create_model("Series", vec![("values".to_string(), Value::NdArray(values))])
            .unwrap();
        doc.add_root(&series).unwrap();

        let snapshot = doc.to_json().unwrap();
        let encoded = &snapshot.roots[0]["attributes"]["values"];
        assert_eq!(encoded["shape"], json!([4]));
        assert_eq!(encoded["dtype"], json!("float64"));
        let payload = encoded["__ndarray__"].as_str().unwrap();
        assert_eq!(crate::buffer::base64_to_buffer(payload).unwrap().len(), 32);

        let restored = Document::from_json(&snapshot, registry()).unwrap();
        match restored.get_model(&series).and_then(|m| m.get("values")) {
            Some(Value::NdArray(array)) => {
                assert_eq!(array.to_vec::<f64>().unwrap(), vec![1.0, 2.0, 3.0, 4.0])
            }
            other => panic!("expected a buffer, got {:?}", other),
        }
    }

    #[test]
    fn test_cycle_survives_snapshot() {
        let mut doc = Document::new(registry());
        let a = doc.create_model("graph.Node", Vec::new()).unwrap();
        let b = doc
            .create_model("graph.Node", vec![("next".to_string(), Value::Ref(a.clone()))])
            .unwrap();
        doc.set_attr(&a, "next", b.clone()).unwrap();
        doc.add_root(&a).unwrap();
        doc.add_root(&b).unwrap();

        let snapshot = doc.to_json().unwrap();
        assert_eq!(snapshot.roots[1], json!({"type": "object", "id": b.as_str()}));
        assert!(snapshot.defs.iter().any(|d| d.qualified_name() == "graph.Node"));

        let restored = Document::from_json(&snapshot, Arc::new(ModelRegistry::with_builtins())).unwrap();
        assert_eq!(restored.roots(), doc.roots());
        assert_eq!(restored.get_model(&a).unwrap().get("next"), Some(&Value::Ref(b.clone())));
        assert_eq!(restored.get_model(&b).unwrap().get("next"), Some(&Value::Ref(a.clone())));
        assert_eq!(restored.models().len(), 2);
    }

    #[test]
    fn test_duplicate_root_rejected() {
        let snapshot = DocJson {
            version: PROTOCOL_VERSION.to_string(),
            title: "t".to_string(),
            defs: Vec::new(),
            roots: vec![
                json!({"type": "object", "name": "Model", "id": "m1", "attributes": {}}),
                json!({"type": "object", "id": "m1"}),
            ],
        };
        let result = Document::from_json(&snapshot, Arc::new(ModelRegistry::with_builtins()));
        assert!(matches!(result, Err(DocumentError::DuplicateRoot(_))));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.json");

        let mut doc = Document::new(registry());
        doc.set_title("Saved").unwrap();
        let node = doc.create_model("graph.Node", Vec::new()).unwrap();
        doc.add_root(&node).unwrap();
        doc.save(&path).unwrap();

        let loaded = Document::load(&path, registry()).unwrap();
        assert_eq!(loaded.title(), "Saved");
        assert_eq!(loaded.roots(), &[node]);
        assert_eq!(loaded.version(), PROTOCOL_VERSION);
    }
}
