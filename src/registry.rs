//! Reference Graph Registry
//!
//! Maps qualified type names to resolved [`TypeDescriptor`]s. The registry is
//! additive: types are only ever added, and a batch of definitions either
//! registers completely or not at all.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::model::{
    DefinitionError, Instance, ModelDef, ModelId, PropertyKind, TypeDescriptor,
};
use crate::wire::{DecodeError, Deserializer, EncodeError, Value, ValueMap};

/// Looks up resolved types by qualified name.
pub trait TypeResolver {
    fn resolve_type(&self, qualified_name: &str) -> Option<Arc<TypeDescriptor>>;
}

impl TypeResolver for HashMap<String, Arc<TypeDescriptor>> {
    fn resolve_type(&self, qualified_name: &str) -> Option<Arc<TypeDescriptor>> {
        self.get(qualified_name).cloned()
    }
}

pub struct ModelRegistry {
    types: RwLock<HashMap<String, Arc<TypeDescriptor>>>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeResolver for ModelRegistry {
    fn resolve_type(&self, qualified_name: &str) -> Option<Arc<TypeDescriptor>> {
        self.lookup(qualified_name)
    }
}

impl ModelRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            types: RwLock::new(HashMap::new()),
        }
    }

    /// A registry preloaded with the `Model` and `ColumnDataSource` types.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        match builtin_types() {
            Ok(types) => {
                for descriptor in types {
                    if let Err(e) = registry.register_descriptor(descriptor) {
                        log::error!("Failed to register built-in type: {}", e);
                    }
                }
            }
            Err(e) => log::error!("Failed to build built-in types: {}", e),
        }
        registry
    }

    /// Resolve and register a single definition.
    pub fn register(&self, def: &ModelDef) -> Result<Arc<TypeDescriptor>, DefinitionError> {
        let mut resolved = self.resolve_defs(std::slice::from_ref(def))?;
        resolved
            .pop()
            .ok_or_else(|| DefinitionError::UnknownType(def.qualified_name()))
    }

    /// Register an already-built descriptor. Registering an identical type
    /// again is a no-op.
    pub fn register_descriptor(
        &self,
        descriptor: TypeDescriptor,
    ) -> Result<Arc<TypeDescriptor>, DefinitionError> {
        let mut types = self
            .types
            .write()
            .map_err(|_| DefinitionError::RegistryPoisoned)?;
        insert_checked(&mut types, Arc::new(descriptor))
    }

    /// Look up a type by name and optional module.
    pub fn resolve(
        &self,
        name: &str,
        module: Option<&str>,
    ) -> Result<Arc<TypeDescriptor>, DefinitionError> {
        let qualified = match module {
            Some(module) => format!("{module}.{name}"),
            None => name.to_string(),
        };
        self.lookup(&qualified)
            .ok_or(DefinitionError::UnknownType(qualified))
    }

    pub fn lookup(&self, qualified_name: &str) -> Option<Arc<TypeDescriptor>> {
        self.types.read().ok()?.get(qualified_name).cloned()
    }

    pub fn contains(&self, qualified_name: &str) -> bool {
        self.lookup(qualified_name).is_some()
    }

    /// Registered type names, sorted.
    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = match self.types.read() {
            Ok(types) => types.keys().cloned().collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }

    /// Create a model of a registered type with a fresh id.
    pub fn instantiate(
        &self,
        type_name: &str,
        attrs: Vec<(String, Value)>,
    ) -> Result<Instance, DefinitionError> {
        let descriptor = self
            .lookup(type_name)
            .ok_or_else(|| DefinitionError::UnknownType(type_name.to_string()))?;
        descriptor.instantiate(ModelId::new(), attrs)
    }

    /// Resolve definitions in order. A definition may use types registered
    /// earlier or defined earlier in the same batch, never later ones. Nothing
    /// is registered unless every definition resolves.
    pub fn resolve_defs(
        &self,
        defs: &[ModelDef],
    ) -> Result<Vec<Arc<TypeDescriptor>>, DefinitionError> {
        let mut staging = self
            .types
            .read()
            .map_err(|_| DefinitionError::RegistryPoisoned)?
            .clone();

        let mut resolved = Vec::with_capacity(defs.len());
        for (index, def) in defs.iter().enumerate() {
            let later: HashSet<String> = defs[index + 1..]
                .iter()
                .map(ModelDef::qualified_name)
                .collect();
            let descriptor = Arc::new(build_descriptor(def, &staging, &later)?);
            resolved.push(insert_checked(&mut staging, descriptor)?);
        }

        let mut types = self
            .types
            .write()
            .map_err(|_| DefinitionError::RegistryPoisoned)?;
        for descriptor in &resolved {
            if let Some(existing) = types.get(descriptor.qualified_name()) {
                if **existing != **descriptor {
                    return Err(DefinitionError::AlreadyRegistered(
                        descriptor.qualified_name().to_string(),
                    ));
                }
            }
        }
        for descriptor in &resolved {
            types
                .entry(descriptor.qualified_name().to_string())
                .or_insert_with(|| Arc::clone(descriptor));
        }
        log::debug!("Registered {} model definition(s)", resolved.len());
        Ok(resolved)
    }

    /// Definitions a peer needs to materialize the given types, bases and
    /// side-table types first. Built-in types are skipped.
    pub fn export_defs<S: AsRef<str>>(&self, type_names: &[S]) -> Result<Vec<ModelDef>, EncodeError> {
        let mut seen = HashSet::new();
        let mut ordered = Vec::new();
        for name in type_names {
            self.collect_chain(name.as_ref(), &mut seen, &mut ordered);
        }
        ordered.iter().map(|descriptor| descriptor.to_def()).collect()
    }

    fn collect_chain(
        &self,
        name: &str,
        seen: &mut HashSet<String>,
        ordered: &mut Vec<Arc<TypeDescriptor>>,
    ) {
        if !seen.insert(name.to_string()) {
            return;
        }
        let Some(descriptor) = self.lookup(name) else {
            return;
        };
        if let Some(base) = descriptor.base() {
            self.collect_chain(&base.qualified_name(), seen, ordered);
        }
        for template in descriptor.templates() {
            self.collect_chain(template.type_name(), seen, ordered);
        }
        if !descriptor.is_builtin() {
            ordered.push(descriptor);
        }
    }
}

fn insert_checked(
    types: &mut HashMap<String, Arc<TypeDescriptor>>,
    descriptor: Arc<TypeDescriptor>,
) -> Result<Arc<TypeDescriptor>, DefinitionError> {
    match types.get(descriptor.qualified_name()) {
        Some(existing) if **existing == *descriptor => Ok(Arc::clone(existing)),
        Some(_) => Err(DefinitionError::AlreadyRegistered(
            descriptor.qualified_name().to_string(),
        )),
        None => {
            types.insert(descriptor.qualified_name().to_string(), Arc::clone(&descriptor));
            Ok(descriptor)
        }
    }
}

fn build_descriptor(
    def: &ModelDef,
    types: &HashMap<String, Arc<TypeDescriptor>>,
    later: &HashSet<String>,
) -> Result<TypeDescriptor, DefinitionError> {
    let qualified = def.qualified_name();
    let missing = |type_name: String| {
        if later.contains(&type_name) {
            DefinitionError::ForwardReference {
                name: qualified.clone(),
                type_name,
            }
        } else {
            DefinitionError::UnknownType(type_name)
        }
    };

    let base = match &def.extends {
        Some(base) => {
            let base_name = base.qualified_name();
            let descriptor = types.get(&base_name).cloned().ok_or_else(|| {
                if later.contains(&base_name) {
                    missing(base_name.clone())
                } else {
                    DefinitionError::UnresolvedBase {
                        name: qualified.clone(),
                        base: base_name.clone(),
                    }
                }
            })?;
            Some(descriptor)
        }
        None => None,
    };

    let mut builder = TypeDescriptor::builder(def.name.clone()).module(def.module.clone());
    let mut known_ids: HashSet<ModelId> = def.references.iter().map(|r| r.id.clone()).collect();
    if let Some(base) = &base {
        builder = builder.extends(base);
        known_ids.extend(base.templates().iter().map(|t| t.id().clone()));
    }

    let mut de = Deserializer::new(types).with_known_ids(known_ids);
    let mut templates = Vec::new();
    for reference in &def.references {
        let template_type = types
            .get(&reference.type_name)
            .cloned()
            .ok_or_else(|| missing(reference.type_name.clone()))?;
        let mut attrs = Vec::with_capacity(reference.attributes.len());
        for (name, value) in &reference.attributes {
            let value = de.decode(value).map_err(|e| default_error(&qualified, e))?;
            attrs.push((name.clone(), value));
        }
        let instance = template_type.instantiate(reference.id.clone(), attrs)?;
        templates.push(instance.model);
        templates.extend(instance.defaults);
    }

    for property in &def.properties {
        let kind = PropertyKind::from_json(&property.kind)?;
        let default = match &property.default {
            Some(json) => Some(de.decode(json).map_err(|e| default_error(&qualified, e))?),
            None => None,
        };
        builder = builder.property(property.name.clone(), kind, default);
    }

    for override_def in &def.overrides {
        let default = de
            .decode(&override_def.default)
            .map_err(|e| default_error(&qualified, e))?;
        builder = builder.override_default(override_def.name.clone(), default);
    }

    let inline = de.finish().map_err(|e| default_error(&qualified, e))?;
    templates.extend(inline);
    builder.templates(templates).build()
}

fn default_error(name: &str, error: DecodeError) -> DefinitionError {
    match error {
        DecodeError::UnresolvedReference(id) => DefinitionError::UnknownReference {
            name: name.to_string(),
            id,
        },
        DecodeError::Definition(e) => e,
        other => DefinitionError::InvalidDefault {
            name: name.to_string(),
            reason: other.to_string(),
        },
    }
}

fn builtin_types() -> Result<Vec<TypeDescriptor>, DefinitionError> {
    let model = TypeDescriptor::builder("Model")
        .property("name", PropertyKind::nullable(PropertyKind::String), Some(Value::Null))
        .property("tags", PropertyKind::array(PropertyKind::Any), Some(Value::List(Vec::new())))
        .builtin()
        .build()?;
    let source = TypeDescriptor::builder("ColumnDataSource")
        .extends(&model)
        .property(
            "data",
            PropertyKind::dict(PropertyKind::Any),
            Some(Value::Map(ValueMap::new())),
        )
        .builtin()
        .build()?;
    Ok(vec![model, source])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn range_defs() -> Vec<ModelDef> {
        vec![
            ModelDef::new("Range")
                .module("ranges")
                .property("start", json!("Number"), Some(json!(0)))
                .property("end", json!("Number"), Some(json!(1))),
            ModelDef::new("Range1d")
                .module("ranges")
                .extends("Range", Some("ranges"))
                .property("bounds", json!(["Nullable", ["Tuple", "Number", "Number"]]), Some(json!(null)))
                .override_default("end", json!(10)),
        ]
    }

    #[test]
    fn test_property_order_is_base_first() {
        let registry = ModelRegistry::new();
        registry.resolve_defs(&range_defs()).unwrap();

        let range = registry.resolve("Range1d", Some("ranges")).unwrap();
        let names: Vec<&str> = range.property_names().collect();
        assert_eq!(names, vec!["start", "end", "bounds"]);
        assert_eq!(range.property("end").unwrap().default, Some(Value::Int(10)));

        let base = registry.resolve("Range", Some("ranges")).unwrap();
        assert_eq!(base.property("end").unwrap().default, Some(Value::Int(1)));
    }

    #[test]
    fn test_batch_is_all_or_nothing() {
        let registry = ModelRegistry::new();
        let defs = vec![
            ModelDef::new("Good").property("x", json!("Int"), None),
            ModelDef::new("Bad").extends("Missing", None),
        ];
        let result = registry.resolve_defs(&defs);
        assert!(matches!(result, Err(DefinitionError::UnresolvedBase { .. })));
        assert!(!registry.contains("Good"));
    }

    #[test]
    fn test_forward_reference_rejected() {
        let registry = ModelRegistry::new();
        let defs = vec![
            ModelDef::new("Plot")
                .property("x_range", json!("Ref"), Some(json!({"id": "r1"})))
                .reference("r1", "Range", serde_json::Map::new()),
            ModelDef::new("Range").property("start", json!("Number"), Some(json!(0))),
        ];
        let result = registry.resolve_defs(&defs);
        assert!(matches!(result, Err(DefinitionError::ForwardReference { .. })));

        let extends_later = vec![ModelDef::new("Sub").extends("Base", None), ModelDef::new("Base")];
        assert!(matches!(
            registry.resolve_defs(&extends_later),
            Err(DefinitionError::ForwardReference { .. })
        ));
    }

    #[test]
    fn test_side_table_defaults() {
        let registry = ModelRegistry::new();
        let mut attributes = serde_json::Map::new();
        attributes.insert("start".to_string(), json!(5));
        let defs = vec![
            ModelDef::new("Range").property("start", json!("Number"), Some(json!(0))),
            ModelDef::new("Plot")
                .property("x_range", json!("Ref"), Some(json!({"id": "r1"})))
                .reference("r1", "Range", attributes),
        ];
        registry.resolve_defs(&defs).unwrap();

        let plot = registry.instantiate("Plot", Vec::new()).unwrap();
        let range_id = plot.model.get("x_range").and_then(Value::as_ref_id).unwrap().clone();
        assert_eq!(range_id.as_str(), format!("{}/r1", plot.model.id()));
        assert_eq!(plot.defaults.len(), 1);
        assert_eq!(plot.defaults[0].id(), &range_id);
        assert_eq!(plot.defaults[0].get("start"), Some(&Value::Int(5)));
    }

    #[test]
    fn test_default_reference_must_be_in_side_table() {
        let registry = ModelRegistry::new();
        let def = ModelDef::new("Plot").property("x_range", json!("Ref"), Some(json!({"id": "nowhere"})));
        assert!(matches!(
            registry.register(&def),
            Err(DefinitionError::UnknownReference { .. })
        ));
    }

    #[test]
    fn test_reregistration() {
        let registry = ModelRegistry::new();
        let def = ModelDef::new("Label").property("text", json!("String"), Some(json!("")));
        registry.register(&def).unwrap();
        registry.register(&def).unwrap();

        let changed = ModelDef::new("Label").property("text", json!("String"), Some(json!("x")));
        assert!(matches!(
            registry.register(&changed),
            Err(DefinitionError::AlreadyRegistered(_))
        ));
    }

    #[test]
    fn test_exported_defs_resolve_identically() {
        let source = ModelRegistry::with_builtins();
        let mut attributes = serde_json::Map::new();
        attributes.insert("start".to_string(), json!(-1));
        let mut defs = range_defs();
        defs.push(
            ModelDef::new("Plot")
                .extends("Model", None)
                .property("x_range", json!(["Ref", "ranges.Range1d"]), Some(json!({"id": "xr"})))
                .reference("xr", "ranges.Range1d", attributes),
        );
        source.resolve_defs(&defs).unwrap();

        let exported = source.export_defs(&["Plot"]).unwrap();
        let names: Vec<String> = exported.iter().map(ModelDef::qualified_name).collect();
        assert_eq!(names, vec!["ranges.Range", "ranges.Range1d", "Plot"]);

        let target = ModelRegistry::with_builtins();
        target.resolve_defs(&exported).unwrap();
        for name in &names {
            assert_eq!(target.lookup(name), source.lookup(name));
        }
        source.resolve_defs(&exported).unwrap();
    }

    #[test]
    fn test_builtins() {
        let registry = ModelRegistry::with_builtins();
        let source = registry.resolve("ColumnDataSource", None).unwrap();
        let names: Vec<&str> = source.property_names().collect();
        assert_eq!(names, vec!["name", "tags", "data"]);
        assert!(source.is_builtin());
        assert!(registry.export_defs(&["ColumnDataSource"]).unwrap().is_empty());
    }
}
