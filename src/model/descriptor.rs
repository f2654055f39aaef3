//! Resolved, immutable model types.

use std::collections::HashMap;

use super::definition::qualify;
use super::{DefinitionError, Model, ModelDef, ModelId, OverrideDef, PropertyDef, PropertyKind, ReferenceDef, TypeRef};
use crate::wire::{EncodeError, Serializer, Value};

#[derive(Clone, Debug, PartialEq)]
pub struct PropertyDescriptor {
    pub name: String,
    pub kind: PropertyKind,
    pub default: Option<Value>,
}

/// A resolved model type.
///
/// Properties are ordered base-first: every inherited property keeps its
/// position, then the type's own properties follow in declaration order.
/// Overrides change a default in place and never reorder.
#[derive(Clone, Debug, PartialEq)]
pub struct TypeDescriptor {
    name: String,
    module: Option<String>,
    qualified: String,
    base: Option<TypeRef>,
    properties: Vec<PropertyDescriptor>,
    inherited: usize,
    overridden: Vec<String>,
    /// Side-table instances that defaults may reference.
    templates: Vec<Model>,
    inherited_templates: usize,
    builtin: bool,
}

/// A freshly instantiated model together with the copies of side-table
/// instances its defaults pulled in.
#[derive(Clone, Debug, PartialEq)]
pub struct Instance {
    pub model: Model,
    pub defaults: Vec<Model>,
}

impl TypeDescriptor {
    pub fn builder(name: impl Into<String>) -> TypeDescriptorBuilder {
        let name = name.into();
        TypeDescriptorBuilder {
            descriptor: TypeDescriptor {
                qualified: name.clone(),
                name,
                module: None,
                base: None,
                properties: Vec::new(),
                inherited: 0,
                overridden: Vec::new(),
                templates: Vec::new(),
                inherited_templates: 0,
                builtin: false,
            },
            error: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module(&self) -> Option<&str> {
        self.module.as_deref()
    }

    /// `module.name`, or just `name` without a module.
    pub fn qualified_name(&self) -> &str {
        &self.qualified
    }

    pub fn base(&self) -> Option<&TypeRef> {
        self.base.as_ref()
    }

    pub fn properties(&self) -> &[PropertyDescriptor] {
        &self.properties
    }

    pub fn own_properties(&self) -> &[PropertyDescriptor] {
        &self.properties[self.inherited..]
    }

    pub fn property(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn property_names(&self) -> impl Iterator<Item = &str> {
        self.properties.iter().map(|p| p.name.as_str())
    }

    pub fn templates(&self) -> &[Model] {
        &self.templates
    }

    pub fn is_builtin(&self) -> bool {
        self.builtin
    }

    /// Create a model of this type with the given id.
    ///
    /// Supplied attributes must be declared and satisfy their kinds; every
    /// other property takes its default, or null when it has none.
    pub fn instantiate(
        &self,
        id: ModelId,
        attrs: Vec<(String, Value)>,
    ) -> Result<Instance, DefinitionError> {
        let mut supplied = Vec::with_capacity(attrs.len());
        for (name, value) in attrs {
            let property = self.property(&name).ok_or_else(|| DefinitionError::UnknownProperty {
                type_name: self.qualified.clone(),
                property: name.clone(),
            })?;
            if !property.kind.validate(&value) {
                return Err(DefinitionError::InvalidValue {
                    type_name: self.qualified.clone(),
                    property: name,
                    kind: property.kind.to_string(),
                });
            }
            supplied.push((name, value));
        }

        let mut cloner = TemplateCloner::new(&id, &self.templates);
        let mut attributes = Vec::with_capacity(self.properties.len());
        for property in &self.properties {
            let value = match supplied.iter().position(|(name, _)| name == &property.name) {
                Some(index) => supplied.swap_remove(index).1,
                None => match &property.default {
                    Some(default) => cloner.materialize(default),
                    None => Value::Null,
                },
            };
            attributes.push((property.name.clone(), value));
        }
        let defaults = cloner.finish();

        Ok(Instance {
            model: Model::from_parts(id, self.qualified.clone(), attributes),
            defaults,
        })
    }

    /// Export this type back into its wire definition. Only the type's own
    /// properties, overrides and side-table entries are included.
    pub fn to_def(&self) -> Result<ModelDef, EncodeError> {
        let mut serializer = Serializer::detached();
        let mut def = ModelDef::new(self.name.clone());
        def.module = self.module.clone();
        def.extends = self.base.clone();

        for property in self.own_properties() {
            def.properties.push(PropertyDef {
                name: property.name.clone(),
                kind: property.kind.to_json(),
                default: property
                    .default
                    .as_ref()
                    .map(|value| serializer.encode(value))
                    .transpose()?,
            });
        }

        for name in &self.overridden {
            let default = match self.property(name).and_then(|p| p.default.as_ref()) {
                Some(value) => serializer.encode(value)?,
                None => serde_json::Value::Null,
            };
            def.overrides.push(OverrideDef {
                name: name.clone(),
                default,
            });
        }

        for template in &self.templates[self.inherited_templates..] {
            let mut attributes = serde_json::Map::new();
            for (name, value) in template.attributes() {
                attributes.insert(name.to_string(), serializer.encode(value)?);
            }
            def.references.push(ReferenceDef {
                id: template.id().clone(),
                type_name: template.type_name().to_string(),
                attributes,
            });
        }

        Ok(def)
    }
}

/// Copies side-table instances referenced by defaults, giving each copy an
/// id derived from the owning model so copies are never shared between
/// instances.
struct TemplateCloner<'a> {
    owner: &'a ModelId,
    templates: &'a [Model],
    cloned: HashMap<ModelId, ModelId>,
    pending: Vec<ModelId>,
}

impl<'a> TemplateCloner<'a> {
    fn new(owner: &'a ModelId, templates: &'a [Model]) -> Self {
        Self {
            owner,
            templates,
            cloned: HashMap::new(),
            pending: Vec::new(),
        }
    }

    fn materialize(&mut self, default: &Value) -> Value {
        let mut value = default.clone();
        value.remap_refs(&mut |id: &ModelId| self.clone_id(id));
        value
    }

    fn clone_id(&mut self, id: &ModelId) -> Option<ModelId> {
        if !self.templates.iter().any(|t| t.id() == id) {
            return None;
        }
        if let Some(copy) = self.cloned.get(id) {
            return Some(copy.clone());
        }
        let copy = ModelId::from(format!("{}/{}", self.owner, id));
        self.cloned.insert(id.clone(), copy.clone());
        self.pending.push(id.clone());
        Some(copy)
    }

    fn finish(mut self) -> Vec<Model> {
        let templates = self.templates;
        let mut copies = Vec::new();
        while let Some(source) = self.pending.pop() {
            let Some(template) = templates.iter().find(|t| t.id() == &source) else {
                continue;
            };
            let mut copy = template.clone();
            if let Some(id) = self.cloned.get(&source) {
                copy.id = id.clone();
            }
            for (_, value) in copy.attributes.iter_mut() {
                value.remap_refs(&mut |id: &ModelId| self.clone_id(id));
            }
            copies.push(copy);
        }
        copies
    }
}

/// Builder for [`TypeDescriptor`]. Errors are collected and reported by
/// [`TypeDescriptorBuilder::build`].
pub struct TypeDescriptorBuilder {
    descriptor: TypeDescriptor,
    error: Option<DefinitionError>,
}

impl TypeDescriptorBuilder {
    pub fn module(mut self, module: Option<String>) -> Self {
        self.descriptor.qualified = qualify(&self.descriptor.name, module.as_deref());
        self.descriptor.module = module;
        self
    }

    /// Inherit every property and side-table entry of `base`, ahead of
    /// anything declared on this builder.
    pub fn extends(mut self, base: &TypeDescriptor) -> Self {
        self.descriptor.base = Some(TypeRef {
            name: base.name.clone(),
            module: base.module.clone(),
        });

        let own = std::mem::take(&mut self.descriptor.properties);
        self.descriptor.properties = base.properties.clone();
        self.descriptor.inherited = base.properties.len();
        for property in own {
            self = self.property(property.name, property.kind, property.default);
        }

        let own_templates = std::mem::take(&mut self.descriptor.templates);
        self.descriptor.templates = base.templates.clone();
        self.descriptor.inherited_templates = base.templates.len();
        self.descriptor.templates.extend(own_templates);
        self
    }

    pub fn property(
        mut self,
        name: impl Into<String>,
        kind: PropertyKind,
        default: Option<Value>,
    ) -> Self {
        let name = name.into();
        if self.descriptor.property(&name).is_some() {
            self.fail(DefinitionError::DuplicateProperty {
                type_name: self.descriptor.qualified.clone(),
                property: name,
            });
            return self;
        }
        self.descriptor.properties.push(PropertyDescriptor {
            name,
            kind,
            default,
        });
        self
    }

    /// Replace the default of an existing property without moving it.
    pub fn override_default(mut self, name: impl Into<String>, default: Value) -> Self {
        let name = name.into();
        let position = self.descriptor.properties.iter().position(|p| p.name == name);
        match position {
            Some(index) => {
                self.descriptor.properties[index].default = Some(default);
                if !self.descriptor.overridden.contains(&name) {
                    self.descriptor.overridden.push(name);
                }
            }
            None => {
                let error = DefinitionError::UnknownProperty {
                    type_name: self.descriptor.qualified.clone(),
                    property: name,
                };
                self.fail(error);
            }
        }
        self
    }

    pub fn templates(mut self, templates: Vec<Model>) -> Self {
        self.descriptor.templates.extend(templates);
        self
    }

    pub(crate) fn builtin(mut self) -> Self {
        self.descriptor.builtin = true;
        self
    }

    pub fn build(self) -> Result<TypeDescriptor, DefinitionError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        let descriptor = self.descriptor;
        for property in &descriptor.properties {
            if let Some(default) = &property.default {
                if !property.kind.validate(default) {
                    return Err(DefinitionError::InvalidDefault {
                        name: descriptor.qualified.clone(),
                        reason: format!(
                            "default of '{}' does not match kind {}",
                            property.name, property.kind
                        ),
                    });
                }
            }
        }
        Ok(descriptor)
    }

    fn fail(&mut self, error: DefinitionError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range() -> TypeDescriptor {
        TypeDescriptor::builder("Range")
            .property("start", PropertyKind::Number, Some(Value::Int(0)))
            .property("end", PropertyKind::Number, Some(Value::Int(1)))
            .build()
            .unwrap()
    }

    #[test]
    fn test_base_properties_come_first() {
        let base = range();
        let padded = TypeDescriptor::builder("PaddedRange")
            .module(Some("ranges".to_string()))
            .extends(&base)
            .property("padding", PropertyKind::Number, Some(Value::Float(0.1)))
            .override_default("start", Value::Int(-1))
            .build()
            .unwrap();

        let names: Vec<&str> = padded.property_names().collect();
        assert_eq!(names, vec!["start", "end", "padding"]);
        assert_eq!(padded.qualified_name(), "ranges.PaddedRange");
        assert_eq!(padded.property("start").unwrap().default, Some(Value::Int(-1)));
        assert_eq!(padded.own_properties().len(), 1);
    }

    #[test]
    fn test_builder_errors() {
        let duplicate = TypeDescriptor::builder("Range")
            .extends(&range())
            .property("end", PropertyKind::Int, None)
            .build();
        assert!(matches!(duplicate, Err(DefinitionError::DuplicateProperty { .. })));

        let unknown = TypeDescriptor::builder("Range2")
            .override_default("missing", Value::Null)
            .build();
        assert!(matches!(unknown, Err(DefinitionError::UnknownProperty { .. })));

        let bad_default = TypeDescriptor::builder("Label")
            .property("text", PropertyKind::String, Some(Value::Int(3)))
            .build();
        assert!(matches!(bad_default, Err(DefinitionError::InvalidDefault { .. })));
    }

    #[test]
    fn test_instantiate_fills_defaults_in_order() {
        let descriptor = range();
        let instance = descriptor
            .instantiate(ModelId::from("r1"), vec![("end".to_string(), Value::Int(10))])
            .unwrap();
        let attrs: Vec<(&str, &Value)> = instance.model.attributes().collect();
        assert_eq!(attrs, vec![("start", &Value::Int(0)), ("end", &Value::Int(10))]);

        let wrong = descriptor.instantiate(
            ModelId::from("r2"),
            vec![("end".to_string(), Value::string("far"))],
        );
        assert!(matches!(wrong, Err(DefinitionError::InvalidValue { .. })));
    }

    #[test]
    fn test_template_defaults_are_copied_per_instance() {
        let node = TypeDescriptor::builder("Node")
            .property("next", PropertyKind::nullable(PropertyKind::Ref(None)), Some(Value::Null))
            .build()
            .unwrap();
        let a = node
            .instantiate(ModelId::from("a"), vec![("next".to_string(), Value::Ref(ModelId::from("b")))])
            .unwrap()
            .model;
        let b = node
            .instantiate(ModelId::from("b"), vec![("next".to_string(), Value::Ref(ModelId::from("a")))])
            .unwrap()
            .model;

        let list = TypeDescriptor::builder("List")
            .property("head", PropertyKind::Ref(None), Some(Value::Ref(ModelId::from("a"))))
            .templates(vec![a, b])
            .build()
            .unwrap();

        let first = list.instantiate(ModelId::from("l1"), Vec::new()).unwrap();
        let second = list.instantiate(ModelId::from("l2"), Vec::new()).unwrap();

        assert_eq!(first.model.get("head"), Some(&Value::Ref(ModelId::from("l1/a"))));
        assert_eq!(second.model.get("head"), Some(&Value::Ref(ModelId::from("l2/a"))));
        assert_eq!(first.defaults.len(), 2);

        let copy_of_b = first
            .defaults
            .iter()
            .find(|m| m.id() == &ModelId::from("l1/b"))
            .unwrap();
        assert_eq!(copy_of_b.get("next"), Some(&Value::Ref(ModelId::from("l1/a"))));
    }

    #[test]
    fn test_to_def_exports_own_layer() {
        let base = range();
        let padded = TypeDescriptor::builder("PaddedRange")
            .extends(&base)
            .property("padding", PropertyKind::Number, None)
            .override_default("end", Value::Int(5))
            .build()
            .unwrap();
        let def = padded.to_def().unwrap();
        assert_eq!(def.extends.as_ref().map(|b| b.name.as_str()), Some("Range"));
        assert_eq!(def.properties.len(), 1);
        assert_eq!(def.properties[0].default, None);
        assert_eq!(def.overrides[0].default, serde_json::json!(5));
    }
}
