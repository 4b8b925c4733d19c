//! Resource type models.
//!
//! A [TypeDef] names a resource type, an optional supertype, the value kind the type carries (for
//! value resources such as `Float`), and the *optional elements* the type declares: child slots
//! with a fixed name and type. Children with any other name are decorators and may have any type.
//!
//! Models are registered programmatically or loaded from TOML:
//!
//! ```toml
//! [[types]]
//! name = "TemperatureSensor"
//! extends = "Sensor"
//! [types.elements]
//! reading = "Float"
//! ```
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt,
    path::Path,
};

use crate::{error::PatternError, properties::ValueKind};

/// Name of the type every other type extends.
pub const BASE_TYPE: &str = "Resource";

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeName(pub String);

impl TypeName {
    pub fn new(name: &str) -> TypeName {
        TypeName(name.to_string())
    }

    pub fn base() -> TypeName {
        TypeName::new(BASE_TYPE)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TypeName {
    fn from(name: &str) -> Self {
        TypeName::new(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDef {
    pub name: TypeName,
    #[serde(default)]
    pub extends: Option<TypeName>,
    #[serde(default)]
    pub value: Option<ValueKind>,
    #[serde(default)]
    pub elements: BTreeMap<String, TypeName>,
}

impl TypeDef {
    pub fn new(name: &str) -> TypeDef {
        TypeDef {
            name: TypeName::new(name),
            extends: None,
            value: None,
            elements: BTreeMap::new(),
        }
    }

    pub fn extends(mut self, parent: &str) -> TypeDef {
        self.extends = Some(TypeName::new(parent));
        self
    }

    pub fn with_value(mut self, kind: ValueKind) -> TypeDef {
        self.value = Some(kind);
        self
    }

    pub fn element(mut self, name: &str, type_name: &str) -> TypeDef {
        self.elements
            .insert(name.to_string(), TypeName::new(type_name));
        self
    }
}

static BUILTIN_TYPES: Lazy<Vec<TypeDef>> = Lazy::new(|| {
    vec![
        TypeDef::new(BASE_TYPE),
        TypeDef::new("Float").with_value(ValueKind::Float),
        TypeDef::new("Integer").with_value(ValueKind::Integer),
        TypeDef::new("Boolean").with_value(ValueKind::Boolean),
        TypeDef::new("String").with_value(ValueKind::String),
        TypeDef::new("Time").with_value(ValueKind::Time),
    ]
});

#[derive(Debug, Deserialize)]
struct ModelFile {
    #[serde(default)]
    types: Vec<TypeDef>,
}

/// Registry of known resource types. Every registry contains the built-in value types and the base
/// type `Resource`.
#[derive(Clone, Debug)]
pub struct TypeRegistry {
    types: BTreeMap<TypeName, TypeDef>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        let types = BUILTIN_TYPES
            .iter()
            .map(|def| (def.name.clone(), def.clone()))
            .collect();
        TypeRegistry { types }
    }
}

impl TypeRegistry {
    pub fn from_toml_str(content: &str) -> Result<TypeRegistry, PatternError> {
        let mut registry = TypeRegistry::default();
        registry.load_toml_str(content)?;
        Ok(registry)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<TypeRegistry, PatternError> {
        tracing::debug!("Reading resource models from {:?}", path.as_ref());
        let content = std::fs::read_to_string(path)?;
        TypeRegistry::from_toml_str(&content)
    }

    /// Adds every type of a TOML model file. Types may reference each other in any order within
    /// the file; references are validated once the whole file is loaded.
    pub fn load_toml_str(&mut self, content: &str) -> Result<(), PatternError> {
        let file: ModelFile = toml::from_str(content)?;
        let mut staged = self.clone();
        for def in file.types {
            staged.insert_unchecked(def)?;
        }
        staged.validate()?;
        *self = staged;
        Ok(())
    }

    pub fn register(&mut self, def: TypeDef) -> Result<(), PatternError> {
        let mut staged = self.clone();
        staged.insert_unchecked(def)?;
        staged.validate()?;
        *self = staged;
        Ok(())
    }

    fn insert_unchecked(&mut self, def: TypeDef) -> Result<(), PatternError> {
        if BUILTIN_TYPES.iter().any(|builtin| builtin.name == def.name) {
            return Err(PatternError::Usage(format!(
                "built-in type {} cannot be redefined",
                def.name
            )));
        }
        self.types.insert(def.name.clone(), def);
        Ok(())
    }

    fn validate(&self) -> Result<(), PatternError> {
        for def in self.types.values() {
            if let Some(parent) = &def.extends {
                self.require(parent)?;
            }
            for element_type in def.elements.values() {
                self.require(element_type)?;
            }
            // walking the supertype chain detects `extends` cycles
            let mut seen = vec![def.name.clone()];
            let mut current = def.extends.clone();
            while let Some(name) = current {
                if seen.contains(&name) {
                    return Err(PatternError::Usage(format!(
                        "type {} has a cyclic supertype chain",
                        def.name
                    )));
                }
                current = self.types.get(&name).and_then(|d| d.extends.clone());
                seen.push(name);
            }
        }
        Ok(())
    }

    pub fn contains(&self, name: &TypeName) -> bool {
        self.types.contains_key(name)
    }

    pub fn get(&self, name: &TypeName) -> Option<&TypeDef> {
        self.types.get(name)
    }

    pub fn require(&self, name: &TypeName) -> Result<&TypeDef, PatternError> {
        self.types
            .get(name)
            .ok_or_else(|| PatternError::UnknownType(name.to_string()))
    }

    /// True if `sub` is `sup` or (transitively) extends it. Every type is a `Resource`.
    pub fn is_a(&self, sub: &TypeName, sup: &TypeName) -> bool {
        if sup.as_str() == BASE_TYPE {
            return true;
        }
        let mut current = Some(sub);
        while let Some(name) = current {
            if name == sup {
                return true;
            }
            current = self.types.get(name).and_then(|def| def.extends.as_ref());
        }
        false
    }

    /// The value kind of a type, inherited along the supertype chain.
    pub fn value_kind(&self, name: &TypeName) -> Option<ValueKind> {
        let mut current = Some(name);
        while let Some(name) = current {
            let def = self.types.get(name)?;
            if def.value.is_some() {
                return def.value;
            }
            current = def.extends.as_ref();
        }
        None
    }

    /// The declared type of optional element `element` of `owner`, searching supertypes.
    pub fn element_type(&self, owner: &TypeName, element: &str) -> Option<&TypeName> {
        let mut current = Some(owner);
        while let Some(name) = current {
            let def = self.types.get(name)?;
            if let Some(found) = def.elements.get(element) {
                return Some(found);
            }
            current = def.extends.as_ref();
        }
        None
    }

    /// Checks that a child named `name` of type `child` may live below a resource of type `owner`.
    /// Declared elements must match their declared type, anything else is a decorator.
    pub fn check_child(
        &self,
        owner: &TypeName,
        name: &str,
        child: &TypeName,
    ) -> Result<(), PatternError> {
        self.require(child)?;
        match self.element_type(owner, name) {
            Some(declared) if !self.is_a(child, declared) => Err(PatternError::TypeMismatch {
                expected: format!("{declared} for element {owner}.{name}"),
                found: child.to_string(),
            }),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODELS: &str = r#"
[[types]]
name = "Room"
[types.elements]
temperatureSensor = "TemperatureSensor"
name = "String"

[[types]]
name = "Sensor"
[types.elements]
reading = "Float"

[[types]]
name = "TemperatureSensor"
extends = "Sensor"
[types.elements]
upperLimit = "Float"
"#;

    #[test]
    fn loads_models_in_any_order() {
        let registry = TypeRegistry::from_toml_str(MODELS).unwrap();
        let sensor = TypeName::new("TemperatureSensor");
        assert!(registry.is_a(&sensor, &TypeName::new("Sensor")));
        assert!(registry.is_a(&sensor, &TypeName::base()));
        assert!(!registry.is_a(&TypeName::new("Sensor"), &sensor));
        assert_eq!(
            registry.element_type(&sensor, "reading"),
            Some(&TypeName::new("Float"))
        );
        assert_eq!(
            registry.value_kind(&TypeName::new("Float")),
            Some(ValueKind::Float)
        );
    }

    #[test]
    fn rejects_unknown_and_cyclic_types() {
        let unknown = r#"
[[types]]
name = "Heater"
extends = "Device"
"#;
        assert_eq!(
            TypeRegistry::from_toml_str(unknown).unwrap_err(),
            PatternError::UnknownType("Device".to_string())
        );

        let mut registry = TypeRegistry::default();
        registry.register(TypeDef::new("A")).unwrap();
        registry.register(TypeDef::new("B").extends("A")).unwrap();
        let err = registry.register(TypeDef::new("A").extends("B")).unwrap_err();
        assert!(err.is_usage_error());
        // a failed registration leaves the registry untouched
        assert_eq!(registry.get(&TypeName::new("A")).unwrap().extends, None);
    }

    #[test]
    fn element_types_are_enforced() {
        let registry = TypeRegistry::from_toml_str(MODELS).unwrap();
        let room = TypeName::new("Room");
        assert!(registry
            .check_child(&room, "temperatureSensor", &TypeName::new("TemperatureSensor"))
            .is_ok());
        assert!(matches!(
            registry.check_child(&room, "temperatureSensor", &TypeName::new("Float")),
            Err(PatternError::TypeMismatch { .. })
        ));
        // decorators may have any type
        assert!(registry
            .check_child(&room, "comment", &TypeName::new("String"))
            .is_ok());
    }
}
