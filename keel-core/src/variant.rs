//! Variant - Schemas for the concrete shapes of a discriminated type
//!
//! A discriminated type (e.g. the `source` of a database home creation
//! request) has a fixed set of variants, each selected by a discriminator
//! value and carrying its own set of fields.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::decoder::DecodeError;
use crate::value::Value;

/// Semantic type of a variant field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Bool,
    List,
    Object,
}

impl FieldType {
    /// Check if a present, non-null value conforms to this type
    pub fn accepts(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (FieldType::String, Value::String(_))
                | (FieldType::Number, Value::Int(_) | Value::Float(_))
                | (FieldType::Bool, Value::Bool(_))
                | (FieldType::List, Value::List(_))
                | (FieldType::Object, Value::Map(_))
        )
    }

    /// Value used for an absent optional field, if this type has one
    pub fn empty_value(&self) -> Option<Value> {
        match self {
            FieldType::List => Some(Value::List(Vec::new())),
            FieldType::Object => Some(Value::Map(HashMap::new())),
            _ => None,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::String => "String",
            FieldType::Number => "Number",
            FieldType::Bool => "Bool",
            FieldType::List => "List",
            FieldType::Object => "Object",
        };
        write!(f, "{}", name)
    }
}

/// One field of a variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub mandatory: bool,
}

impl FieldSchema {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            mandatory: false,
        }
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }
}

/// A registered decode target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantSchema {
    /// The tag that selects this variant (e.g. "DB_BACKUP")
    pub discriminator_value: String,
    /// Fields in declaration order
    #[serde(default)]
    pub fields: Vec<FieldSchema>,
}

impl VariantSchema {
    pub fn new(discriminator_value: impl Into<String>) -> Self {
        Self {
            discriminator_value: discriminator_value.into(),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, field: FieldSchema) -> Self {
        self.fields.push(field);
        self
    }

    pub fn get_field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Registry of the variants of one discriminated type
///
/// Built once at start-up and then shared read-only (typically behind an
/// `Arc`). Each discriminator value can be registered only once.
#[derive(Debug, Clone)]
pub struct VariantRegistry {
    type_name: String,
    variants: HashMap<String, VariantSchema>,
}

impl VariantRegistry {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            variants: HashMap::new(),
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Add a variant. Fails if its discriminator value is already taken.
    pub fn register(&mut self, variant: VariantSchema) -> Result<(), DecodeError> {
        if self.variants.contains_key(&variant.discriminator_value) {
            return Err(DecodeError::DuplicateDiscriminator {
                type_name: self.type_name.clone(),
                value: variant.discriminator_value,
            });
        }
        log::debug!(
            "registered variant {}.{}",
            self.type_name,
            variant.discriminator_value
        );
        self.variants
            .insert(variant.discriminator_value.clone(), variant);
        Ok(())
    }

    /// Builder form of `register`
    pub fn with_variant(mut self, variant: VariantSchema) -> Result<Self, DecodeError> {
        self.register(variant)?;
        Ok(self)
    }

    pub fn get(&self, discriminator_value: &str) -> Option<&VariantSchema> {
        self.variants.get(discriminator_value)
    }

    /// Registered discriminator values, sorted
    pub fn discriminator_values(&self) -> Vec<&str> {
        let mut values: Vec<&str> = self.variants.keys().map(String::as_str).collect();
        values.sort();
        values
    }

    pub fn len(&self) -> usize {
        self.variants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }

    /// Build a registry from its serialized definition
    pub fn from_definition(definition: RegistryDefinition) -> Result<Self, DecodeError> {
        let mut registry = Self::new(definition.type_name);
        for variant in definition.variants {
            registry.register(variant)?;
        }
        Ok(registry)
    }
}

/// Serialized form of a registry (as loaded from a JSON file)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryDefinition {
    pub type_name: String,
    /// Field that carries the discriminator in records of this type
    #[serde(default)]
    pub discriminator: Option<String>,
    pub variants: Vec<VariantSchema>,
}
