//! Decoder - Interpret a record as one variant of a discriminated type
//!
//! The decoder reads the discriminator field of a record, looks the value up
//! in a `VariantRegistry` and validates the record against the selected
//! variant. Unregistered discriminator values are not an error: they decode
//! to `Decoded::Unknown` carrying the raw record, so that variants added on
//! the server side do not break older clients.

use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::value::{Record, Value, record_to_json};
use crate::variant::{FieldType, VariantRegistry, VariantSchema};

/// Reason a field failed validation
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Violation {
    #[error("mandatory field is missing")]
    Missing,

    #[error("mandatory field is null")]
    Null,

    #[error("expected {expected}, got {got}")]
    TypeMismatch {
        expected: FieldType,
        got: &'static str,
    },
}

/// Decode error
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("Discriminator value '{value}' is already registered for {type_name}")]
    DuplicateDiscriminator { type_name: String, value: String },

    #[error("Discriminator field '{field}' is missing")]
    MissingDiscriminator { field: String },

    #[error("Discriminator field '{field}' must be a string, got {got}")]
    InvalidDiscriminator { field: String, got: &'static str },

    #[error("Variant '{variant}' field '{field}': {reason}")]
    SchemaViolation {
        variant: String,
        field: String,
        reason: Violation,
    },

    #[error("Variant '{variant}' could not be converted: {message}")]
    Deserialize { variant: String, message: String },
}

/// A record that matched a registered variant
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedVariant {
    /// Discriminator value of the matched variant
    pub tag: String,
    /// Name of the discriminator field in the source record
    pub discriminator_field: String,
    /// Fields declared by the variant, in declaration order. Absent optional
    /// scalars are left out; absent optional lists and objects are empty.
    pub fields: Vec<(String, Value)>,
    /// Record entries the variant does not declare
    pub extra: Record,
}

impl DecodedVariant {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Flatten back into a record, including the discriminator
    pub fn to_record(&self) -> Record {
        let mut record = self.extra.clone();
        record.extend(self.fields.iter().cloned());
        record.insert(
            self.discriminator_field.clone(),
            Value::String(self.tag.clone()),
        );
        record
    }

    /// Convert into a concrete type
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, DecodeError> {
        serde_json::from_value(record_to_json(&self.to_record())).map_err(|e| {
            DecodeError::Deserialize {
                variant: self.tag.clone(),
                message: e.to_string(),
            }
        })
    }
}

/// Result of decoding a discriminated record
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Known(DecodedVariant),
    /// Discriminator value not registered; the record is passed through as-is
    Unknown { tag: String, raw: Record },
}

impl Decoded {
    pub fn tag(&self) -> &str {
        match self {
            Decoded::Known(v) => &v.tag,
            Decoded::Unknown { tag, .. } => tag,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Decoded::Unknown { .. })
    }

    pub fn into_known(self) -> Option<DecodedVariant> {
        match self {
            Decoded::Known(v) => Some(v),
            Decoded::Unknown { .. } => None,
        }
    }
}

/// Decoder over one registry
#[derive(Debug, Clone)]
pub struct DiscriminatedDecoder {
    registry: Arc<VariantRegistry>,
}

impl DiscriminatedDecoder {
    pub fn new(registry: Arc<VariantRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &VariantRegistry {
        &self.registry
    }

    /// Decode `record` using `record[discriminator_field]` to select the variant
    pub fn decode(
        &self,
        record: &Record,
        discriminator_field: &str,
    ) -> Result<Decoded, DecodeError> {
        let tag = match record.get(discriminator_field) {
            None | Some(Value::Null) => {
                return Err(DecodeError::MissingDiscriminator {
                    field: discriminator_field.to_string(),
                });
            }
            Some(Value::String(s)) => s.clone(),
            Some(other) => {
                return Err(DecodeError::InvalidDiscriminator {
                    field: discriminator_field.to_string(),
                    got: other.type_name(),
                });
            }
        };

        let Some(variant) = self.registry.get(&tag) else {
            log::warn!(
                "unknown {} variant '{}', passing record through",
                self.registry.type_name(),
                tag
            );
            return Ok(Decoded::Unknown {
                tag,
                raw: record.clone(),
            });
        };

        decode_variant(variant, record, discriminator_field).map(Decoded::Known)
    }
}

fn decode_variant(
    variant: &VariantSchema,
    record: &Record,
    discriminator_field: &str,
) -> Result<DecodedVariant, DecodeError> {
    let violation = |field: &str, reason: Violation| DecodeError::SchemaViolation {
        variant: variant.discriminator_value.clone(),
        field: field.to_string(),
        reason,
    };

    let mut fields = Vec::with_capacity(variant.fields.len());
    for schema in &variant.fields {
        match record.get(&schema.name) {
            Some(Value::Null) if schema.mandatory => {
                return Err(violation(&schema.name, Violation::Null));
            }
            None if schema.mandatory => {
                return Err(violation(&schema.name, Violation::Missing));
            }
            // Absent and null optional fields are the same thing
            None | Some(Value::Null) => {
                if let Some(empty) = schema.field_type.empty_value() {
                    fields.push((schema.name.clone(), empty));
                }
            }
            Some(value) if schema.field_type.accepts(value) => {
                fields.push((schema.name.clone(), value.clone()));
            }
            Some(value) => {
                return Err(violation(
                    &schema.name,
                    Violation::TypeMismatch {
                        expected: schema.field_type,
                        got: value.type_name(),
                    },
                ));
            }
        }
    }

    let extra = record
        .iter()
        .filter(|(k, _)| k.as_str() != discriminator_field && variant.get_field(k).is_none())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Ok(DecodedVariant {
        tag: variant.discriminator_value.clone(),
        discriminator_field: discriminator_field.to_string(),
        fields,
        extra,
    })
}
