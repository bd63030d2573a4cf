//! Keel Core
//!
//! Core library for decoding polymorphic API payloads and reconciling managed
//! resources against a remote API.
//!
//! - [`decoder`] interprets a record as one variant of a discriminated type
//! - [`reconciler`] drives a resource through create, update, replace and
//!   verified deletion

pub mod accessor;
pub mod accessors;
pub mod clock;
pub mod decoder;
pub mod differ;
pub mod plan;
pub mod property;
pub mod reconciler;
pub mod resource;
pub mod value;
pub mod variant;

pub use accessor::{Accessor, AccessorError, AccessorErrorKind, AccessorResult, BoxFuture};
pub use decoder::{DecodeError, Decoded, DecodedVariant, DiscriminatedDecoder};
pub use plan::{Action, ReconciliationPlan};
pub use property::{DesiredState, Phase, PropertySet, PropertySpec, Requirement};
pub use reconciler::{
    DestroyCause, ReconcileError, Reconciler, ReconcilerConfig, Reconciliation, Snapshot,
};
pub use resource::{LifecycleState, RemoteState, ResourceId, ResourceKind};
pub use value::{Record, Value};
pub use variant::{FieldSchema, FieldType, VariantRegistry, VariantSchema};
