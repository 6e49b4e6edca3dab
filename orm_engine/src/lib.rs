#![forbid(unsafe_code)]

/// Engine v1. Bumping it changes every canonical hash.
pub const ENGINE_VERSION: u32 = 1;

pub mod ambient;
pub mod cancel;
pub mod collaborators;
pub mod composite;
pub mod config;
pub mod entity;
pub mod error;
pub mod hashing;
pub mod infra;
pub mod key_service;
pub mod key_state;
pub mod provision;
pub mod registry;
pub mod scope;
pub mod serialization;
pub mod service;
pub mod tracked;
pub mod value;

pub use composite::CompositeKey;
pub use config::{CascadeMode, MergeBehavior, RelationTypes, SaveSettings, ScopeSettings, SerializationMode};
pub use entity::{into_handle, Entity, EntityHandle, EntitySet, FieldDescriptor, FieldKind};
pub use error::{OrmError, Result};
pub use infra::{RowState, WrappingSupport};
pub use registry::{KeyRegistry, RelationshipDefinition};
pub use scope::ServiceScope;
pub use tracked::TrackedHandle;
pub use value::{FieldValue, PropertyMap, ValueKind};
