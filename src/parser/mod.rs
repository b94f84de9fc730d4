//! Parser layer
//! - image_ref.rs: Image reference parser
//! - types.rs: Common types (RegistryKind, registry host constants)

pub mod image_ref;
pub mod types;

pub use image_ref::ImageReference;
pub use types::{RegistryKind, detect_registry_kind};
