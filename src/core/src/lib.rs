//! Airlift Core - Foundational Types and Abstractions
//!
//! This crate provides the foundational types shared across the airlift
//! imageset engine: the error taxonomy, image references, mirrored-image
//! associations, persistent workspace metadata, the file-based catalog
//! model, and the imageset configuration with its validation rules.

pub mod association;
pub mod config;
pub mod declcfg;
pub mod error;
pub mod metadata;
pub mod reference;
pub mod validate;

// Re-export commonly used types
pub use association::{AssociationRecord, AssociationSet, ImageAssociation, ImageKind};
pub use config::ImageSetConfiguration;
pub use declcfg::DeclarativeConfig;
pub use error::{MirrorError, Result};
pub use metadata::{CatalogProvenance, Metadata, PastBlob, PastManifest, PastMirror};
pub use reference::{ImageReference, Transport};

/// Airlift version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
