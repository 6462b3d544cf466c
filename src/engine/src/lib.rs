//! Airlift Engine - imageset engine implementation.
//!
//! This crate implements the mirroring core: metadata storage backends,
//! the release/operator/additional planners, the mirror executor with
//! its batch worker, catalog rebuilding, archive packaging, and the
//! cluster-manifest generators. The `create` and `publish` modules tie
//! the pieces into the two phases of a mirror run.

pub mod additional;
pub mod archive;
pub mod associate;
pub mod batch;
pub mod cincinnati;
pub mod context;
pub mod create;
pub mod graphdata;
pub mod layout;
pub mod manifests;
pub mod mirror;
pub mod operator;
pub mod plan;
pub mod publish;
pub mod rebuild;
pub mod registry;
pub mod release;
pub mod storage;
pub mod unarchive;

#[cfg(test)]
pub(crate) mod testutil;

// Re-export common types
pub use batch::{BatchError, BatchWorker, SafeError, UnsafeError};
pub use cincinnati::{CincinnatiClient, GraphClient, UpgradeGraph};
pub use context::RunContext;
pub use create::{CreateOptions, CreateReport};
pub use layout::FileLayout;
pub use mirror::{MirrorExecutor, MirrorOptions, RetryPolicy};
pub use plan::{Mapping, MappingSet};
pub use publish::{PublishOptions, PublishReport};
pub use registry::{RegistryAuth, RegistryClient};
pub use storage::{Backend, LocalBackend, RegistryBackend};

/// Airlift Engine version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
