//! Update detection layer for running container images
//!
//! Resolves what a registry currently serves for a container's image
//! reference, compares it with what is running and keeps the outcome per
//! container.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Scheduler  │────▶│  Resolver   │────▶│  Registry   │
//! │(timer/force)│     │(host→client)│     │   (fetch)   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        │                                       │
//!        ▼                                       ▼
//! ┌─────────────┐                         ┌─────────────┐
//! │    Cache    │◀────────────────────────│   Checker   │
//! │  (status)   │                         │  (compare)  │
//! └─────────────┘                         └─────────────┘
//! ```
//!
//! # Modules
//!
//! - [`scheduler`]: Daily timer, forced checks, coalescing and cancellation
//! - [`cache`]: In-memory status per container with due and guard tracking
//! - [`checker`]: Status storage trait and digest/tag comparison
//! - [`registry`]: Registry trait for resolving a tag to a digest
//! - [`registries`]: Docker Hub and GHCR implementations
//! - [`resolver`]: Host-to-registry lookup table
//! - [`inventory`]: Containers consumed from the runtime
//! - [`status`]: Stable status codes and the stored status record
//! - [`error`]: Error types for cache and registry operations

pub mod cache;
pub mod checker;
pub mod error;
pub mod inventory;
pub mod registries;
pub mod registry;
pub mod resolver;
pub mod scheduler;
pub mod status;

pub use cache::StatusCache;
pub use inventory::{ContainerImage, InventoryChanges};
pub use resolver::{RegistrySet, create_default_registries};
pub use scheduler::UpdateScheduler;
pub use status::{UpdateStatus, UpdateStatusCode};
