//! Instance data model, per-instance process supervision, and the fleet registry.
//!
//! This crate knows nothing about HTTP or eviction policy: the server crate drives it
//! through [`Registry`], and eviction policy is injected via the [`Evictor`] trait so
//! this crate never depends on the lifecycle manager that implements it.

pub mod command;
pub mod error;
pub mod instance;
pub mod options;
pub mod persistence;
pub mod proxy;
pub mod registry;

pub use error::{RegistryError, SupervisorError, ValidationError};
pub use instance::Instance;
pub use options::{BackendOptions, InstanceOptions, InstanceOptionsInput, RestartPolicy};
pub use proxy::ProxyTarget;
pub use registry::{Evictor, NoEviction, Registry};
