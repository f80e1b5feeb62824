//! Lifecycle policy layered on top of `llamafleet-registry`: idle-timeout reaping,
//! LRU eviction, and process-wide configuration.

pub mod config;
pub mod lifecycle;

pub use config::AppConfig;
pub use lifecycle::LifecycleManager;
