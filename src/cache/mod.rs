//! Versioned offline cache for intercepted requests.
//!
//! This module provides the caching agent's core:
//! - A storage policy that keeps map tiles and non-replayable responses out
//! - Named, versioned generations, replaced wholesale on upgrade
//! - A lifecycle controller for install, interception and activation
//! - A SQLite store persisting responses between runs

mod controller;
mod generation;
mod policy;
mod storage;
mod traits;

pub use controller::LifecycleController;
pub use generation::Generation;
pub use policy::{CachePolicy, DEFAULT_EXCLUSIONS};
pub use storage::SqliteStore;
pub use traits::{CacheHandle, CacheSource, CacheStore, Intercepted};
