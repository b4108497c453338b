//! Offline cache for the calculator's static assets.
//!
//! This module provides:
//! - A storage abstraction over named cache generations (SQLite or in-memory)
//! - A cache manager that pre-caches assets on install, serves requests from
//!   cache or network, and prunes stale generations on activate

mod manager;
mod storage;
mod traits;

pub use manager::{origin_base, ActivateReport, CacheManager, InstallReport};
pub use storage::{CacheStorage, CachedResponse, MemoryStorage, SqliteStorage};
pub use traits::{CacheResult, CacheSource, Destination, Request, Response};
