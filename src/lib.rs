//! salus-offline - offline cache for the Salus calculator.
//!
//! Pre-caches a fixed set of static assets, answers requests from the cache
//! when the network is unavailable, prefers the network for the main
//! document, and drops old cache generations when a new one takes over.
//!
//! # Example
//!
//! ```no_run
//! use salus_offline::{CacheManager, HttpNetwork, ServiceWorker, SqliteStorage};
//!
//! # async fn example() -> color_eyre::Result<()> {
//! let origin = url::Url::parse("https://salus.example/")?;
//! let manager = CacheManager::new(SqliteStorage::open()?, HttpNetwork::new()?, origin.clone());
//! let worker = ServiceWorker::new(manager);
//!
//! // Install and activate, then serve a request
//! worker.start().await?;
//! let result = worker
//!   .fetch(&salus_offline::Request::document(origin.join("./index.html")?))
//!   .await?;
//! println!("{} from {}", result.data.status, result.source);
//! # Ok(())
//! # }
//! ```

pub mod assets;
pub mod cache;
pub mod config;
pub mod lifecycle;
pub mod logging;
pub mod network;

// Re-export main types for convenience
pub use cache::{
  CacheManager, CacheResult, CacheSource, CacheStorage, Destination, MemoryStorage, Request,
  Response, SqliteStorage,
};
pub use config::Config;
pub use lifecycle::{EventOutcome, LifecycleEvent, Phase, ServiceWorker};
pub use network::{HttpNetwork, Network};
