//! # cache-mesh
//!
//! A sharded, circuit-protected caching engine for Rust.
//!
//! ## Features
//!
//! - **Consistent Hashing:** Weighted virtual nodes, replica placement and rebalance estimates
//! - **Failure Isolation:** Fixed and adaptive circuit breakers gate every backend call
//! - **Write Strategies:** Write-through, write-back (background flusher) and write-around
//! - **Local Tier:** Optional in-process front cache with LRU, LFU or FIFO eviction
//! - **Backend Agnostic:** In-memory, Redis, or any custom [`CacheBackend`]
//! - **Cancellation:** Every operation accepts a caller-supplied cancellation signal
//! - **Production Ready:** Built-in logging, metrics hooks, and error handling
//!
//! ## Quick Start
//!
//! ```
//! use cache_mesh::{backend::InMemoryBackend, CacheConfig, CacheEngineBuilder};
//! use serde::{Deserialize, Serialize};
//! use std::time::Duration;
//!
//! #[derive(Debug, PartialEq, Serialize, Deserialize)]
//! struct User {
//!     id: u64,
//!     name: String,
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> cache_mesh::Result<()> {
//! let config = CacheConfig {
//!     namespace: "users".into(),
//!     enable_sharding: true,
//!     ..Default::default()
//! };
//!
//! let engine = CacheEngineBuilder::new(config)
//!     .node("cache-1", InMemoryBackend::new())
//!     .node("cache-2", InMemoryBackend::new())
//!     .build()?;
//!
//! let user = User { id: 1, name: "Ada".into() };
//! engine.set("1", &user, Some(Duration::from_secs(60))).await?;
//!
//! match engine.get::<User>("1").await {
//!     Ok(Some(cached)) => assert_eq!(cached, user),
//!     Ok(None) => { /* miss: load from the source of truth */ }
//!     Err(e) if e.is_degraded() => { /* cache unavailable: bypass it */ }
//!     Err(e) => return Err(e),
//! }
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate log;

pub mod backend;
pub mod builder;
pub mod config;
pub mod engine;
pub mod error;
pub mod key;
pub mod observability;
pub mod resilience;
pub mod ring;
pub mod serialization;
pub mod strategy;
pub mod tier;

// Re-exports for convenience
pub use backend::CacheBackend;
pub use builder::CacheEngineBuilder;
pub use config::{CacheConfig, ReadPreference, WriteConsistency};
pub use engine::CacheEngine;
pub use error::{Error, Result};
pub use ring::HashRing;
pub use strategy::WriteStrategy;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
