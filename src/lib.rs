//! # TTLKV
//!
//! Embedded key-value document store for devices: JSON documents with
//! per-record time-to-live, kept in memory or in a single backing file.
//!
//! ## Features
//!
//! - **Self-describing keys**: creation time and TTL live in the key, so
//!   expiry survives restarts without extra metadata
//! - **Background expiry**: heap-driven sweeps plus periodic full scans
//! - **Compact records**: large documents are deflate-compressed
//! - **Adaptive commits**: flush frequency follows the workload
//! - **Ordered execution**: a single worker applies calls in submission order
//!
//! ## Modules
//!
//! - [`storage`]: Engine, backing store, TTL index and commit policy
//! - [`query`]: Filter language parser and executor
//! - [`config`]: File and environment configuration
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use serde_json::json;
//! use ttlkv::{Engine, EngineConfig, PutOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Engine::open(EngineConfig::in_memory()).await?;
//!
//!     engine
//!         .put(json!({"sensor": "t1", "value": 21.5}), PutOptions::new().ttl(60).tag("temp"))
//!         .await?;
//!
//!     let hits = engine.query(json!({"tags": "temp", "$limit": 10})).await?;
//!     println!("Found {} readings", hits.len());
//!
//!     engine.close().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod query;
pub mod storage;

// Re-export top-level types for convenience
pub use storage::{
    BlockingEngine, Engine, EngineConfig, EngineStats, OpFuture, PutOptions, StorageError,
    StorageResult,
};

pub use query::{parse_filter, Filter, Predicate, Query, QueryBuilder, QueryError};

pub use config::{Config, ConfigError, LoggingConfig};
