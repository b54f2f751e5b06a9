//! TTLKV Storage Engine
//!
//! This module provides the core document storage functionality:
//!
//! - **store**: Ordered key-value map over a memory buffer or a file image
//! - **keys**: Generated key layout `<created>:<ttl>:<suffix>`
//! - **compression**: Flag-prefixed records with optional deflate
//! - **ttl**: Min-heap expiry index with lazy deletion
//! - **flush**: Adaptive commit policy
//! - **engine**: Public handle, configuration and statistics
//! - **error**: Error types
//!
//! # Architecture
//!
//! ```text
//! Callers ─▶ bounded queue ─▶ worker task ─▶ EngineState
//!                                 │            ├─ BackingStore
//!                                 │            ├─ TtlIndex
//!                                 │            └─ FlushManager
//!                                 └─ ticker: sweep / cleanup / auto-flush
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use serde_json::json;
//! use ttlkv::storage::{Engine, EngineConfig, PutOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Engine::open(EngineConfig::file("./sensors.tkv")).await?;
//!
//!     let key = engine
//!         .put(json!({"room": "hall", "temp": 21.5}), PutOptions::new().ttl(3600))
//!         .await?;
//!     let doc = engine.get(&key).await?;
//!
//!     let warm = engine.query(json!({"temp": {"$gt": 20}})).await?;
//!
//!     engine.close().await?;
//!     Ok(())
//! }
//! ```

pub mod compression;
pub mod engine;
pub mod error;
pub mod flush;
pub mod keys;
mod queue;
mod state;
pub mod store;
pub mod ttl;

// Re-export commonly used types
pub use compression::Compressor;
pub use engine::{BlockingEngine, Engine, EngineConfig, EngineStats, PutOptions};
pub use error::{StorageError, StorageResult};
pub use flush::{FlushManager, OpCounts, OpKind};
pub use keys::{KeyKind, KeyMeta};
pub use queue::OpFuture;
pub use store::{BackingStore, StoreHandle};
pub use ttl::TtlIndex;
