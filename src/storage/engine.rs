//! TTLKV Storage Engine
//!
//! The engine orchestrates all components:
//! - Write path: Document → validate → encode/compress → key → Store → TTL index
//! - Read path: Key/Filter → Store → skip expired → decode → filter
//!
//! All calls funnel through a single worker task (see `queue`), so the store
//! sees one operation at a time in submission order. [`Engine`] is the async
//! handle; [`Engine::blocking`] gives a handle for plain threads.

use crate::storage::compression::{Compressor, DEFAULT_MIN_SIZE};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::keys;
use crate::storage::queue::{lock_state, Housekeeping, OpFuture, Operation, Reply, SharedState, Worker};
use crate::storage::state::EngineState;
use crate::storage::store::StoreHandle;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Configuration for the storage engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Backing file; `None` keeps everything in memory
    pub path: Option<PathBuf>,
    /// Largest accepted document, measured as serialized JSON (default: 8KB)
    pub max_document_bytes: usize,
    pub compression_enabled: bool,
    /// Documents smaller than this are stored raw (default: 256)
    pub compression_min_bytes: usize,
    /// Base number of mutations between commits (default: 10)
    pub flush_threshold: u64,
    /// Commit pending mutations after this many seconds; 0 disables
    pub auto_flush_secs: u64,
    /// TTL sweep period in milliseconds (default: 1000)
    pub sweep_interval_ms: u64,
    /// Full key scan period in seconds (default: 300)
    pub full_cleanup_interval_secs: u64,
    /// Upper bound for `$limit`
    pub max_query_limit: usize,
    /// Bounded queue depth between callers and the worker
    pub queue_capacity: usize,
    /// An empty image larger than this is recreated
    pub vacuum_threshold_bytes: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_document_bytes: 8 * 1024,
            compression_enabled: true,
            compression_min_bytes: DEFAULT_MIN_SIZE,
            flush_threshold: 10,
            auto_flush_secs: 10,
            sweep_interval_ms: 1000,
            full_cleanup_interval_secs: 300,
            max_query_limit: 1000,
            queue_capacity: 256,
            vacuum_threshold_bytes: 4096,
        }
    }
}

impl EngineConfig {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn max_document_bytes(mut self, bytes: usize) -> Self {
        self.max_document_bytes = bytes;
        self
    }

    pub fn compression(mut self, enabled: bool) -> Self {
        self.compression_enabled = enabled;
        self
    }

    pub fn flush_threshold(mut self, ops: u64) -> Self {
        self.flush_threshold = ops;
        self
    }

    pub fn auto_flush_secs(mut self, secs: u64) -> Self {
        self.auto_flush_secs = secs;
        self
    }

    pub fn sweep_interval_ms(mut self, ms: u64) -> Self {
        self.sweep_interval_ms = ms;
        self
    }

    pub fn full_cleanup_interval_secs(mut self, secs: u64) -> Self {
        self.full_cleanup_interval_secs = secs;
        self
    }

    pub fn max_query_limit(mut self, limit: usize) -> Self {
        self.max_query_limit = limit;
        self
    }

    pub(crate) fn store_handle(&self) -> StoreHandle {
        match &self.path {
            Some(path) => StoreHandle::file(path.clone()),
            None => StoreHandle::memory(),
        }
    }

    pub(crate) fn compressor(&self) -> Compressor {
        Compressor::new(self.compression_enabled, self.compression_min_bytes)
    }

    fn housekeeping(&self) -> Housekeeping {
        Housekeeping {
            sweep_interval: Duration::from_millis(self.sweep_interval_ms.max(1)),
            full_cleanup_interval: Duration::from_secs(self.full_cleanup_interval_secs),
        }
    }
}

/// Options for a single put
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutOptions {
    /// Seconds to live; 0 means never expires
    pub ttl: u64,
    /// Stored under the reserved `_tags` field
    pub tags: Option<Vec<String>>,
    /// Caller-chosen key instead of a generated one
    pub id: Option<String>,
}

impl PutOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl(mut self, secs: u64) -> Self {
        self.ttl = secs;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.get_or_insert_with(Vec::new).push(tag.into());
        self
    }

    pub fn tags(mut self, tags: Vec<String>) -> Self {
        self.tags = Some(tags);
        self
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// Engine statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub records: usize,
    /// Heap entries, including stale ones not yet popped
    pub ttl_index_entries: usize,
    pub pending_ops: u64,
    pub total_ops: u64,
    pub commits: u64,
    pub image_bytes: u64,
    /// Image size when the engine was opened
    pub baseline_image_bytes: u64,
    pub in_memory: bool,
}

impl std::fmt::Display for EngineStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Records: {}, TTL entries: {}, Pending: {}, Ops: {}, Commits: {}, Size: {:.2} KB (opened at {:.2} KB)",
            self.records,
            self.ttl_index_entries,
            self.pending_ops,
            self.total_ops,
            self.commits,
            self.image_bytes as f64 / 1024.0,
            self.baseline_image_bytes as f64 / 1024.0
        )
    }
}

/// Handle to a running engine
///
/// Dropping the handle commits applied mutations on the spot and closes the
/// queue; the worker then drains what is left and releases the store if the
/// runtime is still running. Call [`Engine::close`] to wait for that.
pub struct Engine {
    sender: Mutex<Option<mpsc::Sender<Operation>>>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    state: SharedState,
    config: EngineConfig,
}

impl Engine {
    /// Open the store and start the worker
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn open(config: EngineConfig) -> StorageResult<Self> {
        let state = EngineState::open(config.clone(), keys::now_secs())?;

        let state = Arc::new(Mutex::new(state));

        let (sender, requests) = mpsc::channel(config.queue_capacity.max(1));
        let worker = Worker::new(Arc::clone(&state), requests, config.housekeeping());
        let handle = tokio::spawn(worker.run());

        tracing::info!(
            "Engine started ({})",
            match &config.path {
                Some(path) => path.display().to_string(),
                None => "in-memory".to_string(),
            }
        );

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            worker: tokio::sync::Mutex::new(Some(handle)),
            state,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn sender(&self) -> StorageResult<mpsc::Sender<Operation>> {
        let guard = self
            .sender
            .lock()
            .map_err(|e| StorageError::Lock(format!("Failed to acquire queue lock: {}", e)))?;
        guard.clone().ok_or(StorageError::Closed)
    }

    async fn enqueue<T>(&self, make: impl FnOnce(Reply<T>) -> Operation) -> StorageResult<OpFuture<T>> {
        let sender = self.sender()?;
        let (reply, future) = OpFuture::channel();
        sender
            .send(make(reply))
            .await
            .map_err(|_| StorageError::Closed)?;
        Ok(future)
    }

    fn enqueue_blocking<T>(&self, make: impl FnOnce(Reply<T>) -> Operation) -> StorageResult<OpFuture<T>> {
        let sender = self.sender()?;
        let (reply, future) = OpFuture::channel();
        sender
            .blocking_send(make(reply))
            .map_err(|_| StorageError::Closed)?;
        Ok(future)
    }

    /// Queue a put without waiting for it to apply
    pub async fn submit_put(&self, document: Value, options: PutOptions) -> StorageResult<OpFuture<String>> {
        self.enqueue(|reply| Operation::Put {
            document,
            options,
            reply,
        })
        .await
    }

    /// Queue a delete without waiting for it to apply
    pub async fn submit_delete(&self, key: impl Into<String>) -> StorageResult<OpFuture<usize>> {
        let key = key.into();
        self.enqueue(|reply| Operation::Delete { key, reply }).await
    }

    /// Queue a get without waiting for it to run
    pub async fn submit_get(&self, key: impl Into<String>) -> StorageResult<OpFuture<Option<Value>>> {
        let key = key.into();
        self.enqueue(|reply| Operation::Get { key, reply }).await
    }

    /// Queue a query without waiting for it to run
    pub async fn submit_query(&self, filter: Value) -> StorageResult<OpFuture<Vec<Value>>> {
        self.enqueue(|reply| Operation::Query { filter, reply }).await
    }

    /// Store a document and return its key
    pub async fn put(&self, document: Value, options: PutOptions) -> StorageResult<String> {
        self.submit_put(document, options).await?.await
    }

    /// Read a document; absent and expired keys read as `None`
    pub async fn get(&self, key: impl Into<String>) -> StorageResult<Option<Value>> {
        self.submit_get(key).await?.await
    }

    /// Delete a key, returning how many records were removed (0 or 1)
    pub async fn delete(&self, key: impl Into<String>) -> StorageResult<usize> {
        self.submit_delete(key).await?.await
    }

    /// Remove every record and recreate the backing image
    pub async fn purge(&self) -> StorageResult<usize> {
        self.enqueue(|reply| Operation::Purge { reply }).await?.await
    }

    /// Run a filter document, returning matches in key order
    pub async fn query(&self, filter: Value) -> StorageResult<Vec<Value>> {
        self.submit_query(filter).await?.await
    }

    /// Store many documents as one operation; invalid items are skipped
    pub async fn put_batch(&self, documents: Vec<Value>, ttls: Option<Vec<u64>>) -> StorageResult<Vec<String>> {
        self.enqueue(|reply| Operation::PutBatch {
            documents,
            ttls,
            reply,
        })
        .await?
        .await
    }

    pub async fn delete_batch(&self, keys: Vec<String>) -> StorageResult<usize> {
        self.enqueue(|reply| Operation::DeleteBatch { keys, reply })
            .await?
            .await
    }

    /// Scan all keys and delete expired records
    pub async fn cleanup(&self) -> StorageResult<usize> {
        self.enqueue(|reply| Operation::Cleanup { reply }).await?.await
    }

    /// Delete records whose TTL index deadline has passed
    pub async fn sweep(&self) -> StorageResult<usize> {
        self.enqueue(|reply| Operation::Sweep { reply }).await?.await
    }

    /// Commit pending mutations now
    pub async fn flush(&self) -> StorageResult<()> {
        self.enqueue(|reply| Operation::Flush { reply }).await?.await
    }

    pub async fn stats(&self) -> StorageResult<EngineStats> {
        self.enqueue(|reply| Operation::Stats { reply }).await?.await
    }

    /// Drain the queue, commit and release the store
    ///
    /// Operations queued before the close still apply. Closing twice is a
    /// no-op; any call after the close fails with [`StorageError::Closed`].
    pub async fn close(&self) -> StorageResult<()> {
        let Some(sender) = self.take_sender()? else {
            return Ok(());
        };

        let (reply, future) = OpFuture::channel();
        let result = match sender.send(Operation::Close { reply }).await {
            Ok(()) => future.await,
            // Worker already gone: nothing left to commit
            Err(_) => Ok(()),
        };
        drop(sender);

        if let Some(handle) = self.worker.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::error!("Engine worker ended abnormally: {}", e);
            }
        }

        tracing::info!("Engine closed");
        result
    }

    fn take_sender(&self) -> StorageResult<Option<mpsc::Sender<Operation>>> {
        let mut guard = self
            .sender
            .lock()
            .map_err(|e| StorageError::Lock(format!("Failed to acquire queue lock: {}", e)))?;
        Ok(guard.take())
    }

    /// Blocking handle for callers outside the runtime
    ///
    /// Its methods park the calling thread, so they must not be used from
    /// inside an async task.
    pub fn blocking(&self) -> BlockingEngine<'_> {
        BlockingEngine { engine: self }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Already closed through close()
        let Ok(Some(sender)) = self.take_sender() else {
            return;
        };
        drop(sender);

        // The runtime may shut down before the worker sees the closed queue
        match lock_state(&self.state) {
            Ok(mut state) => {
                if let Err(e) = state.flush() {
                    tracing::error!("Commit on drop failed: {}", e);
                }
            }
            Err(e) => tracing::error!("Commit on drop skipped: {}", e),
        }
    }
}

/// Synchronous view of an [`Engine`]
pub struct BlockingEngine<'a> {
    engine: &'a Engine,
}

impl BlockingEngine<'_> {
    fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Operation) -> StorageResult<T> {
        self.engine.enqueue_blocking(make)?.wait()
    }

    /// Queue a put and return its pending result
    pub fn submit_put(&self, document: Value, options: PutOptions) -> StorageResult<OpFuture<String>> {
        self.engine.enqueue_blocking(|reply| Operation::Put {
            document,
            options,
            reply,
        })
    }

    pub fn put(&self, document: Value, options: PutOptions) -> StorageResult<String> {
        self.submit_put(document, options)?.wait()
    }

    pub fn get(&self, key: impl Into<String>) -> StorageResult<Option<Value>> {
        let key = key.into();
        self.call(|reply| Operation::Get { key, reply })
    }

    pub fn delete(&self, key: impl Into<String>) -> StorageResult<usize> {
        let key = key.into();
        self.call(|reply| Operation::Delete { key, reply })
    }

    pub fn purge(&self) -> StorageResult<usize> {
        self.call(|reply| Operation::Purge { reply })
    }

    pub fn query(&self, filter: Value) -> StorageResult<Vec<Value>> {
        self.call(|reply| Operation::Query { filter, reply })
    }

    pub fn put_batch(&self, documents: Vec<Value>, ttls: Option<Vec<u64>>) -> StorageResult<Vec<String>> {
        self.call(|reply| Operation::PutBatch {
            documents,
            ttls,
            reply,
        })
    }

    pub fn delete_batch(&self, keys: Vec<String>) -> StorageResult<usize> {
        self.call(|reply| Operation::DeleteBatch { keys, reply })
    }

    pub fn cleanup(&self) -> StorageResult<usize> {
        self.call(|reply| Operation::Cleanup { reply })
    }

    pub fn sweep(&self) -> StorageResult<usize> {
        self.call(|reply| Operation::Sweep { reply })
    }

    pub fn flush(&self) -> StorageResult<()> {
        self.call(|reply| Operation::Flush { reply })
    }

    pub fn stats(&self) -> StorageResult<EngineStats> {
        self.call(|reply| Operation::Stats { reply })
    }

    /// Commit and release the store, waiting for the worker to acknowledge
    pub fn close(&self) -> StorageResult<()> {
        let Some(sender) = self.engine.take_sender()? else {
            return Ok(());
        };

        let (reply, future) = OpFuture::channel();
        match sender.blocking_send(Operation::Close { reply }) {
            Ok(()) => future.wait(),
            Err(_) => Ok(()),
        }
    }
}
