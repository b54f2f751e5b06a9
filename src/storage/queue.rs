//! Operation queue and worker task
//!
//! Every engine call becomes an [`Operation`] on a bounded channel. One
//! worker task drains it in FIFO order, so operations apply exactly in the
//! order they were submitted. Each operation carries a oneshot reply; the
//! caller holds the matching [`OpFuture`].
//!
//! Between requests the worker ticks on an interval to sweep expired
//! records, run the periodic full cleanup and honour time-based commits.

use crate::storage::engine::{EngineStats, PutOptions};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::keys;
use crate::storage::state::EngineState;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};

pub(crate) type Reply<T> = oneshot::Sender<StorageResult<T>>;

/// State shared by the worker and the engine handle
///
/// The worker holds the lock for one operation at a time and never across
/// an await; the handle only takes it when dropped.
pub(crate) type SharedState = Arc<Mutex<EngineState>>;

pub(crate) fn lock_state(state: &Mutex<EngineState>) -> StorageResult<MutexGuard<'_, EngineState>> {
    state
        .lock()
        .map_err(|e| StorageError::Lock(format!("Failed to acquire engine state: {}", e)))
}

/// A queued engine call
pub(crate) enum Operation {
    Put {
        document: Value,
        options: PutOptions,
        reply: Reply<String>,
    },
    Get {
        key: String,
        reply: Reply<Option<Value>>,
    },
    Delete {
        key: String,
        reply: Reply<usize>,
    },
    Purge {
        reply: Reply<usize>,
    },
    Query {
        filter: Value,
        reply: Reply<Vec<Value>>,
    },
    PutBatch {
        documents: Vec<Value>,
        ttls: Option<Vec<u64>>,
        reply: Reply<Vec<String>>,
    },
    DeleteBatch {
        keys: Vec<String>,
        reply: Reply<usize>,
    },
    Cleanup {
        reply: Reply<usize>,
    },
    Sweep {
        reply: Reply<usize>,
    },
    Flush {
        reply: Reply<()>,
    },
    Stats {
        reply: Reply<EngineStats>,
    },
    Close {
        reply: Reply<()>,
    },
}

/// Pending result of a queued operation
///
/// Await it from async code or call [`OpFuture::wait`] from a plain thread.
/// If the engine shuts down before the operation runs, it resolves to
/// [`StorageError::Closed`].
#[must_use = "an OpFuture does nothing unless awaited or waited on"]
pub struct OpFuture<T> {
    rx: oneshot::Receiver<StorageResult<T>>,
}

impl<T> OpFuture<T> {
    pub(crate) fn channel() -> (Reply<T>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// Block the current thread until the result is available
    ///
    /// Must not be called from inside an async runtime.
    pub fn wait(self) -> StorageResult<T> {
        self.rx.blocking_recv().unwrap_or(Err(StorageError::Closed))
    }

    /// Take the result if the operation already completed
    pub fn try_take(&mut self) -> Option<StorageResult<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(StorageError::Closed)),
        }
    }
}

impl<T> Future for OpFuture<T> {
    type Output = StorageResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(StorageError::Closed)))
    }
}

/// Timing knobs for the worker's housekeeping
#[derive(Debug, Clone, Copy)]
pub(crate) struct Housekeeping {
    pub sweep_interval: Duration,
    pub full_cleanup_interval: Duration,
}

pub(crate) struct Worker {
    state: SharedState,
    requests: mpsc::Receiver<Operation>,
    housekeeping: Housekeeping,
}

impl Worker {
    pub(crate) fn new(
        state: SharedState,
        requests: mpsc::Receiver<Operation>,
        housekeeping: Housekeeping,
    ) -> Self {
        Self {
            state,
            requests,
            housekeeping,
        }
    }

    /// Serve operations until a close request arrives or every sender is gone
    pub(crate) async fn run(mut self) {
        let mut ticker = interval(self.housekeeping.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;
        let mut last_cleanup = Instant::now();

        loop {
            tokio::select! {
                biased;

                request = self.requests.recv() => match request {
                    Some(Operation::Close { reply }) => {
                        let _ = reply.send(self.with_state(|state| state.close()));
                        break;
                    }
                    Some(operation) => self.execute(operation),
                    None => {
                        if let Err(e) = self.with_state(|state| state.close()) {
                            tracing::error!("Final flush failed: {}", e);
                        }
                        break;
                    }
                },

                _ = ticker.tick() => self.housekeeping(&mut last_cleanup),
            }
        }

        // Anything still queued behind the close resolves to Closed
        self.requests.close();
        tracing::debug!("Engine worker stopped");
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut EngineState) -> StorageResult<T>) -> StorageResult<T> {
        let mut state = lock_state(&self.state)?;
        f(&mut state)
    }

    fn execute(&self, operation: Operation) {
        let now = keys::now_secs();

        // A dropped receiver means the caller stopped waiting; the
        // operation still applies
        match operation {
            Operation::Put {
                document,
                options,
                reply,
            } => {
                let _ = reply.send(self.with_state(|state| state.put(document, options, now)));
            }
            Operation::Get { key, reply } => {
                let _ = reply.send(self.with_state(|state| state.get(&key, now)));
            }
            Operation::Delete { key, reply } => {
                let _ = reply.send(self.with_state(|state| state.delete(&key)));
            }
            Operation::Purge { reply } => {
                let _ = reply.send(self.with_state(|state| state.purge()));
            }
            Operation::Query { filter, reply } => {
                let _ = reply.send(self.with_state(|state| state.query(&filter, now)));
            }
            Operation::PutBatch {
                documents,
                ttls,
                reply,
            } => {
                let _ = reply.send(self.with_state(|state| state.put_batch(documents, ttls, now)));
            }
            Operation::DeleteBatch { keys, reply } => {
                let _ = reply.send(self.with_state(|state| state.delete_batch(&keys)));
            }
            Operation::Cleanup { reply } => {
                let _ = reply.send(self.with_state(|state| state.cleanup(now)));
            }
            Operation::Sweep { reply } => {
                let _ = reply.send(self.with_state(|state| state.sweep(now)));
            }
            Operation::Flush { reply } => {
                let _ = reply.send(self.with_state(|state| state.flush()));
            }
            Operation::Stats { reply } => {
                let _ = reply.send(self.with_state(|state| Ok(state.stats())));
            }
            Operation::Close { reply } => {
                let _ = reply.send(self.with_state(|state| state.close()));
            }
        }
    }

    fn housekeeping(&self, last_cleanup: &mut Instant) {
        let now = keys::now_secs();
        let mut state = match lock_state(&self.state) {
            Ok(state) => state,
            Err(e) => {
                tracing::error!("Skipping housekeeping: {}", e);
                return;
            }
        };

        if let Err(e) = state.sweep(now) {
            tracing::error!("TTL sweep failed: {}", e);
        }

        if last_cleanup.elapsed() >= self.housekeeping.full_cleanup_interval {
            *last_cleanup = Instant::now();
            match state.cleanup(now) {
                Ok(0) => {}
                Ok(removed) => tracing::debug!("Periodic cleanup removed {} records", removed),
                Err(e) => tracing::error!("Periodic cleanup failed: {}", e),
            }
        }

        if let Err(e) = state.tick() {
            tracing::error!("Background flush failed: {}", e);
        }
    }
}
