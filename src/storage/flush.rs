//! Adaptive commit policy
//!
//! Commits are expensive on flash (wear) and cheap in memory, so the number
//! of mutations tolerated between commits depends on the store kind and on
//! the shape of the workload seen so far.

use crate::storage::error::StorageResult;
use crate::storage::store::BackingStore;
use std::time::{Duration, Instant};

/// Cumulative operations after which a file store counts as heavily loaded
const HEAVY_LOAD_OPS: u64 = 1000;

/// Floor for the in-memory threshold
const MEMORY_THRESHOLD_FLOOR: u64 = 5;

/// Mutation kinds tracked by the flush manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Put,
    Delete,
    BatchPut,
    BatchDelete,
}

/// Per-kind operation totals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpCounts {
    pub put: u64,
    pub delete: u64,
    pub batch_put: u64,
    pub batch_delete: u64,
}

impl OpCounts {
    pub fn total(&self) -> u64 {
        self.put + self.delete + self.batch_put + self.batch_delete
    }

    pub fn batch_ratio(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            0.0
        } else {
            (self.batch_put + self.batch_delete) as f64 / total as f64
        }
    }
}

/// Decides when buffered mutations get committed
#[derive(Debug)]
pub struct FlushManager {
    base_threshold: u64,
    /// `None` disables the time trigger
    auto_flush: Option<Duration>,
    in_memory: bool,
    /// Mutations since the last commit
    pending: u64,
    counts: OpCounts,
    last_flush: Instant,
    commits: u64,
}

impl FlushManager {
    pub fn new(base_threshold: u64, auto_flush_secs: u64, in_memory: bool) -> Self {
        Self {
            base_threshold: base_threshold.max(1),
            auto_flush: (auto_flush_secs > 0).then(|| Duration::from_secs(auto_flush_secs)),
            in_memory,
            pending: 0,
            counts: OpCounts::default(),
            last_flush: Instant::now(),
            commits: 0,
        }
    }

    /// Account for `n` mutations of one kind
    pub fn record(&mut self, kind: OpKind, n: u64) {
        match kind {
            OpKind::Put => self.counts.put += n,
            OpKind::Delete => self.counts.delete += n,
            OpKind::BatchPut => self.counts.batch_put += n,
            OpKind::BatchDelete => self.counts.batch_delete += n,
        }
        self.pending += n;
    }

    /// Mutations allowed between commits under the current workload
    pub fn effective_threshold(&self) -> u64 {
        if self.in_memory {
            return (self.base_threshold / 2).max(MEMORY_THRESHOLD_FLOOR);
        }

        let base = if self.counts.total() > HEAVY_LOAD_OPS {
            self.base_threshold.saturating_mul(2)
        } else {
            self.base_threshold
        };

        // Bulk workloads amortize a commit over many records
        let ratio = self.counts.batch_ratio();
        if ratio > 0.8 {
            base.saturating_mul(2)
        } else if ratio > 0.5 {
            base.saturating_add(base / 2)
        } else {
            base
        }
    }

    pub fn should_flush(&self, pending_additional: u64) -> bool {
        self.should_flush_at(pending_additional, Instant::now())
    }

    pub fn should_flush_at(&self, pending_additional: u64, now: Instant) -> bool {
        if self.pending.saturating_add(pending_additional) >= self.effective_threshold() {
            return true;
        }

        match self.auto_flush {
            Some(interval) => self.pending > 0 && now.duration_since(self.last_flush) >= interval,
            None => false,
        }
    }

    /// Commit when triggered (or forced) and reset the pending counter
    ///
    /// Returns whether an image was written. A store with nothing pending
    /// is left alone and does not count as a commit.
    pub fn flush_if_needed(&mut self, store: &mut BackingStore, force: bool) -> StorageResult<bool> {
        if !force && !self.should_flush(0) {
            return Ok(false);
        }

        let dirty = store.has_pending();
        store.flush()?;
        if dirty {
            tracing::debug!(
                "Committed {} pending mutations (threshold {})",
                self.pending,
                self.effective_threshold()
            );
            self.commits += 1;
        }
        self.pending = 0;
        self.last_flush = Instant::now();
        Ok(dirty)
    }

    pub fn pending(&self) -> u64 {
        self.pending
    }

    pub fn counts(&self) -> OpCounts {
        self.counts
    }

    pub fn commits(&self) -> u64 {
        self.commits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::store::StoreHandle;

    #[test]
    fn test_memory_threshold_is_half_base_with_floor() {
        assert_eq!(FlushManager::new(10, 0, true).effective_threshold(), 5);
        assert_eq!(FlushManager::new(40, 0, true).effective_threshold(), 20);
        assert_eq!(FlushManager::new(4, 0, true).effective_threshold(), 5);
    }

    #[test]
    fn test_file_threshold_rises_under_load() {
        let mut manager = FlushManager::new(10, 0, false);
        assert_eq!(manager.effective_threshold(), 10);

        manager.record(OpKind::Put, 1001);
        assert_eq!(manager.effective_threshold(), 20);
    }

    #[test]
    fn test_file_threshold_rises_for_batches() {
        let mut manager = FlushManager::new(10, 0, false);
        manager.record(OpKind::Put, 30);
        manager.record(OpKind::BatchPut, 70);
        // 70% batch
        assert_eq!(manager.effective_threshold(), 15);

        manager.record(OpKind::BatchDelete, 300);
        // 92.5% batch
        assert_eq!(manager.effective_threshold(), 20);
    }

    #[test]
    fn test_should_flush_on_count() {
        let mut manager = FlushManager::new(10, 0, false);
        manager.record(OpKind::Put, 9);
        assert!(!manager.should_flush(0));
        assert!(manager.should_flush(1));

        manager.record(OpKind::Delete, 1);
        assert!(manager.should_flush(0));
    }

    #[test]
    fn test_should_flush_on_time() {
        let mut manager = FlushManager::new(1000, 5, false);
        let later = Instant::now() + Duration::from_secs(6);

        // Nothing pending: no commit even after the interval
        assert!(!manager.should_flush_at(0, later));

        manager.record(OpKind::Put, 1);
        assert!(!manager.should_flush_at(0, Instant::now()));
        assert!(manager.should_flush_at(0, later));
    }

    #[test]
    fn test_time_trigger_disabled() {
        let mut manager = FlushManager::new(1000, 0, false);
        manager.record(OpKind::Put, 1);
        let much_later = Instant::now() + Duration::from_secs(3600);
        assert!(!manager.should_flush_at(0, much_later));
    }

    #[test]
    fn test_flush_if_needed_resets_pending() {
        let mut store = BackingStore::open(StoreHandle::memory()).unwrap();
        let mut manager = FlushManager::new(10, 0, true);

        store.set("a", vec![1]);
        manager.record(OpKind::Put, 1);
        assert!(!manager.flush_if_needed(&mut store, false).unwrap());
        assert!(store.has_pending());

        assert!(manager.flush_if_needed(&mut store, true).unwrap());
        assert_eq!(manager.pending(), 0);
        assert_eq!(manager.commits(), 1);
        assert!(!store.has_pending());

        // Totals survive a commit; they drive the adaptive threshold
        assert_eq!(manager.counts().put, 1);
    }

    #[test]
    fn test_forced_flush_of_clean_store_is_not_a_commit() {
        let mut store = BackingStore::open(StoreHandle::memory()).unwrap();
        let mut manager = FlushManager::new(10, 0, true);

        assert!(!manager.flush_if_needed(&mut store, true).unwrap());
        assert_eq!(manager.commits(), 0);

        // Accounted mutations that left the map unchanged still reset
        manager.record(OpKind::Delete, 2);
        assert!(!manager.flush_if_needed(&mut store, true).unwrap());
        assert_eq!(manager.pending(), 0);
        assert_eq!(manager.commits(), 0);
    }
}
