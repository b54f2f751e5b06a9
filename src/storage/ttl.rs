//! TTL expiry index
//!
//! A min-heap of `(expires_at, key)` rebuilt from key strings at startup and
//! grown on every TTL-bearing insert. Deleting a record never touches the
//! heap: stale entries are recognised and dropped when they reach the top.

use crate::storage::keys::{self, KeyKind};
use crate::storage::store::BackingStore;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// Min-heap index of pending expirations
#[derive(Debug, Default)]
pub struct TtlIndex {
    heap: BinaryHeap<Reverse<(i64, String)>>,
    /// Session-only deadlines for caller-named records
    explicit: HashMap<String, i64>,
}

impl TtlIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly written record
    ///
    /// Generated keys carry their own deadline. For any other identifier the
    /// deadline lives only in this index, so it does not survive a restart.
    pub fn add(&mut self, key: &str, ttl: u64, now: i64) {
        match keys::classify(key) {
            KeyKind::Generated(meta) => {
                if let Some(at) = meta.expires_at() {
                    self.heap.push(Reverse((at, key.to_string())));
                }
            }
            KeyKind::Explicit | KeyKind::Malformed => {
                if ttl > 0 {
                    let at = now.saturating_add(i64::try_from(ttl).unwrap_or(i64::MAX));
                    self.explicit.insert(key.to_string(), at);
                    self.heap.push(Reverse((at, key.to_string())));
                } else {
                    // Overwritten without a TTL: any older heap entry goes stale
                    self.explicit.remove(key);
                }
            }
        }
    }

    /// Forget a session deadline for a caller-named record
    pub fn forget(&mut self, key: &str) {
        self.explicit.remove(key);
    }

    /// Rebuild from persisted keys; returns the number of tracked entries
    pub fn rebuild<'a>(&mut self, keys: impl IntoIterator<Item = &'a str>) -> usize {
        self.clear();
        for key in keys {
            if let Some(at) = keys::parse(key).and_then(|meta| meta.expires_at()) {
                self.heap.push(Reverse((at, key.to_string())));
            }
        }
        tracing::debug!("Rebuilt TTL index with {} entries", self.heap.len());
        self.heap.len()
    }

    /// Delete records whose deadline has passed, driven by the heap
    ///
    /// Entries for keys that no longer exist are discarded silently.
    pub fn sweep(&mut self, store: &mut BackingStore, now: i64) -> usize {
        let mut deleted = 0;

        while let Some(Reverse((at, _))) = self.heap.peek() {
            if *at > now {
                break;
            }
            let Some(Reverse((at, key))) = self.heap.pop() else {
                break;
            };

            if !self.entry_is_current(&key, at) {
                continue;
            }

            self.explicit.remove(&key);
            if store.delete(&key) {
                deleted += 1;
            }
        }

        if deleted > 0 {
            tracing::debug!("TTL sweep removed {} records", deleted);
        }
        deleted
    }

    /// Scan every stored key and delete the expired ones, independent of the heap
    pub fn full_cleanup(&mut self, store: &mut BackingStore, now: i64) -> usize {
        let expired: Vec<String> = store
            .iter()
            .map(|(key, _)| key)
            .filter(|key| keys::is_expired(key, now) || self.session_expired(key, now))
            .map(str::to_string)
            .collect();

        let mut deleted = 0;
        for key in &expired {
            self.explicit.remove(key);
            if store.delete(key) {
                deleted += 1;
            }
        }

        if deleted > 0 {
            tracing::info!("Full cleanup removed {} expired records", deleted);
        }
        deleted
    }

    /// Whether a popped entry still describes the record stored under `key`
    fn entry_is_current(&self, key: &str, at: i64) -> bool {
        match keys::classify(key) {
            KeyKind::Generated(_) => true,
            _ => self.explicit.get(key) == Some(&at),
        }
    }

    /// Whether a caller-named record has outlived its session deadline
    pub fn session_expired(&self, key: &str, now: i64) -> bool {
        self.explicit.get(key).map(|at| now > *at).unwrap_or(false)
    }

    /// Earliest tracked deadline (may be stale)
    pub fn next_expiry(&self) -> Option<i64> {
        self.heap.peek().map(|Reverse((at, _))| *at)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.explicit.clear();
    }
}
