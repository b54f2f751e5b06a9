//! Engine state owned by the worker
//!
//! Everything that mutates the backing store lives here. The worker task
//! applies operations one at a time; the engine handle only reaches in to
//! commit when it is dropped. The mutation lock turns a second mutation in
//! flight into a `DBLock` error.

use crate::query::{parse_filter, QueryExecutor, TAGS_FIELD};
use crate::storage::compression::Compressor;
use crate::storage::engine::{EngineConfig, EngineStats, PutOptions};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::flush::{FlushManager, OpKind};
use crate::storage::keys::{self, KeyKind};
use crate::storage::store::{BackingStore, StoreHandle};
use crate::storage::ttl::TtlIndex;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub(crate) struct EngineState {
    config: EngineConfig,
    store: BackingStore,
    flush: FlushManager,
    ttl: TtlIndex,
    compressor: Compressor,
    mutation_lock: Arc<Mutex<()>>,
    /// Image size when the engine was opened (diagnostics baseline)
    baseline_image_bytes: u64,
}

impl EngineState {
    /// Open the store, purge what expired while we were down, rebuild the index
    pub(crate) fn open(config: EngineConfig, now: i64) -> StorageResult<Self> {
        let handle = config.store_handle();
        let store = match BackingStore::open(handle.clone()) {
            Ok(store) => store,
            Err(e) => {
                tracing::warn!("Failed to open backing store, starting fresh: {}", e);
                Self::open_fresh(&handle)?
            }
        };

        let mut state = Self {
            flush: FlushManager::new(
                config.flush_threshold,
                config.auto_flush_secs,
                store.is_memory(),
            ),
            compressor: config.compressor(),
            baseline_image_bytes: store.image_size(),
            store,
            ttl: TtlIndex::new(),
            mutation_lock: Arc::new(Mutex::new(())),
            config,
        };

        // The index does not exist yet, so the cold-start pass scans keys
        let expired = state.ttl.full_cleanup(&mut state.store, now);
        let tracked = state.ttl.rebuild(state.store.iter().map(|(key, _)| key));
        if expired > 0 {
            state.flush.record(OpKind::Delete, expired as u64);
            state.flush.flush_if_needed(&mut state.store, true)?;
        }
        state.store.vacuum(state.config.vacuum_threshold_bytes)?;

        tracing::info!(
            "Opened engine: {} records, {} TTL entries, {} expired on start",
            state.store.len(),
            tracked,
            expired
        );
        Ok(state)
    }

    fn open_fresh(handle: &StoreHandle) -> StorageResult<BackingStore> {
        match handle {
            StoreHandle::Memory(_) => BackingStore::open(StoreHandle::memory()),
            StoreHandle::File(path) => {
                match std::fs::remove_file(path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                BackingStore::open(StoreHandle::File(path.clone()))
            }
        }
    }

    fn lock(&self) -> StorageResult<OwnedMutexGuard<()>> {
        Arc::clone(&self.mutation_lock)
            .try_lock_owned()
            .map_err(|_| StorageError::Lock("a mutation is already in progress".to_string()))
    }

    /// Validate and encode a document into a stored record
    fn encode(&self, document: Value, tags: Option<Vec<String>>) -> StorageResult<Vec<u8>> {
        let mut fields: Map<String, Value> = match document {
            Value::Object(fields) => fields,
            other => {
                return Err(StorageError::Validation(format!(
                    "document must be a JSON object, got {}",
                    other
                )))
            }
        };

        if let Some(tags) = tags {
            fields.insert(
                TAGS_FIELD.to_string(),
                Value::Array(tags.into_iter().map(Value::String).collect()),
            );
        }

        let json = serde_json::to_vec(&Value::Object(fields))?;
        if json.len() > self.config.max_document_bytes {
            return Err(StorageError::Validation(format!(
                "document is {} bytes, limit is {}",
                json.len(),
                self.config.max_document_bytes
            )));
        }

        Ok(self.compressor.encode_record(&json))
    }

    /// Store an encoded record under a new or caller-chosen key
    fn insert(
        &mut self,
        record: Vec<u8>,
        ttl: u64,
        id: Option<String>,
        now: i64,
    ) -> StorageResult<String> {
        let key = match id {
            Some(id) => {
                validate_explicit_id(&id)?;
                id
            }
            None => {
                let store = &self.store;
                keys::generate(ttl, now, |candidate| store.contains(candidate))?
            }
        };

        self.store.set(key.clone(), record);
        self.ttl.add(&key, ttl, now);
        Ok(key)
    }

    pub(crate) fn put(
        &mut self,
        document: Value,
        options: PutOptions,
        now: i64,
    ) -> StorageResult<String> {
        let _guard = self.lock()?;

        let record = self.encode(document, options.tags)?;
        let key = self.insert(record, options.ttl, options.id, now)?;

        self.flush.record(OpKind::Put, 1);
        self.flush.flush_if_needed(&mut self.store, false)?;

        tracing::debug!("put {}", key);
        Ok(key)
    }

    /// Read a record; absent, expired and undecodable records all read as `None`
    pub(crate) fn get(&self, key: &str, now: i64) -> StorageResult<Option<Value>> {
        if !keys::is_live(key, now) || self.ttl.session_expired(key, now) {
            return Ok(None);
        }

        let Some(record) = self.store.get(key) else {
            return Ok(None);
        };

        match self.compressor.decode_record(record) {
            Ok(document) => Ok(Some(document)),
            Err(e) => {
                tracing::warn!("Record {} could not be decoded: {}", key, e);
                Ok(None)
            }
        }
    }

    pub(crate) fn delete(&mut self, key: &str) -> StorageResult<usize> {
        let _guard = self.lock()?;

        self.ttl.forget(key);
        if !self.store.delete(key) {
            return Ok(0);
        }

        self.flush.record(OpKind::Delete, 1);
        self.flush.flush_if_needed(&mut self.store, false)?;
        Ok(1)
    }

    /// Drop every record and recreate the backing image
    pub(crate) fn purge(&mut self) -> StorageResult<usize> {
        let _guard = self.lock()?;

        let removed = self.store.len();
        self.store.clear();
        self.ttl.clear();

        self.flush.record(OpKind::Delete, removed as u64);
        self.flush.flush_if_needed(&mut self.store, true)?;
        self.store.vacuum(0)?;

        tracing::info!("Purged {} records", removed);
        Ok(removed)
    }

    /// Insert many documents as one operation
    ///
    /// Items that fail validation are skipped; the returned keys belong to
    /// the stored items, in input order.
    pub(crate) fn put_batch(
        &mut self,
        documents: Vec<Value>,
        ttls: Option<Vec<u64>>,
        now: i64,
    ) -> StorageResult<Vec<String>> {
        let _guard = self.lock()?;

        if let Some(ttls) = &ttls {
            if ttls.len() != documents.len() {
                return Err(StorageError::Validation(format!(
                    "got {} TTLs for {} documents",
                    ttls.len(),
                    documents.len()
                )));
            }
        }

        let mut ttls = ttls.map(Vec::into_iter);
        let mut stored = Vec::with_capacity(documents.len());

        for (idx, document) in documents.into_iter().enumerate() {
            let ttl = ttls.as_mut().and_then(Iterator::next).unwrap_or(0);
            let record = match self.encode(document, None) {
                Ok(record) => record,
                Err(StorageError::Validation(reason)) => {
                    tracing::warn!("Skipping batch item {}: {}", idx, reason);
                    continue;
                }
                Err(e) => return Err(e),
            };
            stored.push(self.insert(record, ttl, None, now)?);
        }

        // A batch is one accounting unit however many items it carries
        if !stored.is_empty() {
            self.flush.record(OpKind::BatchPut, 1);
            self.flush.flush_if_needed(&mut self.store, false)?;
        }

        tracing::debug!("put_batch stored {} records", stored.len());
        Ok(stored)
    }

    pub(crate) fn delete_batch(&mut self, keys: &[String]) -> StorageResult<usize> {
        let _guard = self.lock()?;

        let mut removed = 0;
        for key in keys {
            self.ttl.forget(key);
            if self.store.delete(key) {
                removed += 1;
            }
        }

        if removed > 0 {
            self.flush.record(OpKind::BatchDelete, 1);
            self.flush.flush_if_needed(&mut self.store, false)?;
        }
        Ok(removed)
    }

    pub(crate) fn query(&self, filter: &Value, now: i64) -> StorageResult<Vec<Value>> {
        let query = parse_filter(filter, self.config.max_query_limit)?;
        let executor = QueryExecutor::new(&self.store, &self.compressor).with_ttl_index(&self.ttl);
        Ok(executor.execute(&query, now).documents)
    }

    /// Heap-driven expiry pass
    pub(crate) fn sweep(&mut self, now: i64) -> StorageResult<usize> {
        let _guard = self.lock()?;

        let removed = self.ttl.sweep(&mut self.store, now);
        if removed > 0 {
            self.flush.record(OpKind::Delete, removed as u64);
            self.flush.flush_if_needed(&mut self.store, false)?;
        }
        Ok(removed)
    }

    /// Full key scan, independent of the index
    pub(crate) fn cleanup(&mut self, now: i64) -> StorageResult<usize> {
        let _guard = self.lock()?;

        let removed = self.ttl.full_cleanup(&mut self.store, now);
        if removed > 0 {
            self.flush.record(OpKind::Delete, removed as u64);
            self.flush.flush_if_needed(&mut self.store, false)?;
        }
        if self.store.is_empty() {
            self.flush.flush_if_needed(&mut self.store, true)?;
            self.store.vacuum(self.config.vacuum_threshold_bytes)?;
        }
        Ok(removed)
    }

    /// Force a commit
    pub(crate) fn flush(&mut self) -> StorageResult<()> {
        self.flush.flush_if_needed(&mut self.store, true)?;
        Ok(())
    }

    /// Periodic housekeeping: time-triggered commits
    pub(crate) fn tick(&mut self) -> StorageResult<bool> {
        self.flush.flush_if_needed(&mut self.store, false)
    }

    pub(crate) fn stats(&self) -> EngineStats {
        EngineStats {
            records: self.store.len(),
            ttl_index_entries: self.ttl.len(),
            pending_ops: self.flush.pending(),
            total_ops: self.flush.counts().total(),
            commits: self.flush.commits(),
            image_bytes: self.store.image_size(),
            baseline_image_bytes: self.baseline_image_bytes,
            in_memory: self.store.is_memory(),
        }
    }

    /// Commit and release the store; safe to call more than once
    pub(crate) fn close(&mut self) -> StorageResult<()> {
        if self.store.is_closed() {
            return Ok(());
        }
        self.flush.flush_if_needed(&mut self.store, true)?;
        self.store.close()?;
        tracing::info!("Closed backing store");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn mutation_lock(&self) -> Arc<Mutex<()>> {
        Arc::clone(&self.mutation_lock)
    }

    #[cfg(test)]
    pub(crate) fn store(&self) -> &BackingStore {
        &self.store
    }
}

fn validate_explicit_id(id: &str) -> StorageResult<()> {
    if id.is_empty() {
        return Err(StorageError::Validation("identifier must not be empty".to_string()));
    }
    if keys::classify(id) == KeyKind::Malformed {
        return Err(StorageError::Validation(format!(
            "identifier '{}' looks like a generated key but does not parse",
            id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    const NOW: i64 = 1_700_000_000;

    fn memory_state() -> EngineState {
        EngineState::open(EngineConfig::in_memory().flush_threshold(u64::MAX), NOW).unwrap()
    }

    #[test]
    fn test_read_after_write_before_flush() {
        let mut state = memory_state();
        let doc = json!({"sensor": "t1", "value": 21.5, "nested": {"ok": true}});

        let key = state.put(doc.clone(), PutOptions::default(), NOW).unwrap();

        assert!(state.store().has_pending());
        assert_eq!(state.get(&key, NOW).unwrap(), Some(doc));
    }

    #[test]
    fn test_delete_visible_before_flush() {
        let mut state = memory_state();
        let key = state.put(json!({"x": 1}), PutOptions::default(), NOW).unwrap();

        assert_eq!(state.delete(&key).unwrap(), 1);
        assert_eq!(state.delete(&key).unwrap(), 0);
        assert_eq!(state.get(&key, NOW).unwrap(), None);
    }

    #[test]
    fn test_tags_are_stored() {
        let mut state = memory_state();
        let options = PutOptions::new().tag("alarm").tag("kitchen");
        let key = state.put(json!({"x": 1}), options, NOW).unwrap();

        let doc = state.get(&key, NOW).unwrap().unwrap();
        assert_eq!(doc["_tags"], json!(["alarm", "kitchen"]));

        let hits = state.query(&json!({"tags": "alarm"}), NOW).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_ttl_expiry_via_sweep_and_cleanup() {
        let mut state = memory_state();
        let short = state.put(json!({"v": 1}), PutOptions::new().ttl(10), NOW).unwrap();
        let long = state.put(json!({"v": 2}), PutOptions::new().ttl(100), NOW).unwrap();
        let forever = state.put(json!({"v": 3}), PutOptions::default(), NOW).unwrap();

        assert!(state.get(&short, NOW + 9).unwrap().is_some());
        // Hidden on the read path as soon as the deadline passes
        assert!(state.get(&short, NOW + 11).unwrap().is_none());

        assert_eq!(state.sweep(NOW + 11).unwrap(), 1);
        assert!(!state.store().contains(&short));

        assert_eq!(state.cleanup(NOW + 101).unwrap(), 1);
        assert!(!state.store().contains(&long));
        assert!(state.get(&forever, i64::MAX).unwrap().is_some());
    }

    #[test]
    fn test_oversized_document_rejected() {
        let mut state = EngineState::open(
            EngineConfig::in_memory().max_document_bytes(64),
            NOW,
        )
        .unwrap();

        let big = json!({"payload": "x".repeat(100)});
        let result = state.put(big, PutOptions::default(), NOW);

        assert!(matches!(result, Err(StorageError::Validation(_))));
        assert!(state.store().is_empty());
    }

    #[test]
    fn test_non_object_document_rejected() {
        let mut state = memory_state();
        let result = state.put(json!([1, 2, 3]), PutOptions::default(), NOW);
        assert!(matches!(result, Err(StorageError::Validation(_))));
    }

    #[test]
    fn test_large_document_compressed_round_trip() {
        let mut state = memory_state();
        let readings: Vec<Value> = (0..50).map(|i| json!({"t": i, "unit": "celsius"})).collect();
        let doc = json!({"device": "thermo", "readings": readings});

        let key = state.put(doc.clone(), PutOptions::default(), NOW).unwrap();

        assert_eq!(state.store().get(&key).unwrap()[0], 1);
        assert_eq!(state.get(&key, NOW).unwrap(), Some(doc));
    }

    #[test]
    fn test_batch_put_and_delete() {
        let mut state = memory_state();
        let keys = state
            .put_batch(vec![json!({"a": 1}), json!({"b": 2}), json!({"c": 3})], None, NOW)
            .unwrap();
        assert_eq!(keys.len(), 3);

        assert_eq!(state.delete_batch(&keys[..2]).unwrap(), 2);
        assert!(state.get(&keys[2], NOW).unwrap().is_some());
        assert!(state.get(&keys[0], NOW).unwrap().is_none());
    }

    #[test]
    fn test_batch_counts_as_one_mutation() {
        let mut state = memory_state();
        let keys = state
            .put_batch(vec![json!({"a": 1}), json!({"b": 2}), json!({"c": 3})], None, NOW)
            .unwrap();
        assert_eq!(state.stats().pending_ops, 1);

        state.delete_batch(&keys).unwrap();
        assert_eq!(state.stats().pending_ops, 2);

        // Nothing removed, nothing accounted
        assert_eq!(state.delete_batch(&keys).unwrap(), 0);
        assert_eq!(state.stats().pending_ops, 2);
    }

    #[test]
    fn test_batch_skips_invalid_items() {
        let mut state = EngineState::open(EngineConfig::in_memory().max_document_bytes(32), NOW)
            .unwrap();
        let keys = state
            .put_batch(
                vec![
                    json!({"a": 1}),
                    json!("not a document"),
                    json!({"big": "y".repeat(64)}),
                    json!({"b": 2}),
                ],
                Some(vec![0, 0, 0, 30]),
                NOW,
            )
            .unwrap();

        assert_eq!(keys.len(), 2);
        assert!(keys[1].starts_with(&format!("{}:30:", NOW)));
    }

    #[test]
    fn test_batch_ttl_length_mismatch() {
        let mut state = memory_state();
        let result = state.put_batch(vec![json!({"a": 1}), json!({"b": 2})], Some(vec![10]), NOW);
        assert!(matches!(result, Err(StorageError::Validation(_))));
        assert!(state.store().is_empty());
    }

    #[test]
    fn test_explicit_identifier() {
        let mut state = memory_state();
        let options = PutOptions::new().id("greenhouse/sensor-1");
        let key = state.put(json!({"v": 1}), options, NOW).unwrap();
        assert_eq!(key, "greenhouse/sensor-1");

        // Upsert under the same identifier
        state
            .put(json!({"v": 2}), PutOptions::new().id("greenhouse/sensor-1"), NOW)
            .unwrap();
        assert_eq!(state.get(&key, NOW).unwrap(), Some(json!({"v": 2})));

        // Never purged by a cleanup scan
        assert_eq!(state.cleanup(i64::MAX).unwrap(), 0);
    }

    #[test]
    fn test_explicit_identifier_session_ttl() {
        let mut state = memory_state();
        let options = PutOptions::new().id("sensor-7").ttl(30);
        state.put(json!({"v": 1}), options, NOW).unwrap();

        assert!(state.get("sensor-7", NOW + 30).unwrap().is_some());
        assert!(state.get("sensor-7", NOW + 31).unwrap().is_none());
        assert_eq!(state.sweep(NOW + 31).unwrap(), 1);
    }

    #[test]
    fn test_query_hides_explicit_identifier_past_session_deadline() {
        let mut state = memory_state();
        state
            .put(json!({"v": 1}), PutOptions::new().id("sensor-7").ttl(30), NOW)
            .unwrap();
        state.put(json!({"v": 2}), PutOptions::new().id("sensor-8"), NOW).unwrap();

        assert_eq!(state.query(&json!({}), NOW + 30).unwrap().len(), 2);
        // No sweep has run; the record is still in the store
        assert_eq!(state.query(&json!({}), NOW + 31).unwrap(), vec![json!({"v": 2})]);
        assert!(state.store().contains("sensor-7"));
    }

    #[test]
    fn test_huge_ttl_never_expires() {
        let mut state = memory_state();
        let max = state.put(json!({"v": 1}), PutOptions::new().ttl(u64::MAX), NOW).unwrap();
        let half = state.put(json!({"v": 2}), PutOptions::new().ttl(1 << 63), NOW).unwrap();
        state
            .put(json!({"v": 3}), PutOptions::new().id("sensor-9").ttl(u64::MAX), NOW)
            .unwrap();

        assert!(state.get(&max, NOW + 1).unwrap().is_some());
        assert!(state.get(&half, NOW + 1).unwrap().is_some());
        assert!(state.get("sensor-9", NOW + 1).unwrap().is_some());
        assert_eq!(state.sweep(NOW + 1).unwrap(), 0);
        assert_eq!(state.cleanup(NOW + 1).unwrap(), 0);
        assert_eq!(state.query(&json!({}), NOW + 1).unwrap().len(), 3);
    }

    #[test]
    fn test_malformed_explicit_identifier_rejected() {
        let mut state = memory_state();
        let result = state.put(json!({"v": 1}), PutOptions::new().id("123:abc:x"), NOW);
        assert!(matches!(result, Err(StorageError::Validation(_))));

        let result = state.put(json!({"v": 1}), PutOptions::new().id(""), NOW);
        assert!(matches!(result, Err(StorageError::Validation(_))));
    }

    #[test]
    fn test_lock_contention_fails_fast() {
        let mut state = memory_state();
        let lock = state.mutation_lock();
        let _held = lock.try_lock().unwrap();

        let result = state.put(json!({"x": 1}), PutOptions::default(), NOW);
        assert!(matches!(result, Err(StorageError::Lock(_))));
        assert!(matches!(state.sweep(NOW), Err(StorageError::Lock(_))));
        assert!(state.store().is_empty());
    }

    #[test]
    fn test_purge() {
        let mut state = memory_state();
        for i in 0..5 {
            state.put(json!({"i": i}), PutOptions::new().ttl(60), NOW).unwrap();
        }

        assert_eq!(state.purge().unwrap(), 5);
        assert!(state.store().is_empty());
        assert_eq!(state.stats().ttl_index_entries, 0);
        assert_eq!(state.stats().pending_ops, 0);
        assert_eq!(state.stats().commits, 1);
    }

    #[test]
    fn test_cleanup_of_empty_store_commits_nothing() {
        let mut state = memory_state();
        state.flush().unwrap();
        assert_eq!(state.cleanup(NOW).unwrap(), 0);
        assert_eq!(state.cleanup(NOW).unwrap(), 0);
        assert_eq!(state.stats().commits, 0);

        let key = state.put(json!({"x": 1}), PutOptions::default(), NOW).unwrap();
        state.delete(&key).unwrap();
        state.cleanup(NOW).unwrap();
        assert_eq!(state.stats().commits, 1);
    }

    #[test]
    fn test_adaptive_commit_in_memory() {
        let mut state = EngineState::open(
            EngineConfig::in_memory().flush_threshold(10).auto_flush_secs(0),
            NOW,
        )
        .unwrap();

        for i in 0..4 {
            state.put(json!({"i": i}), PutOptions::default(), NOW).unwrap();
        }
        assert_eq!(state.stats().pending_ops, 4);

        // In-memory threshold is half the base
        state.put(json!({"i": 4}), PutOptions::default(), NOW).unwrap();
        assert_eq!(state.stats().pending_ops, 0);
        assert_eq!(state.stats().commits, 1);
    }

    #[test]
    fn test_cold_start_cleanup_and_rebuild() {
        let dir = tempdir().unwrap();
        let config = EngineConfig::file(dir.path().join("data.tkv"));

        let (expiring, lasting) = {
            let mut state = EngineState::open(config.clone(), NOW).unwrap();
            let expiring = state.put(json!({"v": 1}), PutOptions::new().ttl(10), NOW).unwrap();
            let lasting = state.put(json!({"v": 2}), PutOptions::new().ttl(1000), NOW).unwrap();
            state.close().unwrap();
            state.close().unwrap();
            (expiring, lasting)
        };

        let mut state = EngineState::open(config, NOW + 100).unwrap();
        assert!(!state.store().contains(&expiring));
        assert!(state.store().contains(&lasting));
        assert_eq!(state.stats().ttl_index_entries, 1);

        assert_eq!(state.sweep(NOW + 1001).unwrap(), 1);
    }

    #[test]
    fn test_open_fails_when_fallback_fails() {
        let dir = tempdir().unwrap();
        // A directory can be neither read as an image nor removed as a file
        let config = EngineConfig::file(dir.path());
        assert!(EngineState::open(config, NOW).is_err());
    }
}
