//! Query Executor
//!
//! Evaluates a [`Query`] against the backing store:
//!
//! ```text
//! Store (key order) → skip expired → decode → filter → limit → documents
//! ```
//!
//! Records are decoded lazily, one at a time, and the scan stops as soon as
//! the limit is reached. A record that fails to decode is skipped.

use crate::query::ast::Query;
use crate::storage::compression::Compressor;
use crate::storage::keys;
use crate::storage::store::BackingStore;
use crate::storage::ttl::TtlIndex;
use serde_json::Value;
use std::time::Instant;

/// Result of a query execution
#[derive(Debug, Clone, Default)]
pub struct QueryOutput {
    /// Matching documents in key order
    pub documents: Vec<Value>,
    /// Records decoded and tested
    pub records_scanned: usize,
    /// Records skipped because they could not be decoded
    pub decode_failures: usize,
    pub execution_time_ms: u64,
}

impl QueryOutput {
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

/// Query executor over a borrowed store
pub struct QueryExecutor<'a> {
    store: &'a BackingStore,
    compressor: &'a Compressor,
    /// Session deadlines of caller-named records
    ttl: Option<&'a TtlIndex>,
}

impl<'a> QueryExecutor<'a> {
    pub fn new(store: &'a BackingStore, compressor: &'a Compressor) -> Self {
        Self {
            store,
            compressor,
            ttl: None,
        }
    }

    /// Also hide caller-named records whose session deadline has passed
    pub fn with_ttl_index(mut self, ttl: &'a TtlIndex) -> Self {
        self.ttl = Some(ttl);
        self
    }

    fn is_live(&self, key: &str, now: i64) -> bool {
        keys::is_live(key, now) && !self.ttl.map_or(false, |ttl| ttl.session_expired(key, now))
    }

    /// Run a query to completion
    pub fn execute(&self, query: &Query, now: i64) -> QueryOutput {
        let start = Instant::now();
        let mut output = QueryOutput::default();
        let limit = query.limit.unwrap_or(usize::MAX);

        if limit == 0 {
            return output;
        }

        for (key, record) in self.store.iter() {
            if !self.is_live(key, now) {
                continue;
            }

            let doc = match self.compressor.decode_record(record) {
                Ok(doc) => doc,
                Err(e) => {
                    tracing::warn!("Skipping undecodable record {}: {}", key, e);
                    output.decode_failures += 1;
                    continue;
                }
            };
            output.records_scanned += 1;

            if query.matches(&doc) {
                output.documents.push(doc);
                if output.documents.len() >= limit {
                    break;
                }
            }
        }

        output.execution_time_ms = start.elapsed().as_millis() as u64;
        tracing::debug!(
            "Query matched {} of {} scanned records in {} ms",
            output.documents.len(),
            output.records_scanned,
            output.execution_time_ms
        );
        output
    }
}
