//! Record key codec
//!
//! Generated keys have the shape `"{created_unix_secs}:{ttl_secs}:{suffix}"`,
//! so every key carries its own expiry. `ttl == 0` never expires.

use crate::storage::error::{StorageError, StorageResult};
use chrono::Utc;
use uuid::Uuid;

/// Length of the random hex suffix
const SUFFIX_LEN: usize = 8;

/// Give up after this many consecutive collisions
const MAX_GENERATE_ATTEMPTS: usize = 64;

/// Fields embedded in a generated key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMeta {
    /// Creation time, unix seconds
    pub timestamp: i64,
    /// Time-to-live in seconds (0 = never expires)
    pub ttl: u64,
    pub suffix: String,
}

impl KeyMeta {
    /// Unix time after which the record is expired, if it expires at all
    pub fn expires_at(&self) -> Option<i64> {
        if self.ttl == 0 {
            None
        } else {
            Some(self.timestamp.saturating_add(i64::try_from(self.ttl).unwrap_or(i64::MAX)))
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at().map(|at| now > at).unwrap_or(false)
    }
}

/// How a stored key relates to the generated layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyKind {
    /// Parses as a generated key
    Generated(KeyMeta),
    /// Claims the generated layout but its fields are damaged
    Malformed,
    /// Caller-supplied identifier with no embedded TTL
    Explicit,
}

/// Current unix time in seconds
pub fn now_secs() -> i64 {
    Utc::now().timestamp()
}

/// Generate a key at `now` that `exists` reports as unused
pub fn generate(ttl: u64, now: i64, exists: impl Fn(&str) -> bool) -> StorageResult<String> {
    for _ in 0..MAX_GENERATE_ATTEMPTS {
        let key = format!("{}:{}:{}", now, ttl, random_suffix());
        if !exists(&key) {
            return Ok(key);
        }
        tracing::debug!("Key collision on {}, regenerating", key);
    }

    Err(StorageError::Validation(format!(
        "could not generate a unique key after {} attempts",
        MAX_GENERATE_ATTEMPTS
    )))
}

fn random_suffix() -> String {
    let mut suffix = Uuid::new_v4().simple().to_string();
    suffix.truncate(SUFFIX_LEN);
    suffix
}

/// Parse a generated key
pub fn parse(key: &str) -> Option<KeyMeta> {
    let mut parts = key.splitn(3, ':');
    let timestamp = parts.next()?.parse::<i64>().ok()?;
    let ttl = parts.next()?.parse::<u64>().ok()?;
    let suffix = parts.next()?;
    if suffix.is_empty() {
        return None;
    }

    Some(KeyMeta {
        timestamp,
        ttl,
        suffix: suffix.to_string(),
    })
}

/// Classify a key against the generated layout
///
/// A key claims the layout when it has at least two `:` separators and its
/// first segment is all ASCII digits.
pub fn classify(key: &str) -> KeyKind {
    if let Some(meta) = parse(key) {
        return KeyKind::Generated(meta);
    }

    let mut parts = key.splitn(3, ':');
    let first = parts.next().unwrap_or_default();
    let claims_layout = parts.count() == 2
        && !first.is_empty()
        && first.bytes().all(|b| b.is_ascii_digit());

    if claims_layout {
        KeyKind::Malformed
    } else {
        KeyKind::Explicit
    }
}

/// Expiry check used by cleanup scans
///
/// Damaged generated keys count as expired so they get purged instead of
/// lingering forever. Explicit identifiers never expire by key.
pub fn is_expired(key: &str, now: i64) -> bool {
    match classify(key) {
        KeyKind::Generated(meta) => meta.is_expired(now),
        KeyKind::Malformed => true,
        KeyKind::Explicit => false,
    }
}

/// Expiry check used on the read path; only well-formed generated keys expire
pub fn is_live(key: &str, now: i64) -> bool {
    parse(key).map(|meta| !meta.is_expired(now)).unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_and_parse() {
        let key = generate(60, 1_700_000_000, |_| false).unwrap();
        let meta = parse(&key).unwrap();

        assert_eq!(meta.timestamp, 1_700_000_000);
        assert_eq!(meta.ttl, 60);
        assert_eq!(meta.suffix.len(), SUFFIX_LEN);
        assert!(key.starts_with("1700000000:60:"));
    }

    #[test]
    fn test_generate_retries_on_collision() {
        let attempts = std::cell::Cell::new(0);
        let key = generate(0, 100, |_| {
            attempts.set(attempts.get() + 1);
            attempts.get() < 3
        })
        .unwrap();

        assert_eq!(attempts.get(), 3);
        assert!(key.starts_with("100:0:"));
    }

    #[test]
    fn test_generate_gives_up() {
        let result = generate(0, 100, |_| true);
        assert!(matches!(result, Err(StorageError::Validation(_))));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(parse("").is_none());
        assert!(parse("abc").is_none());
        assert!(parse("100:x:abc").is_none());
        assert!(parse("100:5").is_none());
        assert!(parse("100:5:").is_none());
        assert!(parse("100:-5:abc").is_none());
    }

    #[test]
    fn test_suffix_may_contain_separator() {
        let meta = parse("100:5:a:b").unwrap();
        assert_eq!(meta.suffix, "a:b");
    }

    #[test]
    fn test_expiry_boundaries() {
        let meta = parse("1000:10:abcd").unwrap();
        assert_eq!(meta.expires_at(), Some(1010));
        assert!(!meta.is_expired(1009));
        assert!(!meta.is_expired(1010));
        assert!(meta.is_expired(1011));
    }

    #[test]
    fn test_ttl_beyond_i64_clamps_instead_of_wrapping() {
        let max = parse(&format!("1000:{}:abcd", u64::MAX)).unwrap();
        assert_eq!(max.expires_at(), Some(i64::MAX));
        assert!(!max.is_expired(1001));

        let half = parse(&format!("1000:{}:abcd", 1u64 << 63)).unwrap();
        assert!(!half.is_expired(1001));
        assert!(is_live(&format!("1000:{}:abcd", u64::MAX), 1001));
    }

    #[test]
    fn test_zero_ttl_never_expires() {
        assert!(!is_expired("1000:0:abcd", i64::MAX));
        assert!(is_live("1000:0:abcd", i64::MAX));
    }

    #[test]
    fn test_classify() {
        assert!(matches!(classify("1000:10:abcd"), KeyKind::Generated(_)));
        assert_eq!(classify("1000:xx:abcd"), KeyKind::Malformed);
        assert_eq!(classify("sensor-1"), KeyKind::Explicit);
        assert_eq!(classify("device:temp:1"), KeyKind::Explicit);
        assert_eq!(classify("1000:abcd"), KeyKind::Explicit);
    }

    #[test]
    fn test_malformed_is_expired_in_cleanup() {
        assert!(is_expired("1000:xx:abcd", 0));
        assert!(!is_expired("sensor-1", i64::MAX));
        // The read path does not hide malformed keys
        assert!(is_live("1000:xx:abcd", i64::MAX));
    }
}
