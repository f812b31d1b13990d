//! TTL result cache for successful protected calls.
//!
//! Entries expire lazily: an expired entry is removed by the read that finds it (or by
//! [`ResultCache::purge_expired`]). Reads and writes are synchronous and never suspend.
//!
//! Keys for structured inputs come from [`cache_key`], which hashes a canonical JSON form of
//! the input so field order never changes the key:
//!
//! ```rust
//! use breakwater::cache::cache_key;
//! use serde_json::json;
//!
//! let a = cache_key("authz/allow", &json!({"user": "ana", "action": "read"})).unwrap();
//! let b = cache_key("authz/allow", &json!({"action": "read", "user": "ana"})).unwrap();
//! assert_eq!(a, b);
//! assert!(a.starts_with("authz/allow:"));
//! ```

use crate::clock::{millis, Clock, TokioClock};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: u64,
}

/// In-memory key → value store with per-entry expiry.
#[derive(Debug)]
pub struct ResultCache<V> {
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
    clock: Arc<dyn Clock>,
}

impl<V: Clone> Default for ResultCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone> ResultCache<V> {
    /// Cache on tokio's clock.
    pub fn new() -> Self {
        Self::with_shared_clock(Arc::new(TokioClock::default()))
    }

    pub fn with_clock<C: Clock + 'static>(clock: C) -> Self {
        Self::with_shared_clock(Arc::new(clock))
    }

    pub fn with_shared_clock(clock: Arc<dyn Clock>) -> Self {
        Self { entries: Mutex::new(HashMap::new()), clock }
    }

    /// Value stored under `key`, unless it has expired.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now_millis();
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if now < entry.expires_at => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Store `value` for `ttl`, replacing any previous entry.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let expires_at = self.clock.now_millis().saturating_add(millis(ttl));
        self.lock().insert(key.into(), CacheEntry { value, expires_at });
    }

    /// Remove every entry whose key starts with `prefix`. Returns how many were removed.
    pub fn invalidate(&self, prefix: &str) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        before - entries.len()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Stored entries, expired ones included until something evicts them.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| now < entry.expires_at);
        before - entries.len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry<V>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// `"{operation}:{hex(sha256(canonical json of input))}"`.
///
/// # Errors
/// Fails when `input` cannot be represented as JSON (for example a map with non-string keys).
pub fn cache_key<T: Serialize + ?Sized>(operation: &str, input: &T) -> Result<String, serde_json::Error> {
    let value = serde_json::to_value(input)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(&value).as_bytes());
    Ok(format!("{operation}:{}", hex::encode(hasher.finalize())))
}

/// Compact JSON with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
