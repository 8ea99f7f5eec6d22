//! The process-wide per-request state registry (§3, §4.4).

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use dashmap::DashMap;
use tracing::{instrument, Level};

use crate::error::{KernelError, Result};

/// Monotonically increasing request identifier, fed by an `AtomicU64`
/// counter. Stringified and installed as a JS global so host functions can
/// look the record back up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    /// Parse a request id from its stringified JS-global form.
    pub fn parse(s: &str) -> Result<Self> {
        s.parse::<u64>()
            .map(RequestId)
            .map_err(|_| KernelError::UnknownRequest(s.to_string()))
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One captured log line.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Log level as reported by `console.*`.
    pub level: String,
    /// The formatted message, truncated to the per-message bound.
    pub message: String,
}

/// A cryptographic key entry kept in a request's key table (§3).
#[derive(Debug, Clone)]
pub struct CryptoKeyEntry {
    /// Raw key bytes.
    pub raw: Vec<u8>,
    /// Algorithm name (e.g. `"AES-GCM"`, `"RSASSA-PKCS1-v1_5"`).
    pub algorithm: String,
    /// Hash name, for algorithms that use one (e.g. `"SHA-256"`).
    pub hash: Option<String>,
    /// Curve name, for EC algorithms.
    pub curve: Option<String>,
    /// `"secret"`, `"public"`, or `"private"`.
    pub key_type: String,
    /// Whether `crypto.subtle.exportKey` may extract this key's bytes.
    pub extractable: bool,
}

type Cleanup = Box<dyn FnOnce() + Send>;

const MAX_LOG_ENTRIES: usize = 1000;
const MAX_LOG_MESSAGE_BYTES: usize = 16 * 1024;

/// The mutex-guarded interior of a request-state record. A single mutex
/// covers the extension map, as §4.4 specifies, plus every other field that
/// isn't itself already atomic/concurrent.
#[derive(Default)]
pub struct RequestStateInner {
    logs: Vec<LogEntry>,
    fetch_count: u32,
    fetch_ceiling: u32,
    crypto_keys: HashMap<u64, CryptoKeyEntry>,
    next_crypto_key_id: u64,
    extensions: HashMap<String, Box<dyn Any + Send>>,
    cleanups: Vec<Cleanup>,
}

impl RequestStateInner {
    fn new(fetch_ceiling: u32) -> Self {
        Self {
            fetch_ceiling,
            ..Default::default()
        }
    }

    /// Append a captured log line, respecting the per-request count bound
    /// and per-message size bound.
    pub fn push_log(&mut self, level: impl Into<String>, message: impl Into<String>) {
        if self.logs.len() >= MAX_LOG_ENTRIES {
            return;
        }
        let mut message = message.into();
        if message.len() > MAX_LOG_MESSAGE_BYTES {
            message.truncate(MAX_LOG_MESSAGE_BYTES);
        }
        self.logs.push(LogEntry {
            level: level.into(),
            message,
        });
    }

    /// Take ownership of the captured logs, leaving the record empty.
    pub fn take_logs(&mut self) -> Vec<LogEntry> {
        std::mem::take(&mut self.logs)
    }

    /// Attempt to reserve one outbound fetch slot. Returns `Err` once the
    /// configured ceiling is reached (§8 S6).
    pub fn try_reserve_fetch(&mut self) -> Result<()> {
        if self.fetch_count >= self.fetch_ceiling {
            return Err(crate::new_error!(
                "exceeded maximum fetch requests ({})",
                self.fetch_ceiling
            ));
        }
        self.fetch_count += 1;
        Ok(())
    }

    /// Store a cryptographic key, returning the integer id JS will use to
    /// refer to it.
    pub fn insert_crypto_key(&mut self, entry: CryptoKeyEntry) -> u64 {
        let id = self.next_crypto_key_id;
        self.next_crypto_key_id += 1;
        self.crypto_keys.insert(id, entry);
        id
    }

    /// Look up a previously stored cryptographic key.
    pub fn crypto_key(&self, id: u64) -> Option<&CryptoKeyEntry> {
        self.crypto_keys.get(&id)
    }

    /// Get (lazily creating) a binding's typed extension state.
    pub fn extension_or_insert_with<T: Any + Send + 'static>(
        &mut self,
        key: &str,
        default: impl FnOnce() -> T,
    ) -> &mut T {
        self.extensions
            .entry(key.to_string())
            .or_insert_with(|| Box::new(default()))
            .downcast_mut::<T>()
            .expect("extension type mismatch for key")
    }

    /// Register a cleanup to run, last-registered-first, when the request
    /// state is cleared.
    pub fn register_cleanup(&mut self, cleanup: impl FnOnce() + Send + 'static) {
        self.cleanups.push(Box::new(cleanup));
    }

    /// Run every registered cleanup in reverse registration order.
    fn run_cleanups(&mut self) {
        while let Some(cleanup) = self.cleanups.pop() {
            cleanup();
        }
    }
}

/// A cleared request-state record, handed back to the caller so it can
/// attach captured logs to the invocation result.
pub struct ClearedRequestState {
    /// Captured log lines, in emission order.
    pub logs: Vec<LogEntry>,
}

/// The process-wide mapping from request id to record (§4.4).
#[derive(Default)]
pub struct RequestStateRegistry {
    records: DashMap<RequestId, Mutex<RequestStateInner>>,
    next_id: AtomicU64,
}

impl RequestStateRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically allocate a fresh request id and install its record.
    #[instrument(skip(self), level = Level::DEBUG)]
    pub fn new_request_state(&self, fetch_ceiling: u32) -> RequestId {
        let id = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.records.insert(id, Mutex::new(RequestStateInner::new(fetch_ceiling)));
        id
    }

    /// Lock and return a record, or `None` if it doesn't exist (a late
    /// host-function call racing teardown, per §4.4).
    pub fn get(&self, id: RequestId) -> Option<MappedRecord<'_>> {
        self.records.get(&id).map(MappedRecord)
    }

    /// Remove and clear a record: run its cleanups in reverse order and
    /// return its captured logs. `None` if the id is unknown.
    #[instrument(skip(self), level = Level::DEBUG)]
    pub fn clear_request_state(&self, id: RequestId) -> Option<ClearedRequestState> {
        let (_, record) = self.records.remove(&id)?;
        let mut inner = record.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.run_cleanups();
        Some(ClearedRequestState {
            logs: inner.take_logs(),
        })
    }
}

/// A borrowed record from the registry. `dashmap::mapref::one::Ref` can't
/// name the exact associated lifetime in a public signature cleanly, so this
/// newtype gives callers a `lock()` method without leaking the dashmap
/// dependency into every call site.
pub struct MappedRecord<'a>(dashmap::mapref::one::Ref<'a, RequestId, Mutex<RequestStateInner>>);

impl MappedRecord<'_> {
    /// Lock the record's single mutex.
    pub fn lock(&self) -> MutexGuard<'_, RequestStateInner> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_request_state_allocates_monotonic_ids() {
        let registry = RequestStateRegistry::new();
        let a = registry.new_request_state(10);
        let b = registry.new_request_state(10);
        assert!(b.0 > a.0);
    }

    #[test]
    fn get_returns_none_after_clear() {
        let registry = RequestStateRegistry::new();
        let id = registry.new_request_state(10);
        assert!(registry.get(id).is_some());
        registry.clear_request_state(id);
        assert!(registry.get(id).is_none());
    }

    #[test]
    fn cleanups_run_in_reverse_registration_order() {
        let registry = RequestStateRegistry::new();
        let id = registry.new_request_state(10);
        let order = std::sync::Arc::new(Mutex::new(Vec::new()));

        {
            let record = registry.get(id).unwrap();
            let mut inner = record.lock();
            for i in 0..3 {
                let order = order.clone();
                inner.register_cleanup(move || order.lock().unwrap().push(i));
            }
        }

        registry.clear_request_state(id);
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn fetch_ceiling_rejects_past_limit() {
        let mut inner = RequestStateInner::new(1);
        assert!(inner.try_reserve_fetch().is_ok());
        assert!(inner.try_reserve_fetch().is_err());
    }

    #[test]
    fn logs_are_captured_and_taken() {
        let mut inner = RequestStateInner::new(10);
        inner.push_log("info", "hello");
        let logs = inner.take_logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].message, "hello");
        assert!(inner.take_logs().is_empty());
    }

    #[test]
    fn parse_rejects_non_numeric_ids() {
        assert!(RequestId::parse("not-a-number").is_err());
        assert!(RequestId::parse("42").is_ok());
    }
}
