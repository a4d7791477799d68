use crate::core::geo::TileKey;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// Failure history of one tile
#[derive(Debug, Clone, PartialEq)]
pub struct FailureRecord {
    pub key: TileKey,
    pub last_error: String,
    /// Failed attempts so far, the first one included
    pub attempts: u32,
    pub last_attempt_at: Instant,
    /// No further automatic retries
    pub terminal: bool,
}

impl FailureRecord {
    /// Retries performed after the first attempt
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Bounded memo of tiles that failed to load.
///
/// A key may fail `retry_cap + 1` times (the first attempt plus `retry_cap`
/// retries) before its record turns terminal. The least recently touched
/// records are dropped once `capacity` is reached.
#[derive(Debug)]
pub struct FailureLedger {
    records: Mutex<LruCache<TileKey, FailureRecord>>,
    retry_cap: u32,
}

impl FailureLedger {
    pub fn new(retry_cap: u32, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            records: Mutex::new(LruCache::new(capacity)),
            retry_cap,
        }
    }

    pub fn retry_cap(&self) -> u32 {
        self.retry_cap
    }

    /// Counts one more failed attempt; the record turns terminal past the cap
    pub fn record_failure(&self, key: TileKey, error: impl Into<String>) -> FailureRecord {
        let retry_cap = self.retry_cap;
        self.update(key, error.into(), move |record| {
            record.terminal = record.terminal || record.attempts > retry_cap;
        })
    }

    /// Counts one more failed attempt and marks it terminal right away
    pub fn record_terminal(&self, key: TileKey, error: impl Into<String>) -> FailureRecord {
        self.update(key, error.into(), |record| record.terminal = true)
    }

    fn update(
        &self,
        key: TileKey,
        error: String,
        finish: impl FnOnce(&mut FailureRecord),
    ) -> FailureRecord {
        let mut records = self.lock();
        let now = Instant::now();

        if !records.contains(&key) {
            records.put(
                key,
                FailureRecord {
                    key,
                    last_error: String::new(),
                    attempts: 0,
                    last_attempt_at: now,
                    terminal: false,
                },
            );
        }

        let mut detached;
        let record = match records.get_mut(&key) {
            Some(record) => record,
            None => {
                detached = FailureRecord {
                    key,
                    last_error: String::new(),
                    attempts: 0,
                    last_attempt_at: now,
                    terminal: false,
                };
                &mut detached
            }
        };

        record.attempts += 1;
        record.last_error = error;
        record.last_attempt_at = now;
        finish(record);
        record.clone()
    }

    /// False once the key's failures turned terminal; unknown keys may be tried
    pub fn should_retry(&self, key: &TileKey) -> bool {
        self.lock()
            .peek(key)
            .map(|record| !record.terminal)
            .unwrap_or(true)
    }

    pub fn is_terminal(&self, key: &TileKey) -> bool {
        self.lock()
            .peek(key)
            .map(|record| record.terminal)
            .unwrap_or(false)
    }

    pub fn get(&self, key: &TileKey) -> Option<FailureRecord> {
        self.lock().peek(key).cloned()
    }

    /// Forget a key after it loaded successfully
    pub fn clear(&self, key: &TileKey) -> Option<FailureRecord> {
        self.lock().pop(key)
    }

    pub fn clear_all(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys that will not be retried until the ledger is cleared
    pub fn terminal_keys(&self) -> Vec<TileKey> {
        self.lock()
            .iter()
            .filter(|(_, record)| record.terminal)
            .map(|(key, _)| *key)
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<TileKey, FailureRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
