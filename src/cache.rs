//! In-memory response cache with stale-while-revalidate refresh

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::Result;

pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

struct Entry {
    value: Value,
    stored_at: Instant,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    refreshing: HashSet<String>,
}

/// Cached API responses keyed by request. Entries older than the TTL are
/// stale: they are only returned when the caller allows it, typically while a
/// background refresh is running.
#[derive(Clone)]
pub struct ResponseCache {
    inner: Arc<Mutex<Inner>>,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, key: &str, allow_stale: bool) -> Option<Value> {
        let inner = self.inner.lock().ok()?;
        let entry = inner.entries.get(key)?;
        if allow_stale || entry.stored_at.elapsed() < self.ttl {
            Some(entry.value.clone())
        } else {
            None
        }
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.entries.insert(
                key.into(),
                Entry {
                    value,
                    stored_at: Instant::now(),
                },
            );
        }
    }

    pub fn age_seconds(&self, key: &str) -> Option<f64> {
        let inner = self.inner.lock().ok()?;
        inner
            .entries
            .get(key)
            .map(|entry| entry.stored_at.elapsed().as_secs_f64())
    }

    pub fn is_refreshing(&self, key: &str) -> bool {
        self.inner
            .lock()
            .map(|inner| inner.refreshing.contains(key))
            .unwrap_or(false)
    }

    /// Refresh `key` on a background thread. Returns `None` without running
    /// `fetcher` when a refresh for that key is already in flight.
    pub fn schedule_refresh<F>(&self, key: &str, fetcher: F) -> Option<JoinHandle<()>>
    where
        F: FnOnce() -> Result<Value> + Send + 'static,
    {
        {
            let mut inner = self.inner.lock().ok()?;
            if !inner.refreshing.insert(key.to_string()) {
                debug!("Refresh for '{}' already in flight", key);
                return None;
            }
        }

        let guard = RefreshGuard {
            cache: self.clone(),
            key: key.to_string(),
        };
        Some(thread::spawn(move || {
            let guard = guard;
            match fetcher() {
                Ok(value) => {
                    guard.cache.set(guard.key.clone(), value);
                    debug!("Refreshed cache entry '{}'", guard.key);
                }
                Err(e) => warn!("Background refresh for '{}' failed: {}", guard.key, e),
            }
        }))
    }
}

/// Clears the in-flight mark when the refresh thread ends, including by panic.
struct RefreshGuard {
    cache: ResponseCache,
    key: String,
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        let mut inner = match self.cache.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.refreshing.remove(&self.key);
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}
