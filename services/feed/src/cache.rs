//! In-memory snapshot cache.
//!
//! The current [`Snapshot`] sits behind an `Arc`. Readers clone the `Arc`
//! under a read lock and are done; the refresh task builds the next snapshot
//! elsewhere and swaps the pointer under a write lock. Neither side holds the
//! lock for anything longer than a pointer copy.

use crate::snapshot::{RefreshError, Snapshot};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Bookkeeping about refresh attempts
#[derive(Debug, Default)]
struct RefreshState {
    last_refresh: Option<DateTime<Utc>>,
    last_error: Option<String>,
    last_error_at: Option<DateTime<Utc>>,
    consecutive_failures: u32,
}

/// Published snapshot and the refresh state that goes with it.
/// Kept under one lock so status never pairs a snapshot with stale bookkeeping.
#[derive(Debug)]
struct Inner {
    snapshot: Arc<Snapshot>,
    state: RefreshState,
}

/// Diagnostic view of the cache
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    /// Time of the last successful refresh
    pub last_refresh: Option<DateTime<Utc>>,
    /// Error of the most recent refresh, cleared by the next success
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    /// Items in the snapshot being served
    pub item_count: usize,
    pub generation: u64,
    /// When the served snapshot finished building
    pub built_at: Option<DateTime<Utc>>,
    pub refreshing: bool,
}

/// Holds the snapshot served to readers
pub struct SnapshotCache {
    inner: RwLock<Inner>,
    refreshing: AtomicBool,
}

impl SnapshotCache {
    /// Create a cache serving an empty snapshot
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                snapshot: Arc::new(Snapshot::empty()),
                state: RefreshState::default(),
            }),
            refreshing: AtomicBool::new(false),
        }
    }

    /// The snapshot currently published
    pub fn read(&self) -> Arc<Snapshot> {
        self.inner.read().snapshot.clone()
    }

    /// Publish a fully built snapshot. Returns its generation.
    pub fn replace(&self, mut snapshot: Snapshot) -> u64 {
        let (generation, previous) = {
            let mut inner = self.inner.write();
            let generation = inner.snapshot.generation() + 1;
            snapshot.set_generation(generation);

            inner.state.last_refresh = Some(Utc::now());
            inner.state.last_error = None;
            inner.state.last_error_at = None;
            inner.state.consecutive_failures = 0;

            (generation, std::mem::replace(&mut inner.snapshot, Arc::new(snapshot)))
        };

        // The old snapshot is released outside the lock
        drop(previous);
        generation
    }

    /// Record a failed refresh. The published snapshot is left alone.
    /// Returns the number of consecutive failures so far.
    pub fn record_failure(&self, error: &RefreshError) -> u32 {
        let mut inner = self.inner.write();
        inner.state.last_error = Some(error.to_string());
        inner.state.last_error_at = Some(Utc::now());
        inner.state.consecutive_failures = inner.state.consecutive_failures.saturating_add(1);
        inner.state.consecutive_failures
    }

    pub fn status(&self) -> CacheStatus {
        let inner = self.inner.read();

        CacheStatus {
            last_refresh: inner.state.last_refresh,
            last_error: inner.state.last_error.clone(),
            last_error_at: inner.state.last_error_at,
            consecutive_failures: inner.state.consecutive_failures,
            item_count: inner.snapshot.len(),
            generation: inner.snapshot.generation(),
            built_at: inner.snapshot.built_at(),
            refreshing: self.is_refreshing(),
        }
    }

    /// Mark a refresh as running. `None` if another one already is.
    pub fn try_begin_refresh(&self) -> Option<RefreshGuard<'_>> {
        self.refreshing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RefreshGuard { cache: self })
    }

    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::SeqCst)
    }
}

impl Default for SnapshotCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Clears the in-progress flag when dropped
pub struct RefreshGuard<'a> {
    cache: &'a SnapshotCache,
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.cache.refreshing.store(false, Ordering::SeqCst);
    }
}
