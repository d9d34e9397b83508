//! Immutable store generations behind an atomically swapped pointer.
//!
//! Readers take a snapshot (`Arc`) of the active generation and keep using it
//! for as long as they like; a refresh builds the next generation off to the
//! side and only then swaps the pointer. A reader therefore sees either the
//! complete old generation or the complete new one, never a partial build.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard};

/// One complete, immutable build of a store's content.
#[derive(Debug)]
pub struct Generation<T> {
    /// Monotonically increasing per cell, starting at 1.
    pub id: u64,
    pub built_at: DateTime<Utc>,
    /// Fingerprint of the source files this generation was built from.
    pub fingerprint: String,
    pub content: T,
}

/// Holds the active [`Generation`] of a refreshable store.
#[derive(Debug)]
pub struct GenerationCell<T> {
    active: RwLock<Arc<Generation<T>>>,
    last_id: AtomicU64,
    refresh: Mutex<()>,
}

impl<T> GenerationCell<T> {
    /// Create a cell whose first generation holds `content`.
    pub fn new(content: T, fingerprint: impl Into<String>) -> Self {
        let first = Generation {
            id: 1,
            built_at: Utc::now(),
            fingerprint: fingerprint.into(),
            content,
        };
        Self {
            active: RwLock::new(Arc::new(first)),
            last_id: AtomicU64::new(1),
            refresh: Mutex::new(()),
        }
    }

    /// The generation active right now.
    pub fn snapshot(&self) -> Arc<Generation<T>> {
        self.active.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Id of the active generation.
    pub fn current_id(&self) -> u64 {
        self.snapshot().id
    }

    /// Install a fully built `content` as the next generation.
    ///
    /// Returns the generation that was replaced; it is released once the
    /// last reader holding a snapshot of it drops that snapshot.
    pub fn swap(&self, content: T, fingerprint: impl Into<String>) -> Arc<Generation<T>> {
        let id = self.last_id.fetch_add(1, Ordering::SeqCst) + 1;
        let next = Arc::new(Generation {
            id,
            built_at: Utc::now(),
            fingerprint: fingerprint.into(),
            content,
        });
        let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *active, next)
    }

    /// Claim the right to refresh this cell.
    ///
    /// Returns `None` while another refresh holds the claim, so overlapping
    /// triggers collapse into the one already running.
    pub fn try_begin_refresh(&self) -> Option<MutexGuard<'_, ()>> {
        self.refresh.try_lock().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swap_replaces_whole_generation() {
        let cell = GenerationCell::new(vec![1, 2, 3], "fp-1");
        let before = cell.snapshot();

        let previous = cell.swap(vec![4, 5, 6, 7], "fp-2");
        assert_eq!(previous.id, 1);

        let after = cell.snapshot();
        assert_eq!(after.id, 2);
        assert_eq!(after.content, [4, 5, 6, 7]);
        assert_eq!(after.fingerprint, "fp-2");
        // an existing snapshot is unaffected
        assert_eq!(before.content, [1, 2, 3]);
    }

    #[tokio::test]
    async fn overlapping_refresh_is_suppressed() {
        let cell = GenerationCell::new((), "");
        let guard = cell.try_begin_refresh();
        assert!(guard.is_some());
        assert!(cell.try_begin_refresh().is_none());
        drop(guard);
        assert!(cell.try_begin_refresh().is_some());
    }
}
