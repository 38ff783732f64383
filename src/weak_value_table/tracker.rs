use crate::finalizer::Finalize;
use crate::reclaim_queue::ReclaimQueue;
use sdd::{AtomicShared, Guard, Shared, Tag};
use std::borrow::Borrow;
use std::collections::HashSet;
use std::hash::Hash;
use std::mem::take;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Callback type invoked when keys were queued for reclamation.
pub(super) type Callback = Box<dyn Fn() + Send + Sync>;

/// Source of table identifiers; an identifier is never reused in the process.
static NEXT_TABLE_ID: AtomicU64 = AtomicU64::new(0);

/// [`Handoff`] is the part of a table that finalization hooks may touch from any thread.
pub(super) struct Handoff<K> {
    /// Identifies the table in finalization registries.
    id: u64,

    /// Keys that may denote dead entries.
    pending: ReclaimQueue<K>,

    /// The unused-data callback; `null` means no-op.
    on_unused_data: AtomicShared<Callback>,
}

/// [`Tracker`] is the finalization hook a table registers with each stored value.
///
/// It holds the deduplicated set of keys of the table that currently store the value. Keys are
/// added and removed by the owner of the table while the finalization may run concurrently in
/// another thread.
pub(super) struct Tracker<K> {
    keys: Mutex<HashSet<K>>,
    handoff: Weak<Handoff<K>>,
}

impl<K> Handoff<K> {
    /// Creates a new [`Handoff`] with a fresh table identifier.
    pub(super) fn new() -> Self {
        Self {
            id: NEXT_TABLE_ID.fetch_add(1, Relaxed),
            pending: ReclaimQueue::default(),
            on_unused_data: AtomicShared::default(),
        }
    }

    /// Returns the table identifier.
    #[inline]
    pub(super) fn id(&self) -> u64 {
        self.id
    }

    /// Returns the reclamation queue.
    #[inline]
    pub(super) fn pending(&self) -> &ReclaimQueue<K> {
        &self.pending
    }

    /// Replaces the unused-data callback.
    pub(super) fn set_on_unused_data(&self, callback: Option<Callback>) {
        let new = callback.map(Shared::new);
        let _prev = self.on_unused_data.swap((new, Tag::None), AcqRel);
    }

    /// Invokes the current unused-data callback.
    fn notify(&self) {
        let guard = Guard::new();
        if let Some(callback) = self.on_unused_data.load(Acquire, &guard).as_ref() {
            callback();
        }
    }
}

impl<K: 'static + Eq + Hash + Send + Sync> Tracker<K> {
    /// Creates a new [`Tracker`] reporting to the supplied [`Handoff`].
    pub(super) fn new(handoff: &Arc<Handoff<K>>) -> Self {
        Self {
            keys: Mutex::new(HashSet::new()),
            handoff: Arc::downgrade(handoff),
        }
    }

    /// Adds a key; it is a no-op if the key is already present.
    pub(super) fn add_key(&self, key: K) {
        self.lock().insert(key);
    }

    /// Removes a key; it is a no-op if the key is absent.
    pub(super) fn remove_key<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.lock().remove(key);
    }

    /// Drops keys for which `valid` returns `false`, and returns `true` if any key other than
    /// `key` remains.
    pub(super) fn retain_and_check_others<F: FnMut(&K) -> bool>(
        &self,
        key: &K,
        mut valid: F,
    ) -> bool {
        let mut keys = self.lock();
        keys.retain(|k| valid(k));
        keys.iter().any(|k| k != key)
    }

    /// Returns `true` if the key is in the set.
    #[cfg(test)]
    pub(super) fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.lock().contains(key)
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<K>> {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K: 'static + Eq + Hash + Send + Sync> Finalize for Tracker<K> {
    fn finalize(&self) {
        let keys = take(&mut *self.lock());
        let Some(handoff) = self.handoff.upgrade() else {
            return;
        };
        if keys.is_empty() {
            return;
        }
        log::trace!(
            "table {}: {} key(s) queued for reclamation",
            handoff.id,
            keys.len()
        );
        for key in keys {
            handoff.pending.push(key);
        }
        handoff.notify();
    }

    fn is_orphaned(&self) -> bool {
        self.handoff.strong_count() == 0
    }
}
