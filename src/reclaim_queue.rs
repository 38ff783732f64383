//! [`ReclaimQueue`] is a lock-free multi-producer queue of keys that may denote dead entries.

use sdd::{AtomicShared, Guard, Shared, Tag};
use std::fmt::{self, Debug};
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed};

/// [`ReclaimQueue`] collects keys from finalization hooks.
///
/// Any number of threads may push keys concurrently; the owner of the table drains every queued
/// key at once in the order they were pushed.
pub(crate) struct ReclaimQueue<K> {
    /// `newest` points to the most recently pushed node.
    newest: AtomicShared<Node<K>>,
}

/// A queued key and the link to the node pushed before it.
struct Node<K> {
    key: K,
    older: AtomicShared<Node<K>>,
}

impl<K: 'static> ReclaimQueue<K> {
    /// Pushes a key.
    pub(crate) fn push(&self, key: K) {
        let guard = Guard::new();
        let new_node = Shared::new(Node {
            key,
            older: AtomicShared::default(),
        });
        let mut newest_ptr = self.newest.load(Acquire, &guard);
        loop {
            new_node
                .older
                .swap((newest_ptr.get_shared(), Tag::None), Relaxed);
            match self.newest.compare_exchange(
                newest_ptr,
                (Some(new_node.clone()), Tag::None),
                AcqRel,
                Acquire,
                &guard,
            ) {
                Ok(_) => return,
                Err((_, actual_ptr)) => newest_ptr = actual_ptr,
            }
        }
    }
}

impl<K: Clone> ReclaimQueue<K> {
    /// Takes every queued key, oldest first.
    pub(crate) fn pop_all(&self) -> Vec<K> {
        let mut current = self.newest.swap((None, Tag::None), AcqRel).0;
        let guard = Guard::new();
        let mut keys = Vec::new();
        while let Some(node) = current {
            keys.push(node.key.clone());
            current = node.older.load(Acquire, &guard).get_shared();
        }
        keys.reverse();
        keys
    }
}

impl<K> ReclaimQueue<K> {
    /// Returns `true` if no keys are queued.
    pub(crate) fn is_empty(&self) -> bool {
        self.newest.is_null(Acquire)
    }
}

impl<K> Debug for ReclaimQueue<K> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReclaimQueue")
            .field("is_empty", &self.is_empty())
            .finish()
    }
}

impl<K> Default for ReclaimQueue<K> {
    #[inline]
    fn default() -> Self {
        Self {
            newest: AtomicShared::default(),
        }
    }
}
