//! [`Tracked`] is a nullable reference-counted handle that reports its last release.

use super::finalizer::Registry;
use std::fmt::{self, Debug};
use std::sync::{Arc, Weak};

/// [`Tracked`] is a nullable, reference-counted handle to a `V`.
///
/// Values stored in a [`WeakValueTable`](crate::WeakValueTable) are [`Tracked`]: the table only
/// keeps a [`WeakTracked`], and every table that stored the value registers a finalization hook
/// in the value's allocation. When the last strong [`Tracked`] is dropped, the value is dropped
/// immediately, weak handles stop resolving, and the hooks are handed over to the epoch-based
/// collector of [`sdd`] which runs them at a later point of time, possibly in another thread.
/// The hooks are executed once the releasing thread enters the collector again, or after the
/// thread exits. If the last release happens while the thread is destroying its thread-local
/// storage, the collector is already gone: the hooks are then executed by the next finalization
/// in any thread, or when the owner of a table polls it for unused data.
///
/// [`Tracked::null`] is the null sentinel: it can be stored in a table like any other value, and
/// it never dies.
pub struct Tracked<V> {
    slot: Option<Arc<Slot<V>>>,
}

/// [`WeakTracked`] observes a [`Tracked`] without keeping it alive.
pub struct WeakTracked<V> {
    slot: Weak<Slot<V>>,
}

/// The shared allocation behind non-null [`Tracked`] handles.
struct Slot<V> {
    value: V,
    registry: Registry,
}

impl<V> Tracked<V> {
    /// Creates a new [`Tracked`] holding the supplied value.
    ///
    /// # Examples
    ///
    /// ```
    /// use ephemera::Tracked;
    ///
    /// let tracked = Tracked::new(17);
    /// assert_eq!(tracked.get(), Some(&17));
    /// ```
    #[inline]
    pub fn new(value: V) -> Self {
        Self {
            slot: Some(Arc::new(Slot {
                value,
                registry: Registry::default(),
            })),
        }
    }

    /// Returns the null sentinel.
    ///
    /// # Examples
    ///
    /// ```
    /// use ephemera::Tracked;
    ///
    /// let null: Tracked<usize> = Tracked::null();
    /// assert!(null.is_null());
    /// assert!(null.get().is_none());
    /// ```
    #[inline]
    #[must_use]
    pub const fn null() -> Self {
        Self { slot: None }
    }

    /// Returns `true` if `self` is the null sentinel.
    #[inline]
    pub fn is_null(&self) -> bool {
        self.slot.is_none()
    }

    /// Returns a reference to the value, or `None` for the null sentinel.
    #[inline]
    pub fn get(&self) -> Option<&V> {
        self.slot.as_ref().map(|slot| &slot.value)
    }

    /// Returns `true` if both handles refer to the same value.
    ///
    /// Two null sentinels are identical.
    ///
    /// # Examples
    ///
    /// ```
    /// use ephemera::Tracked;
    ///
    /// let tracked = Tracked::new(String::from("v"));
    /// let other = Tracked::new(String::from("v"));
    ///
    /// assert!(tracked.ptr_eq(&tracked.clone()));
    /// assert!(!tracked.ptr_eq(&other));
    /// assert!(Tracked::<String>::null().ptr_eq(&Tracked::null()));
    /// ```
    #[inline]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (&self.slot, &other.slot) {
            (Some(slot), Some(other_slot)) => Arc::ptr_eq(slot, other_slot),
            (None, None) => true,
            _ => false,
        }
    }

    /// Creates a [`WeakTracked`] observing `self`.
    ///
    /// The weak handle of the null sentinel is never alive.
    ///
    /// # Examples
    ///
    /// ```
    /// use ephemera::Tracked;
    ///
    /// let tracked = Tracked::new(3);
    /// let weak = tracked.downgrade();
    /// assert!(weak.is_alive());
    ///
    /// drop(tracked);
    /// assert!(!weak.is_alive());
    /// assert!(weak.upgrade().is_none());
    /// ```
    #[inline]
    pub fn downgrade(&self) -> WeakTracked<V> {
        WeakTracked {
            slot: self.slot.as_ref().map_or_else(Weak::new, Arc::downgrade),
        }
    }

    /// Returns the number of strong handles to the value, `0` for the null sentinel.
    #[inline]
    pub fn strong_count(&self) -> usize {
        self.slot.as_ref().map_or(0, Arc::strong_count)
    }

    /// Returns the finalization registry of the value.
    #[inline]
    pub(crate) fn registry(&self) -> Option<&Registry> {
        self.slot.as_ref().map(|slot| &slot.registry)
    }
}

impl<V> Clone for Tracked<V> {
    #[inline]
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<V: Debug> Debug for Tracked<V> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(value) => f.debug_tuple("Tracked").field(value).finish(),
            None => f.write_str("Tracked(null)"),
        }
    }
}

impl<V> Default for Tracked<V> {
    #[inline]
    fn default() -> Self {
        Self::null()
    }
}

impl<V> From<V> for Tracked<V> {
    #[inline]
    fn from(value: V) -> Self {
        Self::new(value)
    }
}

impl<V> WeakTracked<V> {
    /// Returns `true` if the observed value still has a strong holder.
    #[inline]
    pub fn is_alive(&self) -> bool {
        self.slot.strong_count() != 0
    }

    /// Returns a strong handle to the observed value if it is still alive.
    #[inline]
    pub fn upgrade(&self) -> Option<Tracked<V>> {
        self.slot.upgrade().map(|slot| Tracked { slot: Some(slot) })
    }

    /// Returns `true` if `self` observes the value `tracked` refers to.
    ///
    /// The comparison stays valid after the value died; it is always `false` for the null
    /// sentinel.
    #[inline]
    pub fn ptr_eq(&self, tracked: &Tracked<V>) -> bool {
        tracked
            .slot
            .as_ref()
            .is_some_and(|slot| std::ptr::eq(self.slot.as_ptr(), Arc::as_ptr(slot)))
    }
}

impl<V> Clone for WeakTracked<V> {
    #[inline]
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<V> Debug for WeakTracked<V> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakTracked")
            .field("alive", &self.is_alive())
            .finish()
    }
}
