//! [`WeakValueTable`] is a hash table whose values are held weakly.

mod tracker;

use super::finalizer;
use super::options::{Options, ValueSharing};
use super::tracked::{Tracked, WeakTracked};
use super::Error;
use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::collections::{HashMap, HashSet};
use std::fmt::{self, Debug};
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;
use tracker::{Handoff, Tracker};

/// [`WeakValueTable`] maps keys to weakly held [`Tracked`] values.
///
/// A key whose value lost its last strong [`Tracked`] outside the table is no longer a member of
/// the table, yet it keeps using space until the owner calls
/// [`reclaim_space_for_keys_with_unused_data`](Self::reclaim_space_for_keys_with_unused_data).
/// The table learns about dead values through finalization hooks that run asynchronously and
/// possibly in another thread: every hook queues the keys that stored the value and invokes the
/// callback set by [`set_on_unused_data`](Self::set_on_unused_data).
///
/// The null sentinel, [`Tracked::null`], is held in a side table and never dies.
///
/// ## Notes
///
/// Mutation and query methods must be serialized by the owner; only the hand-off from
/// finalization hooks to the owner is safe for concurrent use. The table never reclaims space on
/// its own.
///
/// ## Examples
///
/// ```
/// use ephemera::{Tracked, WeakValueTable};
///
/// let mut table: WeakValueTable<u64, String> = WeakValueTable::default();
///
/// let value = Tracked::new(String::from("v"));
/// assert!(table.add(1, value.clone()).is_ok());
/// assert!(table.mem(&1));
///
/// drop(value);
/// assert!(!table.mem(&1));
/// assert!(table.key_is_using_space(&1));
/// ```
pub struct WeakValueTable<K, V, H = RandomState>
where
    H: BuildHasher,
{
    /// Keys storing non-null values.
    live_entries: HashMap<K, WeakTracked<V>, H>,

    /// Keys storing the null sentinel.
    null_value_keys: HashSet<K, H>,

    /// State shared with finalization hooks.
    handoff: Arc<Handoff<K>>,

    value_sharing: ValueSharing,
}

impl<K, V, H> WeakValueTable<K, V, H>
where
    K: 'static + Clone + Eq + Hash + Send + Sync,
    H: BuildHasher,
{
    /// Creates an empty [`WeakValueTable`] with the given [`BuildHasher`].
    ///
    /// # Examples
    ///
    /// ```
    /// use ephemera::WeakValueTable;
    /// use std::collections::hash_map::RandomState;
    ///
    /// let table: WeakValueTable<u64, u32, RandomState> =
    ///     WeakValueTable::with_hasher(RandomState::new());
    /// assert!(table.is_empty());
    /// ```
    #[inline]
    pub fn with_hasher(build_hasher: H) -> Self
    where
        H: Clone,
    {
        Self::with_options_and_hasher(Options::default(), build_hasher)
    }

    /// Creates an empty [`WeakValueTable`] with the specified capacity and [`BuildHasher`].
    ///
    /// # Examples
    ///
    /// ```
    /// use ephemera::WeakValueTable;
    /// use std::collections::hash_map::RandomState;
    ///
    /// let table: WeakValueTable<u64, u32, RandomState> =
    ///     WeakValueTable::with_capacity_and_hasher(1000, RandomState::new());
    /// assert!(table.capacity() >= 1000);
    /// ```
    #[inline]
    pub fn with_capacity_and_hasher(capacity: usize, build_hasher: H) -> Self
    where
        H: Clone,
    {
        Self::with_options_and_hasher(
            Options {
                capacity,
                ..Options::default()
            },
            build_hasher,
        )
    }

    /// Creates an empty [`WeakValueTable`] with the given [`Options`] and [`BuildHasher`].
    #[inline]
    pub fn with_options_and_hasher(options: Options, build_hasher: H) -> Self
    where
        H: Clone,
    {
        Self {
            live_entries: HashMap::with_capacity_and_hasher(
                options.capacity,
                build_hasher.clone(),
            ),
            null_value_keys: HashSet::with_hasher(build_hasher),
            handoff: Arc::new(Handoff::new()),
            value_sharing: options.value_sharing,
        }
    }

    /// Sets the callback invoked whenever keys were queued for reclamation.
    ///
    /// The callback replaces the previous one. It runs in whichever thread executes the
    /// finalization of a dead value, possibly concurrently with itself and with the owner of the
    /// table, and at most once per dead value no matter how many keys stored the value.
    ///
    /// # Examples
    ///
    /// ```
    /// use ephemera::WeakValueTable;
    /// use std::sync::atomic::AtomicBool;
    /// use std::sync::atomic::Ordering::Relaxed;
    /// use std::sync::Arc;
    ///
    /// let table: WeakValueTable<u64, u32> = WeakValueTable::default();
    /// let unused_data = Arc::new(AtomicBool::new(false));
    /// let unused_data_clone = unused_data.clone();
    /// table.set_on_unused_data(move || unused_data_clone.store(true, Relaxed));
    /// ```
    #[inline]
    pub fn set_on_unused_data<F: Fn() + Send + Sync + 'static>(&self, callback: F) {
        self.handoff.set_on_unused_data(Some(Box::new(callback)));
    }

    /// Resets the unused-data callback to a no-op.
    #[inline]
    pub fn clear_on_unused_data(&self) {
        self.handoff.set_on_unused_data(None);
    }

    /// Returns `true` if the key stores the null sentinel or a value that is still alive.
    ///
    /// # Examples
    ///
    /// ```
    /// use ephemera::{Tracked, WeakValueTable};
    ///
    /// let mut table: WeakValueTable<u64, u32> = WeakValueTable::default();
    ///
    /// assert!(!table.mem(&1));
    /// assert!(table.replace(1, Tracked::null()).is_ok());
    /// assert!(table.mem(&1));
    /// ```
    #[inline]
    pub fn mem<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.null_value_keys.contains(key)
            || self
                .live_entries
                .get(key)
                .is_some_and(WeakTracked::is_alive)
    }

    /// Returns `true` if the key occupies a slot, regardless of whether its value is alive.
    ///
    /// # Examples
    ///
    /// ```
    /// use ephemera::{Tracked, WeakValueTable};
    ///
    /// let mut table: WeakValueTable<u64, u32> = WeakValueTable::default();
    ///
    /// assert!(table.replace(1, Tracked::new(7)).is_ok());
    /// assert!(!table.mem(&1));
    /// assert!(table.key_is_using_space(&1));
    /// ```
    #[inline]
    pub fn key_is_using_space<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.null_value_keys.contains(key) || self.live_entries.contains_key(key)
    }

    /// Returns the value of the key if it is the null sentinel or still alive.
    ///
    /// # Examples
    ///
    /// ```
    /// use ephemera::{Tracked, WeakValueTable};
    ///
    /// let mut table: WeakValueTable<u64, u32> = WeakValueTable::default();
    /// let value = Tracked::new(7);
    ///
    /// assert!(table.find(&1).is_none());
    /// assert!(table.replace(1, value.clone()).is_ok());
    /// assert!(table.find(&1).is_some_and(|v| v.ptr_eq(&value)));
    /// assert!(table.replace(2, Tracked::null()).is_ok());
    /// assert!(table.find(&2).is_some_and(|v| v.is_null()));
    /// ```
    #[inline]
    pub fn find<Q>(&self, key: &Q) -> Option<Tracked<V>>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        if self.null_value_keys.contains(key) {
            return Some(Tracked::null());
        }
        self.live_entries.get(key).and_then(WeakTracked::upgrade)
    }

    /// Returns the live value of the key, or stores and returns the value made by `constructor`.
    ///
    /// `constructor` is not invoked if the key denotes a live value, and is invoked exactly once
    /// otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ValueAlreadyTracked`] if the table is
    /// [`Exclusive`](ValueSharing::Exclusive) and the new value is already stored under another
    /// key; the table is left unmodified.
    ///
    /// # Examples
    ///
    /// ```
    /// use ephemera::{Tracked, WeakValueTable};
    ///
    /// let mut table: WeakValueTable<u64, u32> = WeakValueTable::default();
    ///
    /// let first = table.find_or_add(1, || Tracked::new(3)).unwrap();
    /// let second = table.find_or_add(1, || unreachable!()).unwrap();
    /// assert!(first.ptr_eq(&second));
    /// ```
    #[inline]
    pub fn find_or_add<F: FnOnce() -> Tracked<V>>(
        &mut self,
        key: K,
        constructor: F,
    ) -> Result<Tracked<V>, Error<K>> {
        if let Some(value) = self.find(&key) {
            return Ok(value);
        }
        let value = constructor();
        self.replace(key, value.clone())?;
        Ok(value)
    }

    /// Stores the value under the key, replacing any previous value.
    ///
    /// Replacing a value with itself does not touch its finalization hook.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ValueAlreadyTracked`] if the table is
    /// [`Exclusive`](ValueSharing::Exclusive) and the value is already stored under another
    /// key; the table is left unmodified.
    ///
    /// # Examples
    ///
    /// ```
    /// use ephemera::{Tracked, WeakValueTable};
    ///
    /// let mut table: WeakValueTable<u64, u32> = WeakValueTable::default();
    /// let first = Tracked::new(1);
    /// let second = Tracked::new(2);
    ///
    /// assert!(table.replace(1, first).is_ok());
    /// assert!(table.replace(1, second.clone()).is_ok());
    /// assert_eq!(table.find(&1).unwrap().get(), Some(&2));
    /// ```
    pub fn replace(&mut self, key: K, value: Tracked<V>) -> Result<(), Error<K>> {
        if value.is_null() {
            if let Some(weak) = self.live_entries.remove(&key) {
                self.detach(&key, &weak);
            }
            self.null_value_keys.insert(key);
            return Ok(());
        }

        let same_value = self
            .live_entries
            .get(&key)
            .is_some_and(|weak| weak.ptr_eq(&value));
        if !same_value {
            // Every fallible step happens before the table is modified.
            if !self.attach(&key, &value) {
                log::debug!(
                    "table {}: value already tracked under another key",
                    self.handoff.id()
                );
                return Err(Error::ValueAlreadyTracked(key));
            }
            if let Some(previous) = self.live_entries.get(&key) {
                self.detach(&key, previous);
            }
        }

        self.null_value_keys.remove(&key);
        self.live_entries.insert(key, value.downgrade());
        Ok(())
    }

    /// Stores the value under the key unless the key denotes a live value.
    ///
    /// A key whose value died but was not reclaimed yet is considered vacant.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyAlreadyInUse`] if the key stores the null sentinel or a live value,
    /// and [`Error::ValueAlreadyTracked`] under the same condition as [`Self::replace`]; the
    /// table is left unmodified.
    ///
    /// # Examples
    ///
    /// ```
    /// use ephemera::{Error, Tracked, WeakValueTable};
    ///
    /// let mut table: WeakValueTable<u64, u32> = WeakValueTable::default();
    /// let first = Tracked::new(1);
    ///
    /// assert!(table.add(1, first.clone()).is_ok());
    /// assert_eq!(table.add(1, Tracked::new(2)), Err(Error::KeyAlreadyInUse(1)));
    /// assert!(table.find(&1).is_some_and(|v| v.ptr_eq(&first)));
    /// ```
    #[inline]
    pub fn add(&mut self, key: K, value: Tracked<V>) -> Result<(), Error<K>> {
        if self.mem(&key) {
            return Err(Error::KeyAlreadyInUse(key));
        }
        self.replace(key, value)
    }

    /// Removes the key.
    ///
    /// It is a no-op if the key is absent.
    ///
    /// # Examples
    ///
    /// ```
    /// use ephemera::{Tracked, WeakValueTable};
    ///
    /// let mut table: WeakValueTable<u64, u32> = WeakValueTable::default();
    ///
    /// assert!(table.replace(1, Tracked::null()).is_ok());
    /// table.remove(&1);
    /// assert!(!table.key_is_using_space(&1));
    /// table.remove(&1);
    /// ```
    #[inline]
    pub fn remove<Q>(&mut self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        if self.null_value_keys.remove(key) {
            return;
        }
        if let Some(weak) = self.live_entries.remove(key) {
            self.detach(key, &weak);
        }
    }

    /// Removes every key.
    ///
    /// Finalization hooks are left untouched: keys they still hold are ignored by later
    /// reclamation.
    ///
    /// # Examples
    ///
    /// ```
    /// use ephemera::{Tracked, WeakValueTable};
    ///
    /// let mut table: WeakValueTable<u64, u32> = WeakValueTable::default();
    /// let value = Tracked::new(7);
    ///
    /// assert!(table.replace(1, value.clone()).is_ok());
    /// assert!(table.replace(2, Tracked::null()).is_ok());
    /// table.clear();
    /// assert!(!table.key_is_using_space(&1) && !table.key_is_using_space(&2));
    /// ```
    #[inline]
    pub fn clear(&mut self) {
        self.live_entries.clear();
        self.null_value_keys.clear();
    }

    /// Removes the keys queued by finalization hooks if their values are still dead.
    ///
    /// Returns the number of removed keys. A queued key that was replaced with a live value,
    /// removed, or cleared in the meantime is left alone.
    ///
    /// # Examples
    ///
    /// ```
    /// use ephemera::WeakValueTable;
    ///
    /// let mut table: WeakValueTable<u64, u32> = WeakValueTable::default();
    /// assert_eq!(table.reclaim_space_for_keys_with_unused_data(), 0);
    /// ```
    pub fn reclaim_space_for_keys_with_unused_data(&mut self) -> usize {
        finalizer::run_stranded();
        let mut reclaimed = 0;
        for key in self.handoff.pending().pop_all() {
            if self
                .live_entries
                .get(&key)
                .is_some_and(|weak| !weak.is_alive())
            {
                self.live_entries.remove(&key);
                reclaimed += 1;
            }
        }
        if reclaimed != 0 {
            log::trace!(
                "table {}: reclaimed {} key(s)",
                self.handoff.id(),
                reclaimed
            );
        }
        reclaimed
    }

    /// Returns `true` if finalization hooks queued keys that were not reclaimed yet.
    ///
    /// Hooks of values released by a thread that was destroying its thread-local storage are
    /// run first, here or in
    /// [`reclaim_space_for_keys_with_unused_data`](Self::reclaim_space_for_keys_with_unused_data).
    ///
    /// # Examples
    ///
    /// ```
    /// use ephemera::WeakValueTable;
    ///
    /// let table: WeakValueTable<u64, u32> = WeakValueTable::default();
    /// assert!(!table.has_keys_with_unused_data());
    /// ```
    #[inline]
    pub fn has_keys_with_unused_data(&self) -> bool {
        finalizer::run_stranded();
        !self.handoff.pending().is_empty()
    }

    /// Attaches the key to the finalization hook of the value.
    ///
    /// Returns `false` if the table is exclusive and the value is stored under another key.
    fn attach(&self, key: &K, value: &Tracked<V>) -> bool {
        let Some(registry) = value.registry() else {
            return true;
        };
        let tracker = registry.find_or_register(self.handoff.id(), || Tracker::new(&self.handoff));
        if self.value_sharing == ValueSharing::Exclusive {
            let live_entries = &self.live_entries;
            let conflict = tracker.retain_and_check_others(key, |k| {
                live_entries
                    .get(k)
                    .is_some_and(|weak| weak.ptr_eq(value))
            });
            if conflict {
                return false;
            }
        }
        tracker.add_key(key.clone());
        true
    }

    /// Detaches the key from the finalization hook of the value it stores.
    fn detach<Q>(&self, key: &Q, weak: &WeakTracked<V>)
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        // A dead value needs no detaching: its hook already ran, or is about to run and its keys
        // are validated at reclamation.
        let Some(value) = weak.upgrade() else {
            return;
        };
        if let Some(tracker) = value
            .registry()
            .and_then(|registry| registry.find::<Tracker<K>>(self.handoff.id()))
        {
            tracker.remove_key(key);
        }
    }
}

impl<K, V, H> WeakValueTable<K, V, H>
where
    H: BuildHasher,
{
    /// Returns the number of keys using space.
    ///
    /// Keys whose values died but were not reclaimed yet are included.
    ///
    /// # Examples
    ///
    /// ```
    /// use ephemera::{Tracked, WeakValueTable};
    ///
    /// let mut table: WeakValueTable<u64, u32> = WeakValueTable::default();
    ///
    /// assert!(table.replace(1, Tracked::null()).is_ok());
    /// assert!(table.replace(2, Tracked::new(2)).is_ok());
    /// assert_eq!(table.len(), 2);
    /// ```
    #[inline]
    pub fn len(&self) -> usize {
        self.live_entries.len() + self.null_value_keys.len()
    }

    /// Returns `true` if no key is using space.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live_entries.is_empty() && self.null_value_keys.is_empty()
    }

    /// Returns the number of non-null entries the table can hold without reallocating.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.live_entries.capacity()
    }

    /// Returns the [`ValueSharing`] policy of the table.
    #[inline]
    pub fn value_sharing(&self) -> ValueSharing {
        self.value_sharing
    }
}

impl<K, V> WeakValueTable<K, V, RandomState>
where
    K: 'static + Clone + Eq + Hash + Send + Sync,
{
    /// Creates an empty [`WeakValueTable`].
    ///
    /// # Examples
    ///
    /// ```
    /// use ephemera::WeakValueTable;
    ///
    /// let table: WeakValueTable<u64, u32> = WeakValueTable::new();
    /// assert!(table.is_empty());
    /// ```
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty [`WeakValueTable`] with room for at least `capacity` keys.
    ///
    /// # Examples
    ///
    /// ```
    /// use ephemera::WeakValueTable;
    ///
    /// let table: WeakValueTable<u64, u32> = WeakValueTable::with_capacity(1000);
    /// assert!(table.capacity() >= 1000);
    /// ```
    #[inline]
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, RandomState::new())
    }

    /// Creates an empty [`WeakValueTable`] configured by [`Options`].
    #[inline]
    #[must_use]
    pub fn with_options(options: Options) -> Self {
        Self::with_options_and_hasher(options, RandomState::new())
    }
}

impl<K, V, H> Debug for WeakValueTable<K, V, H>
where
    H: BuildHasher,
{
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakValueTable")
            .field("live_entries", &self.live_entries.len())
            .field("null_value_keys", &self.null_value_keys.len())
            .field("pending_reclaim", &!self.handoff.pending().is_empty())
            .field("value_sharing", &self.value_sharing)
            .finish()
    }
}

impl<K, V> Default for WeakValueTable<K, V, RandomState>
where
    K: 'static + Clone + Eq + Hash + Send + Sync,
{
    /// Creates an empty default [`WeakValueTable`].
    #[inline]
    fn default() -> Self {
        Self::with_hasher(RandomState::new())
    }
}
