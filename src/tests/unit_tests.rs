mod weak_value_table {
    use crate::{Error, Options, Tracked, ValueSharing, WeakValueTable};
    use sdd::Guard;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering::Relaxed;
    use std::sync::Arc;
    use std::thread;

    static_assertions::assert_impl_all!(WeakValueTable<String, String>: Send, Sync);
    static_assertions::assert_not_impl_any!(WeakValueTable<String, Rc<String>>: Send, Sync);
    static_assertions::assert_impl_all!(Tracked<String>: Clone, Send, Sync);
    static_assertions::assert_not_impl_any!(Tracked<Rc<String>>: Send, Sync);
    static_assertions::assert_impl_all!(Error<String>: std::error::Error, Send, Sync);

    /// Spins the epoch-based collector until the condition holds.
    fn collect_until<F: Fn() -> bool>(condition: F) {
        while !condition() {
            Guard::new().accelerate();
            thread::yield_now();
        }
    }

    /// Gives the collector a chance to run anything still deferred.
    fn settle() {
        for _ in 0..64 {
            Guard::new().accelerate();
            thread::yield_now();
        }
    }

    fn count_unused_data<V>(table: &WeakValueTable<u64, V>) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        table.set_on_unused_data(move || {
            count_clone.fetch_add(1, Relaxed);
        });
        count
    }

    #[test]
    fn space_and_membership() {
        let mut table: WeakValueTable<u64, String> = WeakValueTable::default();
        let value = Tracked::new(String::from("value"));
        for key in 0..8 {
            assert!(!table.key_is_using_space(&key));
            assert!(!table.mem(&key));
        }

        assert!(table.add(1, value.clone()).is_ok());
        assert!(table.add(2, Tracked::new(String::from("dead"))).is_ok());
        assert!(table.replace(3, Tracked::null()).is_ok());
        for key in 0..8 {
            if !table.key_is_using_space(&key) {
                assert!(!table.mem(&key));
            }
        }
        assert!(table.mem(&1));
        assert!(!table.mem(&2));
        assert!(table.key_is_using_space(&2));
        assert!(table.mem(&3));
        assert_eq!(table.len(), 3);
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn null_round_trip() {
        let mut table: WeakValueTable<u64, String> = WeakValueTable::default();
        assert!(table.replace(0, Tracked::null()).is_ok());
        for _ in 0..4 {
            assert!(table.find(&0).is_some_and(|v| v.is_null()));
            assert!(table.mem(&0));
            assert!(table.key_is_using_space(&0));
            settle();
            assert_eq!(table.reclaim_space_for_keys_with_unused_data(), 0);
        }
        assert_eq!(table.add(0, Tracked::null()), Err(Error::KeyAlreadyInUse(0)));
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn liveness_then_death() {
        let mut table: WeakValueTable<u64, String> = WeakValueTable::default();
        let count = count_unused_data(&table);
        let value = Tracked::new(String::from("value"));

        assert!(table.add(1, value.clone()).is_ok());
        assert!(table.mem(&1));
        assert_eq!(table.find(&1).unwrap().get().unwrap(), "value");

        drop(value);
        assert!(!table.mem(&1));
        assert!(table.find(&1).is_none());
        assert!(table.key_is_using_space(&1));

        collect_until(|| count.load(Relaxed) == 1);
        assert!(table.has_keys_with_unused_data());
        assert!(table.key_is_using_space(&1));
        assert_eq!(table.reclaim_space_for_keys_with_unused_data(), 1);
        assert!(!table.key_is_using_space(&1));
        assert!(!table.has_keys_with_unused_data());
        assert!(table.is_empty());
    }

    #[test]
    fn duplicate_add() {
        let mut table: WeakValueTable<u64, u64> = WeakValueTable::default();
        let first = Tracked::new(1);
        let second = Tracked::new(2);

        assert!(table.add(7, first.clone()).is_ok());
        let error = table.add(7, second.clone()).unwrap_err();
        assert_eq!(error, Error::KeyAlreadyInUse(7));
        assert_eq!(error.to_string(), "key already in use: 7");
        assert!(table.find(&7).is_some_and(|v| v.ptr_eq(&first)));
        assert_eq!(table.len(), 1);
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn add_over_dead_entry() {
        let mut table: WeakValueTable<u64, u64> = WeakValueTable::default();
        let count = count_unused_data(&table);
        assert!(table.add(1, Tracked::new(1)).is_ok());
        assert!(!table.mem(&1));

        let second = Tracked::new(2);
        assert!(table.add(1, second.clone()).is_ok());
        assert!(table.find(&1).is_some_and(|v| v.ptr_eq(&second)));

        // The hint for the first value must not remove the live entry.
        collect_until(|| count.load(Relaxed) == 1);
        assert_eq!(table.reclaim_space_for_keys_with_unused_data(), 0);
        assert!(table.find(&1).is_some_and(|v| v.ptr_eq(&second)));
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn shared_value_partial_reclamation() {
        let mut table: WeakValueTable<u64, u64> = WeakValueTable::default();
        let count = count_unused_data(&table);
        let shared = Tracked::new(1);
        let other = Tracked::new(2);

        assert!(table.add(1, shared.clone()).is_ok());
        assert!(table.add(2, shared.clone()).is_ok());
        assert!(table.replace(1, other.clone()).is_ok());

        drop(shared);
        collect_until(|| count.load(Relaxed) == 1);
        assert_eq!(table.reclaim_space_for_keys_with_unused_data(), 1);
        assert!(!table.key_is_using_space(&2));
        assert!(table.find(&1).is_some_and(|v| v.ptr_eq(&other)));
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn deduplicated_callback() {
        let mut table: WeakValueTable<u64, u64> = WeakValueTable::default();
        let count = count_unused_data(&table);
        let shared = Tracked::new(3);
        for key in 0..3 {
            assert!(table.add(key, shared.clone()).is_ok());
        }
        assert!(table.replace(0, shared.clone()).is_ok());

        drop(shared);
        collect_until(|| count.load(Relaxed) >= 1);
        settle();
        assert_eq!(count.load(Relaxed), 1);
        assert_eq!(table.reclaim_space_for_keys_with_unused_data(), 3);
        assert!(table.is_empty());
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn clear_is_immediate() {
        let mut table: WeakValueTable<u64, u64> = WeakValueTable::default();
        let count = count_unused_data(&table);
        let value = Tracked::new(1);
        assert!(table.add(1, value.clone()).is_ok());
        assert!(table.add(2, Tracked::new(2)).is_ok());
        assert!(table.add(3, Tracked::null()).is_ok());

        table.clear();
        for key in 1..=3 {
            assert!(!table.mem(&key));
            assert!(!table.key_is_using_space(&key));
        }

        // Orphaned hooks still fire, and their keys are ignored.
        assert!(table.add(1, Tracked::null()).is_ok());
        drop(value);
        collect_until(|| count.load(Relaxed) == 2);
        assert_eq!(table.reclaim_space_for_keys_with_unused_data(), 0);
        assert!(table.find(&1).is_some_and(|v| v.is_null()));
    }

    #[test]
    fn exclusive_rejects_shared_value() {
        let mut table: WeakValueTable<u64, u64> = WeakValueTable::with_options(Options {
            value_sharing: ValueSharing::Exclusive,
            ..Options::default()
        });
        let value = Tracked::new(1);
        assert!(table.add(1, value.clone()).is_ok());

        assert_eq!(
            table.add(2, value.clone()),
            Err(Error::ValueAlreadyTracked(2))
        );
        assert!(!table.key_is_using_space(&2));
        assert_eq!(
            table.find_or_add(2, || value.clone()).err(),
            Some(Error::ValueAlreadyTracked(2))
        );
        assert!(!table.key_is_using_space(&2));
        assert!(table.find(&1).is_some_and(|v| v.ptr_eq(&value)));

        // A failed replacement keeps the previous value.
        let other = Tracked::new(2);
        assert!(table.add(2, other.clone()).is_ok());
        assert!(table.replace(2, value.clone()).is_err());
        assert!(table.find(&2).is_some_and(|v| v.ptr_eq(&other)));

        // Storing the value under its own key again is fine.
        assert!(table.replace(1, value.clone()).is_ok());

        // Once the first key lets go of the value, another key may take it.
        table.remove(&1);
        assert!(table.replace(2, value.clone()).is_ok());
        assert!(table.replace(3, Tracked::null()).is_ok());

        // Keys orphaned by `clear` are not conflicts.
        table.clear();
        assert!(table.add(4, value.clone()).is_ok());
        assert!(table.find(&4).is_some_and(|v| v.ptr_eq(&value)));
    }

    #[test]
    fn find_or_add() {
        let mut table: WeakValueTable<u64, u64> = WeakValueTable::default();
        let mut calls = 0;
        let value = table
            .find_or_add(1, || {
                calls += 1;
                Tracked::new(11)
            })
            .unwrap();
        assert_eq!(calls, 1);
        let found = table
            .find_or_add(1, || {
                calls += 1;
                Tracked::new(12)
            })
            .unwrap();
        assert_eq!(calls, 1);
        assert!(found.ptr_eq(&value));

        assert!(table.replace(2, Tracked::null()).is_ok());
        assert!(table
            .find_or_add(2, || unreachable!())
            .is_ok_and(|v| v.is_null()));

        // A dead value is replaced.
        drop((value, found));
        let revived = table.find_or_add(1, || Tracked::new(13)).unwrap();
        assert_eq!(revived.get(), Some(&13));
        assert!(table.mem(&1));
    }

    #[test]
    fn replace_transitions() {
        let mut table: WeakValueTable<String, u64> = WeakValueTable::default();
        let value = Tracked::new(5);
        let key = String::from("k");

        assert!(table.replace(key.clone(), Tracked::null()).is_ok());
        assert!(table.replace(key.clone(), value.clone()).is_ok());
        assert!(table.find("k").is_some_and(|v| v.ptr_eq(&value)));
        assert_eq!(table.len(), 1);

        assert!(table.replace(key.clone(), Tracked::null()).is_ok());
        assert!(table.find("k").is_some_and(|v| v.is_null()));
        assert_eq!(table.len(), 1);

        table.remove("k");
        assert!(!table.key_is_using_space("k"));
        table.remove("k");
        table.remove("absent");
        assert!(table.is_empty());
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn removed_key_not_reported() {
        let mut table: WeakValueTable<u64, u64> = WeakValueTable::default();
        let count = count_unused_data(&table);
        let value = Tracked::new(1);
        let marker = Tracked::new(2);
        assert!(table.add(1, value.clone()).is_ok());
        assert!(table.add(2, value.clone()).is_ok());
        assert!(table.add(3, marker.clone()).is_ok());
        table.remove(&1);
        table.remove(&2);

        // The tracker of `value` has no keys left, therefore only `marker` notifies.
        drop(value);
        drop(marker);
        collect_until(|| count.load(Relaxed) >= 1);
        settle();
        assert_eq!(count.load(Relaxed), 1);
        assert_eq!(table.reclaim_space_for_keys_with_unused_data(), 1);
        assert!(table.is_empty());
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn callback_replacement() {
        let mut table: WeakValueTable<u64, u64> = WeakValueTable::default();
        let first = count_unused_data(&table);
        let second = count_unused_data(&table);

        assert!(table.add(1, Tracked::new(1)).is_ok());
        collect_until(|| second.load(Relaxed) == 1);
        assert_eq!(first.load(Relaxed), 0);
        assert_eq!(table.reclaim_space_for_keys_with_unused_data(), 1);

        // Keys are still queued without a callback.
        table.clear_on_unused_data();
        assert!(table.add(2, Tracked::new(2)).is_ok());
        collect_until(|| table.has_keys_with_unused_data());
        assert_eq!(second.load(Relaxed), 1);
        assert_eq!(table.reclaim_space_for_keys_with_unused_data(), 1);
        assert!(table.is_empty());
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn table_dropped_first() {
        let mut table: WeakValueTable<u64, u64> = WeakValueTable::default();
        let count = count_unused_data(&table);
        let value = Tracked::new(1);
        assert!(table.add(1, value.clone()).is_ok());
        drop(table);

        let mut other: WeakValueTable<u64, u64> = WeakValueTable::default();
        let other_count = count_unused_data(&other);
        assert!(other.add(1, value.clone()).is_ok());

        drop(value);
        collect_until(|| other_count.load(Relaxed) == 1);
        settle();
        assert_eq!(count.load(Relaxed), 0);
        assert_eq!(other.reclaim_space_for_keys_with_unused_data(), 1);
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn released_in_thread_local_destructor() {
        thread_local! {
            static HELD: RefCell<Option<Tracked<u64>>> = const { RefCell::new(None) };
        }

        let mut table: WeakValueTable<u64, u64> = WeakValueTable::default();
        let count = count_unused_data(&table);
        let value = Tracked::new(1);
        assert!(table.add(1, value.clone()).is_ok());

        // The collector of the thread is set up after `HELD`, and torn down before it.
        let thread = thread::spawn(move || {
            HELD.with(|held| *held.borrow_mut() = Some(value));
            Guard::new().accelerate();
        });
        assert!(thread.join().is_ok());
        assert!(!table.mem(&1));

        collect_until(|| table.has_keys_with_unused_data());
        collect_until(|| count.load(Relaxed) == 1);
        assert_eq!(table.reclaim_space_for_keys_with_unused_data(), 1);
        assert!(!table.key_is_using_space(&1));
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn panicking_callback() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut table: WeakValueTable<u64, u64> = WeakValueTable::default();
        table.set_on_unused_data(|| panic!("unused data"));
        assert!(table.add(1, Tracked::new(1)).is_ok());
        collect_until(|| table.has_keys_with_unused_data());
        assert_eq!(table.reclaim_space_for_keys_with_unused_data(), 1);
    }

    #[test]
    fn capacity_and_debug() {
        let mut table: WeakValueTable<u64, u64> = WeakValueTable::with_capacity(128);
        assert!(table.capacity() >= 128);
        assert_eq!(table.value_sharing(), ValueSharing::Shared);
        assert!(table.replace(1, Tracked::null()).is_ok());
        let debug = format!("{table:?}");
        assert!(debug.contains("null_value_keys: 1"));
        assert_eq!(format!("{:?}", Tracked::new(4)), "Tracked(4)");
        assert_eq!(format!("{:?}", Tracked::<u64>::null()), "Tracked(null)");
    }
}

mod any_table {
    use crate::{AnyTable, TableVisitor, Tracked, WeakValueTable};
    use std::hash::{BuildHasher, Hash};

    struct Len;

    impl TableVisitor for Len {
        type Output = usize;

        fn visit<K, V, H>(self, table: &mut WeakValueTable<K, V, H>) -> usize
        where
            K: 'static + Clone + Eq + Hash + Send + Sync,
            H: BuildHasher,
        {
            table.len()
        }
    }

    struct Clear;

    impl TableVisitor for Clear {
        type Output = ();

        fn visit<K, V, H>(self, table: &mut WeakValueTable<K, V, H>)
        where
            K: 'static + Clone + Eq + Hash + Send + Sync,
            H: BuildHasher,
        {
            table.clear();
        }
    }

    #[test]
    fn heterogeneous() {
        let mut numbers: WeakValueTable<u64, u64> = WeakValueTable::default();
        let mut names: WeakValueTable<String, String> = WeakValueTable::default();
        assert!(numbers.replace(1, Tracked::null()).is_ok());
        assert!(names.replace(String::from("a"), Tracked::null()).is_ok());
        assert!(names.replace(String::from("b"), Tracked::null()).is_ok());

        let mut tables: Vec<AnyTable<Len>> = vec![AnyTable::new(numbers), names.into()];
        let lens: Vec<usize> = tables.iter_mut().map(|t| t.visit(Len)).collect();
        assert_eq!(lens, vec![1, 2]);
    }

    #[test]
    fn borrowed_values() {
        let local = String::from("local");
        let mut table: WeakValueTable<u64, &String> = WeakValueTable::default();
        let value = Tracked::new(&local);
        assert!(table.replace(1, value.clone()).is_ok());

        let mut any: AnyTable<Clear> = AnyTable::new(table);
        any.visit(Clear);
        assert!(format!("{any:?}").starts_with("AnyTable"));
    }
}

mod tracked {
    use crate::Tracked;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering::Relaxed;
    use std::thread;

    struct R(&'static AtomicUsize);
    impl Drop for R {
        fn drop(&mut self) {
            self.0.fetch_add(1, Relaxed);
        }
    }

    #[test]
    fn drop_on_last_release() {
        static DROPPED: AtomicUsize = AtomicUsize::new(0);
        let tracked = Tracked::new(R(&DROPPED));
        let clone = tracked.clone();
        let weak = tracked.downgrade();
        assert_eq!(tracked.strong_count(), 2);

        drop(tracked);
        assert_eq!(DROPPED.load(Relaxed), 0);
        assert!(weak.upgrade().is_some());

        let handle = thread::spawn(move || drop(clone));
        assert!(handle.join().is_ok());
        assert_eq!(DROPPED.load(Relaxed), 1);
        assert!(!weak.is_alive());
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn null_sentinel() {
        let null: Tracked<u64> = Tracked::default();
        assert!(null.is_null());
        assert_eq!(null.strong_count(), 0);
        assert!(!null.downgrade().is_alive());
        assert!(!null.downgrade().ptr_eq(&null));

        let value = Tracked::from(1_u64);
        assert!(!value.ptr_eq(&null));
        assert!(value.downgrade().ptr_eq(&value));
    }
}
