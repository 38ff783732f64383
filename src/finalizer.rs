//! Finalization hooks run after the last strong [`Tracked`](crate::Tracked) is dropped.

use sdd::Guard;
use std::any::Any;
use std::mem::take;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A type that is notified once the value it is registered with becomes unreachable.
///
/// [`Finalize::finalize`] is invoked at most once, from an unspecified thread, strictly after the
/// value was dropped.
pub(crate) trait Finalize: Any + Send + Sync {
    /// Handles the death of the value.
    fn finalize(&self);

    /// Returns `true` if the party that registered the hook is gone, so that finalizing would be
    /// a no-op.
    fn is_orphaned(&self) -> bool {
        false
    }
}

/// [`Registry`] holds the finalization hooks of a single value.
///
/// The registry is embedded in the value's allocation, so hooks are owned by the value and never
/// keep it alive. A registry holds at most one hook per owner.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    hooks: Mutex<Vec<Hook>>,
}

/// A registered finalization hook.
#[derive(Debug)]
struct Hook {
    /// Identifies the party that registered the hook.
    owner: u64,

    /// The hook instance; the concrete type is only known to the owner.
    target: Arc<dyn Any + Send + Sync>,

    /// Invokes [`Finalize::finalize`] on `target`.
    fire: fn(&(dyn Any + Send + Sync)),

    /// Invokes [`Finalize::is_orphaned`] on `target`.
    orphaned: fn(&(dyn Any + Send + Sync)) -> bool,
}

impl Registry {
    /// Returns the hook registered by `owner`.
    pub(crate) fn find<T: Finalize>(&self, owner: u64) -> Option<Arc<T>> {
        self.lock_pruned()
            .iter()
            .find(|hook| hook.owner == owner)
            .and_then(|hook| hook.target.clone().downcast::<T>().ok())
    }

    /// Returns the hook registered by `owner`, registering the one made by `constructor` if
    /// there is none.
    pub(crate) fn find_or_register<T: Finalize, F: FnOnce() -> T>(
        &self,
        owner: u64,
        constructor: F,
    ) -> Arc<T> {
        let mut hooks = self.lock_pruned();
        if let Some(hook) = hooks.iter().find(|hook| hook.owner == owner) {
            if let Ok(target) = hook.target.clone().downcast::<T>() {
                return target;
            }
        }

        let target = Arc::new(constructor());
        hooks.retain(|hook| hook.owner != owner);
        hooks.push(Hook {
            owner,
            target: target.clone(),
            fire: fire::<T>,
            orphaned: orphaned::<T>,
        });
        target
    }

    /// Returns `true` if no hooks are registered.
    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of registered hooks.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock_pruned().len()
    }

    /// Locks the hooks after dropping those whose owner is gone.
    fn lock_pruned(&self) -> MutexGuard<'_, Vec<Hook>> {
        let mut hooks = self.hooks.lock().unwrap_or_else(PoisonError::into_inner);
        hooks.retain(|hook| !(hook.orphaned)(&*hook.target));
        hooks
    }
}

impl Drop for Registry {
    #[inline]
    fn drop(&mut self) {
        let hooks = take(
            self.hooks
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner),
        );
        if hooks.is_empty() {
            return;
        }

        // The collector of a thread is unavailable while its thread-local storage is being
        // destroyed; the hooks then wait for a thread that has a collector.
        match catch_unwind(Guard::new) {
            Ok(guard) => guard.defer_execute(move || {
                run(hooks);
                run_stranded();
            }),
            Err(_) => STRANDED
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend(hooks),
        }
    }
}

/// Hooks released by threads that were tearing down their collector.
static STRANDED: Mutex<Vec<Hook>> = Mutex::new(Vec::new());

/// Runs the hooks that were released without a collector.
///
/// They are picked up by the next deferred finalization, or by the owner of a table polling for
/// unused data.
pub(crate) fn run_stranded() {
    let hooks = take(&mut *STRANDED.lock().unwrap_or_else(PoisonError::into_inner));
    if !hooks.is_empty() {
        log::debug!("running {} stranded finalization hook(s)", hooks.len());
        run(hooks);
    }
}

/// Runs the hooks, containing panics.
fn run(hooks: Vec<Hook>) {
    for hook in hooks {
        if catch_unwind(AssertUnwindSafe(|| (hook.fire)(&*hook.target))).is_err() {
            log::warn!("finalization hook of owner {} panicked", hook.owner);
        }
    }
}

/// Invokes [`Finalize::finalize`] on a type-erased hook.
fn fire<T: Finalize>(target: &(dyn Any + Send + Sync)) {
    if let Some(target) = target.downcast_ref::<T>() {
        target.finalize();
    }
}

/// Invokes [`Finalize::is_orphaned`] on a type-erased hook.
fn orphaned<T: Finalize>(target: &(dyn Any + Send + Sync)) -> bool {
    target.downcast_ref::<T>().is_some_and(T::is_orphaned)
}
