// Copyright (c) 2024 The pipeline-archive developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use foldhash::HashMap;
use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use std::{borrow::Borrow, hash::Hash};

/// A map of objects unpacked from an archive.
///
/// Readers never block each other. When an entry is vacant, the value is created while holding
/// an upgradable lock, so that concurrent requests for any vacant key wait for it and a value is
/// created at most once per key. Entries are immutable after insertion.
#[derive(Debug)]
pub(crate) struct OnceCache<K, V> {
    inner: RwLock<HashMap<K, V>>,
}

impl<K, V> Default for OnceCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> OnceCache<K, V> {
    /// Creates a new `OnceCache`.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::default()),
        }
    }
}

impl<K, V> OnceCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    /// Returns the value for the specified `key`, if it exists.
    pub(crate) fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.inner.read().get(key).cloned()
    }

    /// Returns the number of entries.
    pub(crate) fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Returns the value for the specified `key`. The entry gets written to with the key-value
    /// pair returned by `f` if it doesn't exist. If `f` returns [`Err`], the error is
    /// propagated and the entry isn't written to.
    pub(crate) fn get_or_try_insert<Q, E>(
        &self,
        key: &Q,
        f: impl FnOnce() -> Result<(K, V), E>,
    ) -> Result<V, E>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }

        let guard = self.inner.upgradable_read();

        // Someone else may have inserted the entry while we were waiting for the lock.
        if let Some(value) = guard.get(key) {
            return Ok(value.clone());
        }

        let (key, value) = f()?;
        RwLockUpgradableReadGuard::upgrade(guard).insert(key, value.clone());

        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Barrier,
        },
        thread,
    };

    #[test]
    fn failed_insert_leaves_entry_vacant() {
        let cache = OnceCache::<Box<str>, u32>::new();

        assert_eq!(cache.get_or_try_insert("a", || Err(())), Err(()));
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get_or_try_insert("a", || Ok::<_, ()>(("a".into(), 1))), Ok(1));
        assert_eq!(cache.get_or_try_insert("a", || Ok::<_, ()>(("a".into(), 2))), Ok(1));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn concurrent_insert_runs_once() {
        let cache = OnceCache::<Box<str>, Arc<u32>>::new();
        let calls = AtomicUsize::new(0);
        let barrier = Barrier::new(8);

        let values: Vec<_> = thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        cache
                            .get_or_try_insert("shared", || {
                                calls.fetch_add(1, Ordering::Relaxed);
                                Ok::<_, ()>(("shared".into(), Arc::new(7)))
                            })
                            .unwrap()
                    })
                })
                .collect();

            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert!(values.iter().all(|v| Arc::ptr_eq(v, &values[0])));
    }
}
