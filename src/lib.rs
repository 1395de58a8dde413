//! SyncMap: a read-mostly concurrent hash map.
//!
//! Reads of a stable key set go through an immutable snapshot published with
//! `ArcSwap` and never take a lock. New keys land in a mutex-guarded dirty map
//! which is promoted to a fresh snapshot once enough lookups miss the snapshot.
//! Each key's value lives in its own atomically swappable slot, so updates and
//! deletes of keys already in the snapshot are lock-free as well.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;

use ahash::RandomState;
use arc_swap::{ArcSwap, Guard};
use log::{debug, trace};
use parking_lot::Mutex;

type EntryMap<K, V, S> = HashMap<K, Arc<Entry<V>>, S>;

/// State of a single key's slot.
enum Slot<V> {
    Value(V),
    /// Deleted, but the key may still be tracked by the dirty map.
    Deleted,
    /// Deleted and absent from the dirty map. Only changes under the map lock.
    Expunged,
}

impl<V> Slot<V> {
    #[inline]
    fn value(&self) -> Option<&V> {
        match self {
            Slot::Value(v) => Some(v),
            Slot::Deleted | Slot::Expunged => None,
        }
    }

    #[inline]
    fn is_expunged(&self) -> bool {
        matches!(self, Slot::Expunged)
    }
}

/// Returned by lock-free entry operations that must fall back to the lock.
struct Expunged;

struct Entry<V> {
    slot: ArcSwap<Slot<V>>,
}

impl<V> Entry<V> {
    fn new(slot: Arc<Slot<V>>) -> Self {
        Self {
            slot: ArcSwap::new(slot),
        }
    }

    fn with_value(value: V) -> Self {
        Self::new(Arc::new(Slot::Value(value)))
    }

    #[inline]
    fn load(&self) -> Option<V>
    where
        V: Clone,
    {
        self.slot.load().value().cloned()
    }

    /// Replaces the slot unless the entry is expunged and returns the previous slot.
    fn try_swap(&self, new: &Arc<Slot<V>>) -> Result<Arc<Slot<V>>, Expunged> {
        let mut cur = self.slot.load();
        loop {
            if cur.is_expunged() {
                return Err(Expunged);
            }
            let prev = self.slot.compare_and_swap(&cur, Arc::clone(new));
            if Arc::ptr_eq(&*prev, &*cur) {
                return Ok(Guard::into_inner(prev));
            }
            cur = prev;
        }
    }

    /// Caller must hold the map lock and the entry must not be expunged.
    fn swap_locked(&self, new: Arc<Slot<V>>) -> Arc<Slot<V>> {
        self.slot.swap(new)
    }

    /// Turns an expunged slot back into a plain tombstone. Returns true if it
    /// was expunged, in which case the caller must re-add the entry to the
    /// dirty map before releasing the lock.
    fn unexpunge_locked(&self) -> bool {
        if !self.slot.load().is_expunged() {
            return false;
        }
        self.slot.store(Arc::new(Slot::Deleted));
        true
    }

    /// Expunges a deleted entry. Returns true if the entry is expunged afterwards.
    fn try_expunge_locked(&self) -> bool {
        let mut cur = self.slot.load();
        while matches!(**cur, Slot::Deleted) {
            let prev = self.slot.compare_and_swap(&cur, Arc::new(Slot::Expunged));
            if Arc::ptr_eq(&*prev, &*cur) {
                return true;
            }
            cur = prev;
        }
        cur.is_expunged()
    }

    /// Loads the current value, or stores a clone of `value` if the slot is
    /// deleted. `Ok(None)` means `value` was stored.
    fn try_load_or_store(&self, value: &V) -> Result<Option<V>, Expunged>
    where
        V: Clone,
    {
        let mut cur = self.slot.load();
        let mut fresh: Option<Arc<Slot<V>>> = None;
        loop {
            match &**cur {
                Slot::Expunged => return Err(Expunged),
                Slot::Value(v) => return Ok(Some(v.clone())),
                Slot::Deleted => {}
            }
            let new = fresh.get_or_insert_with(|| Arc::new(Slot::Value(value.clone())));
            let prev = self.slot.compare_and_swap(&cur, Arc::clone(new));
            if Arc::ptr_eq(&*prev, &*cur) {
                return Ok(None);
            }
            cur = prev;
        }
    }

    /// Tombstones the entry and returns the slot it replaced, if it held a value.
    fn delete(&self) -> Option<Arc<Slot<V>>> {
        let mut cur = self.slot.load();
        let mut tombstone: Option<Arc<Slot<V>>> = None;
        loop {
            if cur.value().is_none() {
                return None;
            }
            let new = tombstone.get_or_insert_with(|| Arc::new(Slot::Deleted));
            let prev = self.slot.compare_and_swap(&cur, Arc::clone(new));
            if Arc::ptr_eq(&*prev, &*cur) {
                return Some(Guard::into_inner(prev));
            }
            cur = prev;
        }
    }
}

impl<V: PartialEq> Entry<V> {
    fn try_compare_and_swap(&self, old: &V, new: V) -> bool {
        let mut cur = self.slot.load();
        if cur.value() != Some(old) {
            return false;
        }
        let new = Arc::new(Slot::Value(new));
        loop {
            let prev = self.slot.compare_and_swap(&cur, Arc::clone(&new));
            if Arc::ptr_eq(&*prev, &*cur) {
                return true;
            }
            cur = prev;
            if cur.value() != Some(old) {
                return false;
            }
        }
    }

    fn compare_and_delete(&self, old: &V) -> bool {
        let mut cur = self.slot.load();
        let mut tombstone: Option<Arc<Slot<V>>> = None;
        loop {
            if cur.value() != Some(old) {
                return false;
            }
            let new = tombstone.get_or_insert_with(|| Arc::new(Slot::Deleted));
            let prev = self.slot.compare_and_swap(&cur, Arc::clone(new));
            if Arc::ptr_eq(&*prev, &*cur) {
                return true;
            }
            cur = prev;
        }
    }
}

/// Published snapshot. Never mutated once stored in `SyncMap::read`.
struct ReadOnly<K, V, S> {
    map: Arc<EntryMap<K, V, S>>,
    /// The dirty map holds keys missing from `map`.
    amended: bool,
}

impl<K, V, S> ReadOnly<K, V, S> {
    fn empty(hasher: S) -> Self {
        Self {
            map: Arc::new(HashMap::with_hasher(hasher)),
            amended: false,
        }
    }
}

struct Dirty<K, V, S> {
    map: Option<EntryMap<K, V, S>>,
    misses: usize,
}

/// A concurrent hash map tuned for read-mostly workloads.
///
/// All methods take `&self`; share the map between threads with a plain
/// reference or an `Arc`. Operations on a single key are linearizable. There
/// is no ordering guarantee across keys.
pub struct SyncMap<K, V, S = RandomState> {
    read: ArcSwap<ReadOnly<K, V, S>>,
    dirty: Mutex<Dirty<K, V, S>>,
    hasher: S,
}

impl<K, V> SyncMap<K, V, RandomState> {
    /// Creates an empty map with the default hasher.
    pub fn new() -> Self {
        Self::with_hasher(RandomState::new())
    }
}

impl<K, V, S: Clone> SyncMap<K, V, S> {
    /// Creates an empty map which hashes keys with `hasher`.
    pub fn with_hasher(hasher: S) -> Self {
        Self {
            read: ArcSwap::from_pointee(ReadOnly::empty(hasher.clone())),
            dirty: Mutex::new(Dirty {
                map: None,
                misses: 0,
            }),
            hasher,
        }
    }
}

impl<K, V, S> SyncMap<K, V, S>
where
    K: Hash + Eq + Clone,
    V: Clone,
    S: BuildHasher + Clone,
{
    /// Returns the value stored for `key`.
    ///
    /// # Arguments
    ///
    /// * `key` - The key to look up.
    ///
    /// # Returns
    ///
    /// * `Option<V>` - A clone of the value, or `None` if the key is absent or deleted.
    pub fn load<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.with_entry(key, Entry::load).flatten()
    }

    /// Sets the value for `key`.
    pub fn store(&self, key: K, value: V) {
        self.swap_slot(key, value);
    }

    /// Returns the existing value for `key` if present, otherwise stores `value`.
    ///
    /// # Returns
    ///
    /// * `(V, bool)` - The value now associated with the key, and `true` if it
    ///   was already present (loaded) or `false` if `value` was stored.
    pub fn load_or_store(&self, key: K, value: V) -> (V, bool) {
        {
            let read = self.read.load();
            if let Some(e) = read.map.get(&key) {
                if let Ok(existing) = e.try_load_or_store(&value) {
                    return Self::loaded_or(existing, value);
                }
            }
        }

        let mut dirty = self.dirty.lock();
        let read = self.read.load();
        let existing = if let Some(e) = read.map.get(&key) {
            if e.unexpunge_locked() {
                self.dirty_locked(&mut dirty).insert(key, Arc::clone(e));
            }
            e.try_load_or_store(&value).ok().flatten()
        } else {
            let found = dirty.map.as_ref().and_then(|m| m.get(&key)).cloned();
            match found {
                Some(e) => {
                    let existing = e.try_load_or_store(&value).ok().flatten();
                    self.miss_locked(&mut dirty);
                    existing
                }
                None => {
                    let entry = Arc::new(Entry::with_value(value.clone()));
                    self.insert_new_locked(&mut dirty, &read, key, entry);
                    None
                }
            }
        };
        Self::loaded_or(existing, value)
    }

    /// Deletes `key`, returning its previous value if it was present.
    ///
    /// The entry is tombstoned in place; a key held only by the dirty map
    /// stays there until a promotion followed by a dirty map rebuild drops it.
    pub fn load_and_delete<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.with_entry(key, Entry::delete)
            .flatten()
            .and_then(|prev| prev.value().cloned())
    }

    /// Deletes `key`. Does nothing if the key is absent.
    pub fn delete<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.load_and_delete(key);
    }

    /// Stores `value` for `key` and returns the previous value, if any.
    pub fn swap(&self, key: K, value: V) -> Option<V> {
        self.swap_slot(key, value)
            .and_then(|prev| prev.value().cloned())
    }

    /// Calls `f` for each key and value present in the map, stopping as soon
    /// as `f` returns `false`.
    ///
    /// No key is visited more than once, but the traversal is not a
    /// consistent snapshot: a key stored or deleted concurrently may or may
    /// not be observed. The map's lock is not held while `f` runs, so `f`
    /// may call any method on this map.
    pub fn range<F>(&self, mut f: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        let read = self.promoted_snapshot();
        for (k, e) in read.map.iter() {
            let slot = e.slot.load_full();
            if let Some(v) = slot.value() {
                if !f(k, v) {
                    break;
                }
            }
        }
    }

    /// Returns a lazy iterator over the key-value pairs in the map.
    ///
    /// The set of keys is captured when the iterator is created; each value
    /// is read when the iterator reaches its key, and keys deleted in the
    /// meantime are skipped.
    pub fn iter(&self) -> Iter<K, V> {
        let read = self.promoted_snapshot();
        let entries: Vec<_> = read
            .map
            .iter()
            .map(|(k, e)| (k.clone(), Arc::clone(e)))
            .collect();
        Iter {
            entries: entries.into_iter(),
        }
    }

    /// Counts the live keys. O(n), and only exact when no writers are active.
    pub fn len(&self) -> usize {
        let mut n = 0;
        self.range(|_, _| {
            n += 1;
            true
        });
        n
    }

    /// Returns `true` if no live key is visible. Stops at the first live key.
    pub fn is_empty(&self) -> bool {
        let mut empty = true;
        self.range(|_, _| {
            empty = false;
            false
        });
        empty
    }

    /// Removes every entry.
    pub fn clear(&self) {
        let mut dirty = self.dirty.lock();
        let read = self.read.load();
        if !read.map.is_empty() || read.amended {
            trace!("clearing map ({} snapshot entries)", read.map.len());
            self.read
                .store(Arc::new(ReadOnly::empty(self.hasher.clone())));
        }
        dirty.map = None;
        dirty.misses = 0;
    }

    /// Runs `f` on the entry for `key`. Takes the lock only when the key is
    /// missing from the snapshot and the snapshot is amended; `f` itself
    /// always runs without the lock.
    #[inline]
    fn with_entry<Q, R, F>(&self, key: &Q, f: F) -> Option<R>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce(&Entry<V>) -> R,
    {
        {
            let read = self.read.load();
            if let Some(e) = read.map.get(key) {
                return Some(f(&**e));
            }
            if !read.amended {
                return None;
            }
        }

        let entry = {
            let mut dirty = self.dirty.lock();
            let read = self.read.load();
            match read.map.get(key) {
                Some(e) => Some(Arc::clone(e)),
                None if read.amended => {
                    let e = dirty.map.as_ref().and_then(|m| m.get(key)).cloned();
                    self.miss_locked(&mut dirty);
                    e
                }
                None => None,
            }
        };
        entry.map(|e| f(&*e))
    }

    /// Swaps in `value` and returns the slot it replaced, which may be a
    /// tombstone. `None` if the key had no entry at all.
    fn swap_slot(&self, key: K, value: V) -> Option<Arc<Slot<V>>> {
        let new = Arc::new(Slot::Value(value));
        {
            let read = self.read.load();
            if let Some(e) = read.map.get(&key) {
                if let Ok(prev) = e.try_swap(&new) {
                    return Some(prev);
                }
            }
        }

        let mut dirty = self.dirty.lock();
        let read = self.read.load();
        if let Some(e) = read.map.get(&key) {
            if e.unexpunge_locked() {
                self.dirty_locked(&mut dirty).insert(key, Arc::clone(e));
            }
            Some(e.swap_locked(new))
        } else {
            let found = dirty.map.as_ref().and_then(|m| m.get(&key)).cloned();
            match found {
                Some(e) => Some(e.swap_locked(new)),
                None => {
                    self.insert_new_locked(&mut dirty, &read, key, Arc::new(Entry::new(new)));
                    None
                }
            }
        }
    }

    /// Adds a key the snapshot has never seen, marking the snapshot amended.
    fn insert_new_locked(
        &self,
        dirty: &mut Dirty<K, V, S>,
        read: &ReadOnly<K, V, S>,
        key: K,
        entry: Arc<Entry<V>>,
    ) {
        let map = self.dirty_locked(dirty);
        if !read.amended {
            self.read.store(Arc::new(ReadOnly {
                map: Arc::clone(&read.map),
                amended: true,
            }));
        }
        map.insert(key, entry);
    }

    /// Returns the dirty map, rebuilding it from the snapshot if a promotion
    /// consumed it. Deleted entries are expunged instead of copied.
    fn dirty_locked<'a>(&self, dirty: &'a mut Dirty<K, V, S>) -> &'a mut EntryMap<K, V, S> {
        dirty.map.get_or_insert_with(|| {
            let read = self.read.load();
            let mut map = HashMap::with_capacity_and_hasher(read.map.len(), self.hasher.clone());
            for (k, e) in read.map.iter() {
                if !e.try_expunge_locked() {
                    map.insert(k.clone(), Arc::clone(e));
                }
            }
            trace!(
                "rebuilt dirty map: {} of {} snapshot entries kept",
                map.len(),
                read.map.len()
            );
            map
        })
    }

    fn miss_locked(&self, dirty: &mut Dirty<K, V, S>) {
        dirty.misses += 1;
        let len = dirty.map.as_ref().map_or(0, HashMap::len);
        if dirty.misses < len {
            return;
        }
        self.promote_locked(dirty, "misses");
    }

    /// Publishes the dirty map as the new snapshot.
    fn promote_locked(&self, dirty: &mut Dirty<K, V, S>, cause: &str) {
        if let Some(map) = dirty.map.take() {
            debug!(
                "promoting dirty map ({} entries, {} misses, cause: {})",
                map.len(),
                dirty.misses,
                cause
            );
            self.read.store(Arc::new(ReadOnly {
                map: Arc::new(map),
                amended: false,
            }));
        }
        dirty.misses = 0;
    }

    /// Returns a snapshot that covers every key, promoting the dirty map first
    /// if needed. Traversals call this before running any caller code.
    fn promoted_snapshot(&self) -> Arc<ReadOnly<K, V, S>> {
        let read = self.read.load_full();
        if !read.amended {
            return read;
        }
        let mut dirty = self.dirty.lock();
        let read = self.read.load_full();
        if !read.amended {
            return read;
        }
        self.promote_locked(&mut dirty, "range");
        self.read.load_full()
    }

    #[inline]
    fn loaded_or(existing: Option<V>, value: V) -> (V, bool) {
        match existing {
            Some(v) => (v, true),
            None => (value, false),
        }
    }
}

impl<K, V, S> SyncMap<K, V, S>
where
    K: Hash + Eq + Clone,
    V: Clone + PartialEq,
    S: BuildHasher + Clone,
{
    /// Replaces the value for `key` with `new` if the stored value equals `old`.
    ///
    /// # Returns
    ///
    /// * `bool` - `true` if the swap happened. A missing or deleted key never matches.
    pub fn compare_and_swap<Q>(&self, key: &Q, old: &V, new: V) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.with_entry(key, |e| e.try_compare_and_swap(old, new))
            .unwrap_or(false)
    }

    /// Deletes `key` if its stored value equals `old`.
    ///
    /// Returns `false` if the key is absent, even for a default `old`.
    pub fn compare_and_delete<Q>(&self, key: &Q, old: &V) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.with_entry(key, |e| e.compare_and_delete(old))
            .unwrap_or(false)
    }
}

impl<K, V, S: Clone + Default> Default for SyncMap<K, V, S> {
    fn default() -> Self {
        Self::with_hasher(S::default())
    }
}

impl<K, V, S> fmt::Debug for SyncMap<K, V, S>
where
    K: Hash + Eq + Clone + fmt::Debug,
    V: Clone + fmt::Debug,
    S: BuildHasher + Clone,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K, V, S> FromIterator<(K, V)> for SyncMap<K, V, S>
where
    K: Hash + Eq + Clone,
    V: Clone,
    S: BuildHasher + Clone + Default,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = Self::default();
        map.extend(iter);
        map
    }
}

impl<K, V, S> Extend<(K, V)> for SyncMap<K, V, S>
where
    K: Hash + Eq + Clone,
    V: Clone,
    S: BuildHasher + Clone,
{
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (k, v) in iter {
            self.store(k, v);
        }
    }
}

/// Iterator returned by [`SyncMap::iter`].
pub struct Iter<K, V> {
    entries: std::vec::IntoIter<(K, Arc<Entry<V>>)>,
}

impl<K, V: Clone> Iterator for Iter<K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (k, e) = self.entries.next()?;
            if let Some(v) = e.load() {
                return Some((k, v));
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.entries.len()))
    }
}
