//! Keyed store of compiled, file-backed resources
//!
//! Entries live in a vector kept sorted by key so lookups are a binary
//! search under a shared lock. Slots with an empty key are free and are
//! reused by the next insert. A periodic [`ResourceCache::sync`] sweep
//! compares each entry's recorded modification time against its backing
//! file, recompiling changed entries and evicting deleted ones.
//!
//! The cache owns the lifecycle of what it stores: every object that leaves
//! the cache, whether evicted, overwritten or superseded by a recompile, has
//! its [`Resource::close`] called exactly once.
//!
//! Entries stored with [`ResourceCache::pin`] have no backing file and are
//! skipped by the sweep; they leave only through explicit removal.

use crate::error::{CloseError, CompileError};
use parking_lot::RwLock;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tracing::{debug, error, info, warn};

/// A compiled object the cache can store
pub trait Resource: Send + Sync + 'static {
    /// Opaque value handed back to the compiler on recompile
    type Meta: Clone + Send + Sync;

    /// Name match used by [`ResourceCache::grep`]
    fn matches(&self, name: &str) -> bool;

    /// Release step run when the object leaves the cache
    fn close(&self) -> Result<(), CloseError>;

    /// Modification time of the backing file at compile, in epoch seconds
    fn mod_time(&self) -> i64;

    fn meta(&self) -> Self::Meta;
}

/// External compile capability for one resource kind
pub trait Compile<T: Resource>: Send + Sync {
    fn compile(&self, key: &str, meta: &T::Meta) -> Result<T, CompileError>;
}

/// Modification time of `path` in whole seconds since the epoch
pub fn file_mod_time<P: AsRef<Path>>(path: P) -> io::Result<i64> {
    let modified = std::fs::metadata(path)?.modified()?;
    Ok(match modified.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    })
}

/// Outcome counters of one sync sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub recompiled: usize,
    pub evicted: usize,
    pub failed: usize,
    pub unchanged: usize,
}

impl SyncReport {
    pub fn changed(&self) -> bool {
        self.recompiled != 0 || self.evicted != 0
    }
}

struct Slot<T> {
    key: String,
    value: Option<Arc<T>>,
    file_backed: bool,
}

impl<T> Slot<T> {
    fn is_free(&self) -> bool {
        self.key.is_empty()
    }

    fn clear(&mut self) -> Option<Arc<T>> {
        self.key.clear();
        self.value.take()
    }
}

fn close_resource<T: Resource>(key: &str, value: &T) {
    match value.close() {
        Ok(()) => debug!(key = %key, "Resource closed"),
        Err(e) => error!(key = %key, error = %e, "Resource close failed"),
    }
}

/// Sorted, lock-guarded store of compiled resources
pub struct ResourceCache<T: Resource> {
    name: &'static str,
    slots: RwLock<Vec<Slot<T>>>,
}

impl<T: Resource> ResourceCache<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slots: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        self.name
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.slots.read().iter().filter(|s| !s.is_free()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn position(slots: &[Slot<T>], key: &str) -> Option<usize> {
        if key.is_empty() {
            return None;
        }
        slots
            .binary_search_by(|slot| slot.key.as_str().cmp(key))
            .ok()
    }

    fn sort(slots: &mut [Slot<T>]) {
        slots.sort_by(|a, b| a.key.cmp(&b.key));
    }

    /// Exact-key lookup
    pub fn lookup(&self, key: &str) -> Option<Arc<T>> {
        let slots = self.slots.read();
        let idx = Self::position(&slots, key)?;
        slots[idx].value.clone()
    }

    /// Linear search for the first entry whose resource matches `name`
    pub fn grep(&self, name: &str) -> Option<Arc<T>> {
        self.slots
            .read()
            .iter()
            .filter(|s| !s.is_free())
            .find_map(|s| s.value.as_ref().filter(|v| v.matches(name)).cloned())
    }

    /// Entry at a position of the sorted sequence
    pub fn get_idx(&self, idx: usize) -> Option<(String, Arc<T>)> {
        let slots = self.slots.read();
        let Some(slot) = slots.get(idx) else {
            error!(cache = self.name, idx, len = slots.len(), "Invalid cache index");
            return None;
        };
        let value = slot.value.clone()?;
        Some((slot.key.clone(), value))
    }

    /// Keys of all live entries, in sorted order
    pub fn keys(&self) -> Vec<String> {
        self.slots
            .read()
            .iter()
            .filter(|s| !s.is_free())
            .map(|s| s.key.clone())
            .collect()
    }

    /// Store `value` under `key`, replacing any entry whose key matches
    /// ignoring ASCII case
    ///
    /// `key` is the path of the backing file the sweep revalidates.
    pub fn insert(&self, key: &str, value: Arc<T>) {
        self.store(key, value, true);
    }

    /// Store `value` under `key` with no backing file
    pub fn pin(&self, key: &str, value: Arc<T>) {
        self.store(key, value, false);
    }

    fn store(&self, key: &str, value: Arc<T>, file_backed: bool) {
        if key.is_empty() {
            warn!(cache = self.name, "Refusing to insert an empty key");
            return;
        }
        let mut slots = self.slots.write();
        self.insert_locked(&mut slots, key, value, file_backed);
    }

    fn insert_locked(&self, slots: &mut Vec<Slot<T>>, key: &str, value: Arc<T>, file_backed: bool) {
        if let Some(slot) = slots
            .iter_mut()
            .find(|s| !s.is_free() && s.key.eq_ignore_ascii_case(key))
        {
            slot.file_backed = file_backed;
            if let Some(old) = slot.value.replace(value) {
                let same = slot.value.as_ref().is_some_and(|v| Arc::ptr_eq(v, &old));
                if !same {
                    close_resource(&slot.key, old.as_ref());
                }
            }
            info!(cache = self.name, key = %slot.key, "Resource replaced");
            return;
        }

        match slots.iter_mut().find(|s| s.is_free()) {
            Some(slot) => {
                slot.key = key.to_string();
                slot.value = Some(value);
                slot.file_backed = file_backed;
            }
            None => slots.push(Slot {
                key: key.to_string(),
                value: Some(value),
                file_backed,
            }),
        }
        Self::sort(slots);
        info!(cache = self.name, key = %key, "Resource inserted");
    }

    /// Look up `key`, compiling and caching it on a miss
    ///
    /// Compilation runs without holding the lock. If another caller cached
    /// the key meanwhile, its object wins and the fresh one is closed.
    pub fn require<C>(&self, key: &str, meta: &T::Meta, compiler: &C) -> Result<Arc<T>, CompileError>
    where
        C: Compile<T> + ?Sized,
    {
        if let Some(hit) = self.lookup(key) {
            return Ok(hit);
        }

        debug!(cache = self.name, key = %key, "Cache miss, compiling");
        let fresh = Arc::new(compiler.compile(key, meta)?);

        let mut slots = self.slots.write();
        let existing = Self::position(&slots, key).and_then(|idx| slots[idx].value.clone());
        if let Some(existing) = existing {
            drop(slots);
            close_resource(key, fresh.as_ref());
            return Ok(existing);
        }
        self.insert_locked(&mut slots, key, fresh.clone(), true);
        Ok(fresh)
    }

    /// Clear `key` into a reusable free slot, closing its resource
    pub fn remove(&self, key: &str) -> bool {
        let mut slots = self.slots.write();
        let Some(idx) = Self::position(&slots, key) else {
            return false;
        };
        if let Some(old) = slots[idx].clear() {
            close_resource(key, old.as_ref());
        }
        Self::sort(&mut slots);
        info!(cache = self.name, key = %key, "Resource removed");
        true
    }

    /// Close and drop every entry whose key starts with `prefix`
    pub fn evict_prefix(&self, prefix: &str) -> usize {
        let mut slots = self.slots.write();
        let mut evicted = 0;
        for slot in slots.iter_mut().filter(|s| !s.is_free()) {
            if !slot.key.starts_with(prefix) {
                continue;
            }
            let key = slot.key.clone();
            if let Some(old) = slot.clear() {
                close_resource(&key, old.as_ref());
            }
            info!(cache = self.name, key = %key, "Resource evicted");
            evicted += 1;
        }
        if evicted != 0 {
            slots.retain(|s| !s.is_free());
            Self::sort(&mut slots);
        }
        info!(cache = self.name, prefix = %prefix, evicted, "Prefix eviction finished");
        evicted
    }

    /// Close and drop every entry
    pub fn reset(&self) {
        let mut slots = self.slots.write();
        for slot in slots.iter_mut() {
            let key = slot.key.clone();
            if let Some(old) = slot.clear() {
                close_resource(&key, old.as_ref());
            }
        }
        slots.clear();
        info!(cache = self.name, "Cache reset");
    }

    /// Revalidate every entry against its backing file
    ///
    /// Stat and compile run outside the lock against a snapshot. Each
    /// outcome is applied under the write lock only if the slot still holds
    /// the object the snapshot saw, so concurrent inserts are never undone.
    pub fn sync<C>(&self, compiler: &C) -> SyncReport
    where
        C: Compile<T> + ?Sized,
    {
        let snapshot: Vec<(String, Arc<T>)> = self
            .slots
            .read()
            .iter()
            .filter(|s| !s.is_free() && s.file_backed)
            .filter_map(|s| s.value.clone().map(|v| (s.key.clone(), v)))
            .collect();

        let mut report = SyncReport::default();
        for (key, current) in snapshot {
            match file_mod_time(&key) {
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    if self.evict_if_current(&key, &current) {
                        report.evicted += 1;
                    }
                }
                Err(e) => {
                    warn!(cache = self.name, key = %key, error = %e, "Stat failed, keeping resource");
                    report.failed += 1;
                }
                Ok(mtime) if mtime == current.mod_time() => report.unchanged += 1,
                Ok(_) => match compiler.compile(&key, &current.meta()) {
                    Ok(fresh) => {
                        if self.swap_if_current(&key, &current, Arc::new(fresh)) {
                            report.recompiled += 1;
                        }
                    }
                    Err(e) => {
                        error!(cache = self.name, key = %key, error = %e, "Recompile failed, serving stale resource");
                        report.failed += 1;
                    }
                },
            }
        }

        if report.changed() {
            info!(
                cache = self.name,
                recompiled = report.recompiled,
                evicted = report.evicted,
                "Sync finished"
            );
        }
        report
    }

    fn evict_if_current(&self, key: &str, current: &Arc<T>) -> bool {
        let mut slots = self.slots.write();
        let Some(idx) = Self::position(&slots, key) else {
            return false;
        };
        let still_current = slots[idx]
            .value
            .as_ref()
            .is_some_and(|v| Arc::ptr_eq(v, current));
        if !still_current {
            return false;
        }
        if let Some(old) = slots[idx].clear() {
            close_resource(key, old.as_ref());
        }
        slots.retain(|s| !s.is_free());
        Self::sort(&mut slots);
        info!(cache = self.name, key = %key, "Backing file gone, resource evicted");
        true
    }

    fn swap_if_current(&self, key: &str, current: &Arc<T>, fresh: Arc<T>) -> bool {
        let mut slots = self.slots.write();
        let idx = Self::position(&slots, key).filter(|&idx| {
            slots[idx]
                .value
                .as_ref()
                .is_some_and(|v| Arc::ptr_eq(v, current))
        });

        let Some(idx) = idx else {
            drop(slots);
            debug!(cache = self.name, key = %key, "Entry changed during sync, discarding recompile");
            close_resource(key, fresh.as_ref());
            return false;
        };

        close_resource(key, current.as_ref());
        slots[idx].value = Some(fresh);
        info!(cache = self.name, key = %key, "Resource recompiled");
        true
    }
}

impl<T: Resource> Drop for ResourceCache<T> {
    fn drop(&mut self) {
        self.reset();
    }
}
