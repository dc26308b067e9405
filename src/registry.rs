//! Id-keyed registry of kernel synchronization objects.
//!
//! The registry is the capability through which syscalls resolve numeric object ids to
//! live kernel objects. It provides per-id atomicity for creation, lookup, conditional
//! withdrawal and bulk iteration, backed by a concurrent hash map. It is linearizable
//! per entry; cross-object consistency is the synchronization core's responsibility.
//!
//! # Shared keys
//!
//! An object created with a nonzero `key` is additionally published in a process-shared
//! namespace: a later create with the same key opens the existing object instead of
//! allocating a new one. A zero key is process-private.
//!
//! # Key Components
//!
//! - [`ObjectRegistry`] - the registry itself
//! - [`KernelObject`] - tagged handle to either kernel object type

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::sync::{KernelCond, KernelMutex};
use crate::{Error, Result};

/// First id handed out for newly created objects.
///
/// Ids below this value never collide with live objects, which keeps obviously-invalid
/// guest-supplied ids distinguishable in logs.
const FIRST_ID: u32 = 0x100;

/// Tagged handle to a registered kernel object.
///
/// Cloning is cheap - both variants hold an `Arc` to the underlying object.
#[derive(Clone, Debug)]
pub enum KernelObject {
    /// An exclusive-ownership mutex.
    Mutex(Arc<KernelMutex>),
    /// A condition variable bound to a mutex.
    Cond(Arc<KernelCond>),
}

impl KernelObject {
    /// Returns the mutex handle, or `None` for other object types.
    #[must_use]
    pub fn as_mutex(&self) -> Option<&Arc<KernelMutex>> {
        match self {
            KernelObject::Mutex(m) => Some(m),
            KernelObject::Cond(_) => None,
        }
    }

    /// Returns the condition variable handle, or `None` for other object types.
    #[must_use]
    pub fn as_cond(&self) -> Option<&Arc<KernelCond>> {
        match self {
            KernelObject::Cond(c) => Some(c),
            KernelObject::Mutex(_) => None,
        }
    }

    /// Returns the object's sharing key (0 = process-private).
    #[must_use]
    pub fn key(&self) -> u64 {
        match self {
            KernelObject::Mutex(m) => m.key(),
            KernelObject::Cond(c) => c.key(),
        }
    }

    /// Increments the object's creation reference counter.
    fn on_registered(&self) {
        match self {
            KernelObject::Mutex(m) => m.on_registered(),
            KernelObject::Cond(c) => c.on_registered(),
        }
    }
}

/// Concurrent id-keyed object table with a process-shared key namespace.
///
/// # Example
///
/// ```rust
/// use guestsync::{ObjectRegistry, KernelObject};
/// use guestsync::sync::{KernelMutex, MutexAttributes};
/// use std::sync::Arc;
///
/// let registry = ObjectRegistry::new();
/// let id = registry
///     .create(0, || {
///         Ok(KernelObject::Mutex(Arc::new(KernelMutex::new(
///             &MutexAttributes::default(),
///         ))))
///     })
///     .unwrap();
///
/// assert!(registry.get_mutex(id).is_ok());
/// ```
#[derive(Debug, Default)]
pub struct ObjectRegistry {
    /// All live objects keyed by numeric id.
    objects: DashMap<u32, KernelObject>,

    /// Shared-key namespace (key -> id), entries exist only for nonzero keys.
    shared_keys: DashMap<u64, u32>,

    /// Next id to allocate.
    next_id: AtomicU32,
}

impl ObjectRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            objects: DashMap::new(),
            shared_keys: DashMap::new(),
            next_id: AtomicU32::new(FIRST_ID),
        }
    }

    /// Creates and registers a new object, or opens an existing shared one.
    ///
    /// If `key` is nonzero and already published, the existing object's id is returned
    /// and `factory` is not invoked. Otherwise `factory` constructs the object, which is
    /// registered under a freshly allocated id.
    ///
    /// # Errors
    ///
    /// Propagates any error from `factory` (e.g. [`Error::NotFound`] when a condition
    /// variable's mutex disappeared between lookup and binding).
    pub fn create(&self, key: u64, factory: impl FnOnce() -> Result<KernelObject>) -> Result<u32> {
        if key == 0 {
            return Ok(self.register(factory()?));
        }

        // The entry guard reserves the key for the duration of the creation, so two
        // racing creates with the same key converge on one object
        match self.shared_keys.entry(key) {
            Entry::Occupied(mut entry) => {
                let id = *entry.get();
                if self.objects.contains_key(&id) {
                    return Ok(id);
                }
                // Stale mapping left by a withdrawn object: replace it
                let id = self.register(factory()?);
                entry.insert(id);
                Ok(id)
            }
            Entry::Vacant(entry) => {
                let id = self.register(factory()?);
                entry.insert(id);
                Ok(id)
            }
        }
    }

    /// Registers `obj` under a freshly allocated id.
    fn register(&self, obj: KernelObject) -> u32 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        obj.on_registered();
        self.objects.insert(id, obj);
        id
    }

    /// Registers an object under a specific id (savestate restore path).
    ///
    /// Keeps the id allocator ahead of every restored id so later creations never
    /// collide.
    pub fn insert_loaded(&self, id: u32, obj: KernelObject) {
        let key = obj.key();
        obj.on_registered();
        self.objects.insert(id, obj);
        if key != 0 {
            self.shared_keys.insert(key, id);
        }
        self.next_id.fetch_max(id + 1, Ordering::Relaxed);
    }

    /// Looks up an object by id.
    #[must_use]
    pub fn get(&self, id: u32) -> Option<KernelObject> {
        self.objects.get(&id).map(|r| r.value().clone())
    }

    /// Looks up a mutex by id.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if the id is unknown or names a different object type.
    pub fn get_mutex(&self, id: u32) -> Result<Arc<KernelMutex>> {
        self.get(id)
            .as_ref()
            .and_then(KernelObject::as_mutex)
            .cloned()
            .ok_or(Error::NotFound)
    }

    /// Looks up a condition variable by id.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if the id is unknown or names a different object type.
    pub fn get_cond(&self, id: u32) -> Result<Arc<KernelCond>> {
        self.get(id)
            .as_ref()
            .and_then(KernelObject::as_cond)
            .cloned()
            .ok_or(Error::NotFound)
    }

    /// Runs `f` against the object with the given id without removing it.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if no object exists under `id`.
    pub fn check<R>(&self, id: u32, f: impl FnOnce(&KernelObject) -> R) -> Result<R> {
        self.objects
            .get(&id)
            .map(|r| f(r.value()))
            .ok_or(Error::NotFound)
    }

    /// Atomically withdraws the object with the given id if `pred` approves.
    ///
    /// `pred` runs with the entry exclusively held; if it returns `Ok`, the object is
    /// removed from the table (and from the shared-key namespace) in the same critical
    /// section, so no concurrent lookup can observe a half-destroyed object.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if no object exists under `id`; otherwise whatever `pred`
    /// returns.
    pub fn withdraw<R>(
        &self,
        id: u32,
        pred: impl FnOnce(&KernelObject) -> Result<R>,
    ) -> Result<R> {
        match self.objects.entry(id) {
            Entry::Occupied(entry) => {
                let result = pred(entry.get())?;
                let (_, obj) = entry.remove_entry();
                if obj.key() != 0 {
                    // Only unpublish the mapping if it still points at this id; a
                    // racing create may already have re-claimed the key
                    self.shared_keys.remove_if(&obj.key(), |_, mapped| *mapped == id);
                }
                Ok(result)
            }
            Entry::Vacant(_) => Err(Error::NotFound),
        }
    }

    /// Iterates over every registered object (savestate walk).
    pub fn select(&self, mut f: impl FnMut(u32, &KernelObject)) {
        for entry in &self.objects {
            f(*entry.key(), entry.value());
        }
    }

    /// Returns the number of registered objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Checks whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}
