//! Handle tables that own every object reachable through a handle.
//!
//! [`HandleTable`] stores objects of one type behind an `RwLock`. Objects are kept as `Arc<T>`:
//! a lookup hands out a clone of the `Arc`, so releasing a handle only detaches the object from
//! the table. The object itself is destroyed when the last in-flight user drops its clone. This
//! means `remove` never waits for concurrent evaluations, and a concurrent evaluation never
//! observes a destroyed object.
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{
    handle::{Handle, HandleKind, HandleTarget, GENERATION_MASK},
    Client, Error, Options, Result, UserContext,
};

struct Slot<T> {
    generation: u32,
    value: Option<Arc<T>>,
}

impl<T> Slot<T> {
    /// Advance the generation of a vacated slot. Returns `false` once the generation space is
    /// used up: the slot is then retired and never handed out again, so no stale token can
    /// ever match it.
    fn advance(&mut self) -> bool {
        // Live slots never carry `GENERATION_MASK`, so this cannot leave the mask.
        self.generation += 1;
        self.generation < GENERATION_MASK
    }
}

struct Slots<T> {
    slots: Vec<Slot<T>>,
    /// Indices of empty slots, reused LIFO.
    free: Vec<u32>,
    live: usize,
}

/// A generation-checked table of objects of a single kind.
pub struct HandleTable<T> {
    inner: RwLock<Slots<T>>,
}

impl<T: HandleTarget> Default for HandleTable<T> {
    fn default() -> Self {
        HandleTable::new()
    }
}

impl<T: HandleTarget> HandleTable<T> {
    /// Create a new empty table.
    pub fn new() -> HandleTable<T> {
        HandleTable {
            inner: RwLock::new(Slots {
                slots: Vec::new(),
                free: Vec::new(),
                live: 0,
            }),
        }
    }

    // Every mutation of `Slots` completes before any code that could panic runs, so the data
    // behind a poisoned lock is still consistent.
    fn read(&self) -> RwLockReadGuard<'_, Slots<T>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Slots<T>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take ownership of `value` and mint a handle for it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RegistryFull`] if all 2^32 slots are occupied.
    pub fn insert(&self, value: T) -> Result<Handle<T>> {
        // Allocating the Arc before taking the lock to keep the critical section short.
        let value = Arc::new(value);

        let mut table = self.write();
        let handle = match table.free.pop() {
            Some(index) => {
                let slot = &mut table.slots[index as usize];
                slot.value = Some(value);
                Handle::new(index, slot.generation)
            }
            None => {
                let index = u32::try_from(table.slots.len())
                    .map_err(|_| Error::RegistryFull { kind: T::KIND })?;
                table.slots.push(Slot {
                    generation: 0,
                    value: Some(value),
                });
                Handle::new(index, 0)
            }
        };
        table.live += 1;
        Ok(handle)
    }

    /// Resolve `handle` to the object it refers to.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandle`] if the handle was released or never minted by this table.
    pub fn get(&self, handle: Handle<T>) -> Result<Arc<T>> {
        let table = self.read();
        table
            .slots
            .get(handle.index() as usize)
            .filter(|slot| slot.generation == handle.generation())
            .and_then(|slot| slot.value.clone())
            .ok_or(Error::InvalidHandle { kind: T::KIND })
    }

    /// Resolve an opaque token to the object it refers to.
    pub fn get_raw(&self, raw: u64) -> Result<Arc<T>> {
        self.get(Handle::from_raw(raw)?)
    }

    /// Detach the object from the table and invalidate `handle` and all its copies.
    ///
    /// The returned `Arc` may still be shared with in-flight users; the object is dropped once
    /// they finish.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandle`] if the handle was already released.
    pub fn remove(&self, handle: Handle<T>) -> Result<Arc<T>> {
        let mut table = self.write();
        let slot = table
            .slots
            .get_mut(handle.index() as usize)
            .filter(|slot| slot.generation == handle.generation() && slot.value.is_some())
            .ok_or(Error::InvalidHandle { kind: T::KIND })?;

        let value = slot.value.take().ok_or(Error::InvalidHandle { kind: T::KIND })?;
        let reusable = slot.advance();
        if reusable {
            table.free.push(handle.index());
        } else {
            log::debug!(target: "evalbridge", handle; "retired exhausted handle slot");
        }
        table.live -= 1;
        Ok(value)
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        self.read().live
    }

    /// Returns `true` if the table holds no live objects.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release every live handle, returning the detached objects.
    pub fn drain(&self) -> Vec<Arc<T>> {
        let mut table = self.write();
        let mut drained = Vec::with_capacity(table.live);
        let Slots { slots, free, live } = &mut *table;
        for (index, slot) in slots.iter_mut().enumerate() {
            if let Some(value) = slot.value.take() {
                if slot.advance() {
                    free.push(index as u32);
                }
                drained.push(value);
            }
        }
        *live = 0;
        drained
    }
}

/// Owner of all objects reachable through handles: one table per [`HandleKind`].
///
/// A `Registry` is an ordinary value. Tests create their own; the C ABI uses the instance owned
/// by [`Bridge::global()`](crate::Bridge::global).
#[derive(Default)]
pub struct Registry {
    options: HandleTable<Options>,
    clients: HandleTable<Client>,
    users: HandleTable<UserContext>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Table of [`Options`].
    pub fn options(&self) -> &HandleTable<Options> {
        &self.options
    }

    /// Table of [`Client`]s.
    pub fn clients(&self) -> &HandleTable<Client> {
        &self.clients
    }

    /// Table of [`UserContext`]s.
    pub fn users(&self) -> &HandleTable<UserContext> {
        &self.users
    }

    /// Number of live handles of the given kind.
    pub fn live_handles(&self, kind: HandleKind) -> usize {
        match kind {
            HandleKind::Options => self.options.len(),
            HandleKind::Client => self.clients.len(),
            HandleKind::User => self.users.len(),
        }
    }

    /// Release every handle of every kind.
    ///
    /// Clients are released first so that their background work stops before anything else
    /// is torn down.
    pub fn clear(&self) {
        let clients = self.clients.drain();
        let users = self.users.drain();
        let options = self.options.drain();
        log::debug!(target: "evalbridge",
                    clients = clients.len(),
                    users = users.len(),
                    options = options.len();
                    "cleared handle registry");
    }
}
