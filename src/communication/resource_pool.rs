use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::Notify;

use super::listener::ListenerSupport;

/// Something a [`ResourcePool`] owns and can close.
pub trait Resource: Send + Sync + 'static {
    fn close(&self);
}

pub trait ResourcePoolListener<R>: Send + Sync {
    fn resource_added(&self, resource: &Arc<R>);
    fn resource_closed(&self, resource: &Arc<R>);
}

struct Entry<R> {
    id: u64,
    resource: Arc<R>,
    reserved: bool,
}

struct PoolState<R> {
    entries: Vec<Entry<R>>,
    next_id: u64,
    cursor: usize,
}

impl<R> PoolState<R> {
    fn remove(&mut self, id: u64) -> Option<Arc<R>> {
        let position = self.entries.iter().position(|entry| entry.id == id)?;
        let entry = self.entries.remove(position);
        if position < self.cursor {
            self.cursor = self.cursor.saturating_sub(1);
        }
        Some(entry.resource)
    }
}

struct PoolInner<R: Resource> {
    state: Mutex<PoolState<R>>,
    listeners: ListenerSupport<dyn ResourcePoolListener<R>>,
    released: Notify,
}

impl<R: Resource> PoolInner<R> {
    fn lock(&self) -> MutexGuard<'_, PoolState<R>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn free(&self, id: u64) {
        {
            let mut state = self.lock();
            if let Some(entry) = state.entries.iter_mut().find(|entry| entry.id == id) {
                entry.reserved = false;
            }
        }
        self.released.notify_waiters();
    }

    fn close(&self, id: u64) {
        let removed = self.lock().remove(id);
        if let Some(resource) = removed {
            resource.close();
            self.listeners
                .apply(|listener| listener.resource_closed(&resource));
            self.released.notify_waiters();
        }
    }
}

/// Thread-safe set of reservable resources. Only bookkeeping happens under
/// the pool lock; resources are closed and listeners informed outside it.
pub struct ResourcePool<R: Resource> {
    inner: Arc<PoolInner<R>>,
}

impl<R: Resource> Clone for ResourcePool<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: Resource> Default for ResourcePool<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Resource> ResourcePool<R> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    entries: Vec::new(),
                    next_id: 0,
                    cursor: 0,
                }),
                listeners: ListenerSupport::new(),
                released: Notify::new(),
            }),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn ResourcePoolListener<R>>) {
        self.inner.listeners.add(listener);
    }

    /// Registers a resource. Closing the returned handle removes the
    /// resource from the pool and closes it.
    pub fn add(&self, resource: Arc<R>) -> Closeable<R> {
        let id = {
            let mut state = self.inner.lock();
            let id = state.next_id;
            state.next_id = state.next_id.saturating_add(1);
            state.entries.push(Entry {
                id,
                resource: Arc::clone(&resource),
                reserved: false,
            });
            id
        };
        self.inner
            .listeners
            .apply(|listener| listener.resource_added(&resource));

        Closeable {
            pool: Arc::downgrade(&self.inner),
            id,
            closed: AtomicBool::new(false),
        }
    }

    /// Reserves the next free resource, round-robin from an advancing
    /// cursor. Never waits; returns a sentinel when nothing is free.
    #[must_use]
    pub fn reserve_next(&self) -> Reservation<R> {
        let mut state = self.inner.lock();
        let len = state.entries.len();
        let start = state.cursor;

        for offset in 0..len {
            let index = start.wrapping_add(offset).checked_rem(len).unwrap_or(0);
            if let Some(entry) = state.entries.get_mut(index)
                && !entry.reserved
            {
                entry.reserved = true;
                let reservation =
                    Reservation::held(Arc::downgrade(&self.inner), entry.id, &entry.resource);
                state.cursor = index.saturating_add(1);
                return reservation;
            }
        }

        Reservation::sentinel()
    }

    /// Reserves every resource present when the call starts, waiting for
    /// those currently reserved elsewhere to be freed or closed.
    pub async fn reserve_all(&self) -> Vec<Reservation<R>> {
        let mut wanted: Option<HashSet<u64>> = None;
        let mut taken = HashSet::new();
        let mut reservations = Vec::new();

        loop {
            let released = self.inner.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            {
                let mut state = self.inner.lock();
                let wanted = wanted
                    .get_or_insert_with(|| state.entries.iter().map(|entry| entry.id).collect());
                let mut outstanding = false;

                for entry in &mut state.entries {
                    if !wanted.contains(&entry.id) || taken.contains(&entry.id) {
                        continue;
                    }
                    if entry.reserved {
                        outstanding = true;
                    } else {
                        entry.reserved = true;
                        taken.insert(entry.id);
                        reservations.push(Reservation::held(
                            Arc::downgrade(&self.inner),
                            entry.id,
                            &entry.resource,
                        ));
                    }
                }

                if !outstanding {
                    return reservations;
                }
            }

            released.await;
        }
    }

    /// Closes and removes every resource currently in the pool.
    pub fn close_current_resources(&self) {
        let entries = {
            let mut state = self.inner.lock();
            state.cursor = 0;
            std::mem::take(&mut state.entries)
        };

        for entry in entries {
            entry.resource.close();
            self.inner
                .listeners
                .apply(|listener| listener.resource_closed(&entry.resource));
        }
        self.inner.released.notify_waiters();
    }

    #[must_use]
    pub fn count_active(&self) -> usize {
        self.inner.lock().entries.len()
    }
}

/// Handle returned by [`ResourcePool::add`]. Closing is idempotent.
pub struct Closeable<R: Resource> {
    pool: Weak<PoolInner<R>>,
    id: u64,
    closed: AtomicBool,
}

impl<R: Resource> Closeable<R> {
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(pool) = self.pool.upgrade() {
            pool.close(self.id);
        }
    }
}

struct Held<R: Resource> {
    pool: Weak<PoolInner<R>>,
    id: u64,
    resource: Arc<R>,
}

/// Exclusive hold on one pooled resource. Dropping a reservation frees it.
pub struct Reservation<R: Resource> {
    held: Option<Held<R>>,
    released: AtomicBool,
}

impl<R: Resource> Reservation<R> {
    fn held(pool: Weak<PoolInner<R>>, id: u64, resource: &Arc<R>) -> Self {
        Self {
            held: Some(Held {
                pool,
                id,
                resource: Arc::clone(resource),
            }),
            released: AtomicBool::new(false),
        }
    }

    /// The "nothing was free" reservation.
    #[must_use]
    pub const fn sentinel() -> Self {
        Self {
            held: None,
            released: AtomicBool::new(true),
        }
    }

    #[must_use]
    pub const fn is_sentinel(&self) -> bool {
        self.held.is_none()
    }

    #[must_use]
    pub fn resource(&self) -> Option<&Arc<R>> {
        self.held.as_ref().map(|held| &held.resource)
    }

    /// Releases the resource back to the pool without closing it.
    pub fn free(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(held) = &self.held
            && let Some(pool) = held.pool.upgrade()
        {
            pool.free(held.id);
        }
    }

    /// Releases the resource and closes it, removing it from the pool.
    pub fn close(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(held) = &self.held {
            match held.pool.upgrade() {
                Some(pool) => pool.close(held.id),
                None => held.resource.close(),
            }
        }
    }
}

impl<R: Resource> Drop for Reservation<R> {
    fn drop(&mut self) {
        self.free();
    }
}
