use std::sync::{Arc, Mutex, PoisonError};

/// Ordered listener list. Listeners are informed outside the lock, in
/// registration order, from a snapshot taken at the start of each event.
pub struct ListenerSupport<L: ?Sized> {
    listeners: Mutex<Vec<Arc<L>>>,
}

impl<L: ?Sized> Default for ListenerSupport<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: ?Sized> ListenerSupport<L> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, listener: Arc<L>) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub fn apply<F>(&self, mut inform: F)
    where
        F: FnMut(&L),
    {
        let snapshot = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in &snapshot {
            inform(listener);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
