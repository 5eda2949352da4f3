use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::EngineError;

use super::worker::{OutputRedirect, Worker, WorkerExit, WorkerFactory};

struct LauncherState {
    slots: Vec<Option<Arc<dyn Worker>>>,
    next_index: usize,
    waiters: Vec<JoinHandle<()>>,
    shut_down: bool,
}

impl LauncherState {
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn all_finished(&self) -> bool {
        self.next_index >= self.capacity() && self.slots.iter().all(Option::is_none)
    }
}

struct LauncherInner {
    state: Mutex<LauncherState>,
    factory: Arc<dyn WorkerFactory>,
    notify_on_finish: Arc<Notify>,
    output: OutputRedirect,
}

impl LauncherInner {
    fn lock(&self) -> MutexGuard<'_, LauncherState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Starts a fixed number of workers, possibly in batches, and watches each
/// one until it ends.
///
/// The slot lock is held while workers are created, so
/// [`destroy_all_workers`](Self::destroy_all_workers) either sees a started
/// worker or prevents it from starting.
pub struct WorkerLauncher {
    inner: Arc<LauncherInner>,
}

impl WorkerLauncher {
    /// `notify_on_finish` is woken when the last worker ends.
    #[must_use]
    pub fn new(
        capacity: usize,
        factory: Arc<dyn WorkerFactory>,
        notify_on_finish: Arc<Notify>,
        output: OutputRedirect,
    ) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            inner: Arc::new(LauncherInner {
                state: Mutex::new(LauncherState {
                    slots,
                    next_index: 0,
                    waiters: Vec::new(),
                    shut_down: false,
                }),
                factory,
                notify_on_finish,
                output,
            }),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity()
    }

    /// Starts up to `count` more workers. Returns whether capacity remains.
    ///
    /// # Errors
    ///
    /// Returns an error when the launcher is shut down or a worker cannot be
    /// created; workers started before the failure keep running.
    pub fn start_some_workers(&self, count: usize) -> Result<bool, EngineError> {
        let mut state = self.inner.lock();
        if state.shut_down {
            return Err(EngineError::LauncherShutdown);
        }

        let remaining = state.capacity().saturating_sub(state.next_index);
        for _ in 0..count.min(remaining) {
            let index = state.next_index;
            let worker = self
                .inner
                .factory
                .create(self.inner.output, self.inner.output)?;

            if let Some(slot) = state.slots.get_mut(index) {
                *slot = Some(Arc::clone(&worker));
            }
            info!("worker {} started", worker.identity().name());
            state.waiters.push(tokio::spawn(wait_for_worker(
                Arc::clone(&self.inner),
                index,
                worker,
            )));
            state.next_index = index.saturating_add(1);
        }

        Ok(state.capacity() > state.next_index)
    }

    /// # Errors
    ///
    /// See [`start_some_workers`](Self::start_some_workers).
    pub fn start_all_workers(&self) -> Result<(), EngineError> {
        self.start_some_workers(usize::MAX).map(|_| ())
    }

    /// True once every worker has been started and has ended.
    #[must_use]
    pub fn all_finished(&self) -> bool {
        self.inner.lock().all_finished()
    }

    /// Permanently prevents further starts.
    pub fn dont_start_any_more(&self) {
        let mut state = self.inner.lock();
        state.next_index = state.capacity();
    }

    /// Prevents further starts, then destroys every running worker.
    pub fn destroy_all_workers(&self) {
        let running: Vec<_> = {
            let mut state = self.inner.lock();
            state.next_index = state.capacity();
            state.slots.iter().flatten().cloned().collect()
        };
        for worker in running {
            debug!("destroying worker {}", worker.identity().name());
            worker.destroy();
        }
    }

    /// Refuses further starts and waits for every waiter task to end. Must
    /// be called even if no worker was ever started.
    pub async fn shutdown(&self) {
        let waiters = {
            let mut state = self.inner.lock();
            state.shut_down = true;
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            if let Err(err) = waiter.await {
                debug!("Worker waiter ended abnormally: {}", err);
            }
        }
    }
}

/// Destroys the worker if its waiter is dropped before the worker ends.
struct DestroyOnDrop {
    worker: Arc<dyn Worker>,
    armed: bool,
}

impl Drop for DestroyOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.worker.destroy();
        }
    }
}

async fn wait_for_worker(inner: Arc<LauncherInner>, index: usize, worker: Arc<dyn Worker>) {
    let mut guard = DestroyOnDrop {
        worker: Arc::clone(&worker),
        armed: true,
    };

    match worker.wait_for().await {
        Ok(WorkerExit::Finished(code)) => {
            info!("worker {} finished (exit {:?})", worker.identity().name(), code);
        }
        Ok(WorkerExit::Destroyed) => {
            info!("worker {} destroyed", worker.identity().name());
        }
        Err(err) => {
            warn!("Lost track of worker {}: {}", worker.identity().name(), err);
            worker.destroy();
        }
    }
    guard.armed = false;

    let finished = {
        let mut state = inner.lock();
        if let Some(slot) = state.slots.get_mut(index) {
            *slot = None;
        }
        state.all_finished()
    };
    if finished {
        inner.notify_on_finish.notify_waiters();
    }
}
