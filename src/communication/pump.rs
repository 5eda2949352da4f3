use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::sender::{Receiver, Sender};

struct PumpInner {
    receiver: Arc<dyn Receiver>,
    sender: Arc<dyn Sender>,
    shutdown_triggered: AtomicBool,
}

impl PumpInner {
    /// Shuts the receiver then the sender, once.
    async fn trigger_shutdown(&self) -> bool {
        if self.shutdown_triggered.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.receiver.shutdown().await;
        self.sender.shutdown().await;
        true
    }
}

/// Drains a [`Receiver`] into a [`Sender`] on its own tasks. Messages keep
/// their order only when a single task is used.
pub struct MessagePump {
    inner: Arc<PumpInner>,
    threads: usize,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MessagePump {
    #[must_use]
    pub fn new(receiver: Arc<dyn Receiver>, sender: Arc<dyn Sender>, threads: usize) -> Self {
        Self {
            inner: Arc::new(PumpInner {
                receiver,
                sender,
                shutdown_triggered: AtomicBool::new(false),
            }),
            threads: threads.max(1),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn start(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for _ in 0..self.threads {
            tasks.push(tokio::spawn(pump_loop(Arc::clone(&self.inner))));
        }
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown_triggered.load(Ordering::Acquire)
    }

    /// Shuts down the receiver and the sender, then waits for the pump tasks
    /// to finish. Idempotent.
    pub async fn shutdown(&self) {
        self.inner.trigger_shutdown().await;
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(err) = task.await {
                debug!("Message pump task ended abnormally: {}", err);
            }
        }
    }
}

async fn pump_loop(inner: Arc<PumpInner>) {
    while !inner.shutdown_triggered.load(Ordering::Acquire) {
        let message = match inner.receiver.wait_for_message().await {
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(err) => {
                warn!("Message pump receive failed: {}", err);
                break;
            }
        };

        if let Err(err) = inner.sender.send(message).await {
            if !err.is_shutdown() {
                warn!("Message pump send failed: {}", err);
            }
            break;
        }
    }

    if inner.trigger_shutdown().await {
        debug!("Message pump shut down from its own task");
    }
}
