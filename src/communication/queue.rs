use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::error::CommunicationError;
use crate::protocol::Message;

struct QueueState<T> {
    items: VecDeque<T>,
    shutdown: bool,
}

/// Unbounded FIFO with blocking dequeue. Shutdown is terminal: queued items
/// are discarded and every current and future call reports shutdown.
pub struct ThreadSafeQueue<T> {
    state: Mutex<QueueState<T>>,
    available: Notify,
}

impl<T> Default for ThreadSafeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ThreadSafeQueue<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                shutdown: false,
            }),
            available: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// # Errors
    ///
    /// Returns [`CommunicationError::Shutdown`] once the queue is shut down.
    pub fn queue(&self, item: T) -> Result<(), CommunicationError> {
        {
            let mut state = self.lock();
            if state.shutdown {
                return Err(CommunicationError::Shutdown { component: "queue" });
            }
            state.items.push_back(item);
        }
        self.available.notify_one();
        Ok(())
    }

    /// Non-blocking dequeue.
    ///
    /// # Errors
    ///
    /// Returns [`CommunicationError::Shutdown`] once the queue is shut down.
    pub fn try_dequeue(&self) -> Result<Option<T>, CommunicationError> {
        let mut state = self.lock();
        if state.shutdown {
            return Err(CommunicationError::Shutdown { component: "queue" });
        }
        Ok(state.items.pop_front())
    }

    /// Waits for the next item.
    ///
    /// # Errors
    ///
    /// Returns [`CommunicationError::Shutdown`] if the queue is, or becomes,
    /// shut down.
    pub async fn dequeue(&self) -> Result<T, CommunicationError> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_dequeue()? {
                return Ok(item);
            }

            notified.await;
        }
    }

    pub fn shutdown(&self) {
        {
            let mut state = self.lock();
            state.shutdown = true;
            state.items.clear();
        }
        self.available.notify_waiters();
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.lock().shutdown
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.lock().items.len()
    }
}

enum QueueItem {
    Message(Message),
    Error(CommunicationError),
}

/// Message queue that can optionally carry errors to its single consumer.
pub struct MessageQueue {
    queue: ThreadSafeQueue<QueueItem>,
    pass_errors: bool,
}

impl MessageQueue {
    #[must_use]
    pub fn new(pass_errors: bool) -> Self {
        Self {
            queue: ThreadSafeQueue::new(),
            pass_errors,
        }
    }

    /// # Errors
    ///
    /// Returns [`CommunicationError::Shutdown`] once the queue is shut down.
    pub fn queue(&self, message: Message) -> Result<(), CommunicationError> {
        self.queue.queue(QueueItem::Message(message))
    }

    /// # Errors
    ///
    /// Returns [`CommunicationError::QueueRejectsErrors`] when this queue was
    /// built without error passing, or a shutdown error.
    pub fn queue_error(&self, error: CommunicationError) -> Result<(), CommunicationError> {
        if !self.pass_errors {
            return Err(CommunicationError::QueueRejectsErrors);
        }
        self.queue.queue(QueueItem::Error(error))
    }

    /// # Errors
    ///
    /// Returns a shutdown error, or a queued error wrapped as a failure.
    pub fn try_dequeue(&self) -> Result<Option<Message>, CommunicationError> {
        self.queue.try_dequeue()?.map(into_message).transpose()
    }

    /// # Errors
    ///
    /// Returns a shutdown error, or a queued error wrapped as a failure.
    pub async fn dequeue(&self) -> Result<Message, CommunicationError> {
        into_message(self.queue.dequeue().await?)
    }

    pub fn shutdown(&self) {
        self.queue.shutdown();
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.queue.size()
    }
}

fn into_message(item: QueueItem) -> Result<Message, CommunicationError> {
    match item {
        QueueItem::Message(message) => Ok(message),
        QueueItem::Error(error) => Err(CommunicationError::failure(
            "Exception received from message queue",
            error,
        )),
    }
}
