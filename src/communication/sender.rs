use std::sync::Arc;

use async_trait::async_trait;

use crate::error::CommunicationError;
use crate::protocol::Message;

use super::queue::MessageQueue;

/// One-way message sink.
#[async_trait]
pub trait Sender: Send + Sync {
    /// # Errors
    ///
    /// Returns an error when the message cannot be delivered or handled.
    async fn send(&self, message: Message) -> Result<(), CommunicationError>;

    async fn shutdown(&self);
}

/// Request/response sink: every request yields exactly one reply.
#[async_trait]
pub trait BlockingSender: Send + Sync {
    /// # Errors
    ///
    /// Returns an error when the request fails or is answered with
    /// [`Message::NoResponse`].
    async fn blocking_send(&self, message: Message) -> Result<Message, CommunicationError>;

    async fn shutdown(&self);
}

#[async_trait]
pub trait Receiver: Send + Sync {
    /// Waits for the next message; `None` once the receiver is shut down.
    ///
    /// # Errors
    ///
    /// Returns an error forwarded from the underlying connections.
    async fn wait_for_message(&self) -> Result<Option<Message>, CommunicationError>;

    async fn shutdown(&self);
}

/// Sends every message to two delegates in turn.
pub struct TeeSender {
    first: Arc<dyn Sender>,
    second: Arc<dyn Sender>,
}

impl TeeSender {
    #[must_use]
    pub fn new(first: Arc<dyn Sender>, second: Arc<dyn Sender>) -> Self {
        Self { first, second }
    }
}

#[async_trait]
impl Sender for TeeSender {
    async fn send(&self, message: Message) -> Result<(), CommunicationError> {
        self.first.send(message.clone()).await?;
        self.second.send(message).await
    }

    async fn shutdown(&self) {
        self.first.shutdown().await;
        self.second.shutdown().await;
    }
}

/// Forwards messages but keeps the delegate alive through shutdown.
pub struct IgnoreShutdownSender {
    delegate: Arc<dyn Sender>,
}

impl IgnoreShutdownSender {
    #[must_use]
    pub fn new(delegate: Arc<dyn Sender>) -> Self {
        Self { delegate }
    }
}

#[async_trait]
impl Sender for IgnoreShutdownSender {
    async fn send(&self, message: Message) -> Result<(), CommunicationError> {
        self.delegate.send(message).await
    }

    async fn shutdown(&self) {}
}

/// Buffers messages until flushed. Flushes are serialized so queued order
/// is delivery order.
pub struct QueuedSenderDecorator {
    delegate: Arc<dyn Sender>,
    queue: MessageQueue,
    flush_lock: tokio::sync::Mutex<()>,
}

impl QueuedSenderDecorator {
    #[must_use]
    pub fn new(delegate: Arc<dyn Sender>) -> Self {
        Self {
            delegate,
            queue: MessageQueue::new(false),
            flush_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// # Errors
    ///
    /// Returns a shutdown error once the decorator is shut down.
    pub fn queue(&self, message: Message) -> Result<(), CommunicationError> {
        self.queue.queue(message)
    }

    /// Delivers everything queued so far.
    ///
    /// # Errors
    ///
    /// Returns the first delivery error; later messages stay queued.
    pub async fn flush(&self) -> Result<(), CommunicationError> {
        let _guard = self.flush_lock.lock().await;
        while let Some(message) = self.queue.try_dequeue()? {
            self.delegate.send(message).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Sender for QueuedSenderDecorator {
    async fn send(&self, message: Message) -> Result<(), CommunicationError> {
        self.queue(message)?;
        self.flush().await
    }

    async fn shutdown(&self) {
        self.queue.shutdown();
        self.delegate.shutdown().await;
    }
}
