use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use futures_util::SinkExt;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedWrite;
use tracing::{debug, warn};

use crate::error::CommunicationError;
use crate::protocol::{ConnectionType, JsonFrameCodec, Message};

use super::acceptor::Acceptor;
use super::sender::Sender;

/// Broadcasts to every accepted connection of one type.
pub struct FanOutServerSender {
    acceptor: Acceptor,
    connection_type: ConnectionType,
}

impl FanOutServerSender {
    #[must_use]
    pub const fn new(acceptor: Acceptor, connection_type: ConnectionType) -> Self {
        Self {
            acceptor,
            connection_type,
        }
    }
}

#[async_trait]
impl Sender for FanOutServerSender {
    async fn send(&self, message: Message) -> Result<(), CommunicationError> {
        let pool = self.acceptor.socket_set(self.connection_type)?;
        for reservation in pool.reserve_all().await {
            let Some(socket) = reservation.resource() else {
                continue;
            };
            match socket.write_message(message.clone()).await {
                Ok(()) => reservation.free(),
                Err(err) => {
                    warn!("Failed to send to {}: {}", socket.identity(), err);
                    reservation.close();
                }
            }
        }
        Ok(())
    }

    async fn shutdown(&self) {}
}

struct StreamHandle {
    tx: mpsc::UnboundedSender<Message>,
    task: JoinHandle<()>,
}

/// Broadcasts to a changing set of byte streams, such as worker stdin
/// pipes. Each stream has its own writer task; a stream whose writer has
/// failed is dropped on the next send.
#[derive(Default)]
pub struct FanOutStreamSender {
    streams: Mutex<Vec<StreamHandle>>,
    shut_down: AtomicBool,
}

impl FanOutStreamSender {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a stream. `initial` is written to it before any broadcast.
    pub fn add<W>(&self, writer: W, initial: Option<Message>)
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        if let Some(message) = initial
            && tx.send(message).is_err()
        {
            debug!("Stream writer closed before the initial message was queued");
        }

        let task = tokio::spawn(async move {
            let mut frames = FramedWrite::new(writer, JsonFrameCodec::<Message>::new());
            while let Some(message) = rx.recv().await {
                if let Err(err) = frames.send(message).await {
                    debug!("Stream write failed: {}", err);
                    break;
                }
            }
            if let Err(err) = frames.close().await {
                debug!("Failed to close stream: {}", err);
            }
        });

        if self.shut_down.load(Ordering::Acquire) {
            drop(tx);
            return;
        }
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(StreamHandle { tx, task });
    }

    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl Sender for FanOutStreamSender {
    async fn send(&self, message: Message) -> Result<(), CommunicationError> {
        let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        streams.retain(|stream| !stream.task.is_finished() && stream.tx.send(message.clone()).is_ok());
        Ok(())
    }

    /// Closes every stream once queued messages have been written.
    async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        let streams = std::mem::take(&mut *self.streams.lock().unwrap_or_else(PoisonError::into_inner));
        for stream in streams {
            drop(stream.tx);
            if let Err(err) = stream.task.await {
                debug!("Stream writer ended abnormally: {}", err);
            }
        }
    }
}
