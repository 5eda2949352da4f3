use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, watch};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::debug;

use crate::error::CommunicationError;
use crate::protocol::{Address, JsonFrameCodec, Message, MessageRequiringResponse};

use super::connector::Connector;
use super::sender::{BlockingSender, Receiver, Sender};

type MessageReader = FramedRead<OwnedReadHalf, JsonFrameCodec<Message>>;
type MessageWriter = FramedWrite<OwnedWriteHalf, JsonFrameCodec<Message>>;
type SharedWriter = Arc<Mutex<MessageWriter>>;

async fn connect(
    connector: &Connector,
    address: Option<&Address>,
) -> Result<(MessageReader, SharedWriter), CommunicationError> {
    let stream = connector.connect(address).await?;
    let (read_half, write_half) = stream.into_split();
    Ok((
        FramedRead::new(read_half, JsonFrameCodec::new()),
        Arc::new(Mutex::new(FramedWrite::new(write_half, JsonFrameCodec::new()))),
    ))
}

async fn write(writer: &SharedWriter, message: Message) -> Result<(), CommunicationError> {
    writer
        .lock()
        .await
        .send(message)
        .await
        .map_err(|err| CommunicationError::io("write message", err))
}

/// Peer-side reader for a connection opened with a [`Connector`].
pub struct ClientReceiver {
    reader: Mutex<MessageReader>,
    writer: SharedWriter,
    shutdown_tx: watch::Sender<bool>,
}

impl ClientReceiver {
    /// # Errors
    ///
    /// Returns an error when the connection or handshake fails.
    pub async fn connect(
        connector: &Connector,
        address: Option<&Address>,
    ) -> Result<Self, CommunicationError> {
        let (reader, writer) = connect(connector, address).await?;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            reader: Mutex::new(reader),
            writer,
            shutdown_tx,
        })
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown_tx.borrow()
    }
}

#[async_trait]
impl Receiver for ClientReceiver {
    async fn wait_for_message(&self) -> Result<Option<Message>, CommunicationError> {
        if self.is_shutdown() {
            return Ok(None);
        }
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut reader = self.reader.lock().await;

        let frame = tokio::select! {
            _ = shutdown_rx.wait_for(|shutdown| *shutdown) => return Ok(None),
            frame = reader.next() => frame,
        };

        match frame {
            None => {
                debug!("Console connection reached end of stream");
                self.shutdown_tx.send_replace(true);
                Ok(None)
            }
            Some(Ok(Message::CloseCommunication)) => {
                debug!("Received close communication");
                self.shutdown_tx.send_replace(true);
                Ok(None)
            }
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(err)) => Err(CommunicationError::io("read message", err)),
        }
    }

    async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }
}

/// Peer-side writer. Built on its own connection it can also make blocking
/// requests; built from a [`ClientReceiver`] it shares that connection.
pub struct ClientSender {
    writer: SharedWriter,
    reader: Option<Mutex<MessageReader>>,
    shut_down: AtomicBool,
}

impl ClientSender {
    /// # Errors
    ///
    /// Returns an error when the connection or handshake fails.
    pub async fn connect(
        connector: &Connector,
        address: Option<&Address>,
    ) -> Result<Self, CommunicationError> {
        let (reader, writer) = connect(connector, address).await?;
        Ok(Self {
            writer,
            reader: Some(Mutex::new(reader)),
            shut_down: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn from_receiver(receiver: &ClientReceiver) -> Self {
        Self {
            writer: Arc::clone(&receiver.writer),
            reader: None,
            shut_down: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Sender for ClientSender {
    async fn send(&self, message: Message) -> Result<(), CommunicationError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(CommunicationError::Shutdown {
                component: "client sender",
            });
        }
        write(&self.writer, message).await
    }

    async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(err) = write(&self.writer, Message::CloseCommunication).await {
            debug!("Failed to send close communication: {}", err);
        }
        if let Err(err) = self.writer.lock().await.close().await {
            debug!("Failed to close client connection: {}", err);
        }
    }
}

#[async_trait]
impl BlockingSender for ClientSender {
    async fn blocking_send(&self, message: Message) -> Result<Message, CommunicationError> {
        let reader = self.reader.as_ref().ok_or(CommunicationError::NoResponder)?;
        let mut reader = reader.lock().await;

        Sender::send(
            self,
            Message::RequiringResponse(MessageRequiringResponse::new(message)),
        )
        .await?;

        match reader.next().await {
            Some(Ok(Message::NoResponse)) => Err(CommunicationError::NoResponse),
            Some(Ok(response)) => Ok(response),
            Some(Err(err)) => Err(CommunicationError::io("read response", err)),
            None => Err(CommunicationError::ConnectionClosed),
        }
    }

    async fn shutdown(&self) {
        Sender::shutdown(self).await;
    }
}
