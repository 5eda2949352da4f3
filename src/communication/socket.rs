use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use crate::error::CommunicationError;
use crate::protocol::{ConnectDetails, ConnectionIdentity, JsonFrameCodec, Message};

use super::resource_pool::Resource;

/// Bytes requested from the socket per read attempt.
const READ_CHUNK_BYTES: usize = 8 * 1024;

pub trait SocketClosedListener: Send + Sync {
    fn socket_closed(&self, identity: ConnectionIdentity);
}

struct ReadState {
    half: Option<OwnedReadHalf>,
    buffer: BytesMut,
    codec: JsonFrameCodec<Message>,
}

struct ClosedState {
    closed: bool,
    listeners: Vec<Arc<dyn SocketClosedListener>>,
}

enum ReadOutcome {
    Message(Message),
    Nothing,
    EndOfStream,
}

/// An accepted, handshaken connection living in a resource pool. Callers
/// must hold the socket's reservation to read from or write to it.
pub struct SocketWrapper {
    identity: ConnectionIdentity,
    details: ConnectDetails,
    reader: Mutex<ReadState>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    closed: Mutex<ClosedState>,
}

impl SocketWrapper {
    #[must_use]
    pub fn new(stream: TcpStream, identity: ConnectionIdentity, details: ConnectDetails) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            identity,
            details,
            reader: Mutex::new(ReadState {
                half: Some(read_half),
                buffer: BytesMut::new(),
                codec: JsonFrameCodec::new(),
            }),
            writer: tokio::sync::Mutex::new(Some(write_half)),
            closed: Mutex::new(ClosedState {
                closed: false,
                listeners: Vec::new(),
            }),
        }
    }

    #[must_use]
    pub const fn identity(&self) -> ConnectionIdentity {
        self.identity
    }

    #[must_use]
    pub const fn connect_details(&self) -> &ConnectDetails {
        &self.details
    }

    fn lock_reader(&self) -> MutexGuard<'_, ReadState> {
        self.reader.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_closed(&self) -> MutexGuard<'_, ClosedState> {
        self.closed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock_closed().closed
    }

    /// Returns the next complete message if one can be read without
    /// waiting. End of stream closes the socket and yields `None`.
    ///
    /// # Errors
    ///
    /// Returns an error when the read fails or a frame cannot be decoded.
    pub fn try_receive(&self) -> Result<Option<Message>, CommunicationError> {
        let outcome = {
            let mut guard = self.lock_reader();
            let state = &mut *guard;
            loop {
                if let Some(message) = state
                    .codec
                    .decode(&mut state.buffer)
                    .map_err(|err| CommunicationError::io("decode message", err))?
                {
                    break ReadOutcome::Message(message);
                }

                let Some(half) = state.half.as_ref() else {
                    break ReadOutcome::Nothing;
                };
                state.buffer.reserve(READ_CHUNK_BYTES);
                match half.try_read_buf(&mut state.buffer) {
                    Ok(0) => break ReadOutcome::EndOfStream,
                    Ok(_) => {}
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        break ReadOutcome::Nothing;
                    }
                    Err(err) => return Err(CommunicationError::io("read message", err)),
                }
            }
        };

        match outcome {
            ReadOutcome::Message(message) => Ok(Some(message)),
            ReadOutcome::Nothing => Ok(None),
            ReadOutcome::EndOfStream => {
                debug!("Peer {} closed the connection", self.identity);
                self.close();
                Ok(None)
            }
        }
    }

    /// # Errors
    ///
    /// Returns an error when the socket is closed or the write fails.
    pub async fn write_message(&self, message: Message) -> Result<(), CommunicationError> {
        let mut frame = BytesMut::new();
        JsonFrameCodec::<Message>::new()
            .encode(message, &mut frame)
            .map_err(|err| CommunicationError::io("encode message", err))?;

        let mut writer = self.writer.lock().await;
        if self.is_closed() {
            writer.take();
            return Err(CommunicationError::ConnectionClosed);
        }
        let half = writer
            .as_mut()
            .ok_or(CommunicationError::ConnectionClosed)?;
        half.write_all(&frame)
            .await
            .map_err(|err| CommunicationError::io("write message", err))?;
        half.flush()
            .await
            .map_err(|err| CommunicationError::io("flush message", err))?;
        if self.is_closed() {
            writer.take();
        }
        Ok(())
    }

    /// Closes the socket once; later calls do nothing.
    pub fn close(&self) {
        let listeners = {
            let mut closed = self.lock_closed();
            if closed.closed {
                return;
            }
            closed.closed = true;
            std::mem::take(&mut closed.listeners)
        };

        self.lock_reader().half.take();
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }

        for listener in listeners {
            listener.socket_closed(self.identity);
        }
    }

    /// Registers a close listener. Fires immediately if already closed.
    pub fn add_closed_listener(&self, listener: Arc<dyn SocketClosedListener>) {
        let fire_now = {
            let mut closed = self.lock_closed();
            if closed.closed {
                true
            } else {
                closed.listeners.push(Arc::clone(&listener));
                false
            }
        };
        if fire_now {
            listener.socket_closed(self.identity);
        }
    }
}

impl Resource for SocketWrapper {
    fn close(&self) {
        Self::close(self);
    }
}
