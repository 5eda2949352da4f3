use std::fmt;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Encoder;

use crate::error::CommunicationError;

use super::codec::{JsonFrameCodec, MAX_FRAME_BYTES};
use super::types::Address;

/// Port the console listens on unless configured otherwise.
pub const DEFAULT_CONSOLE_PORT: u16 = 6372;

/// Kind of peer on the other end of a connection. Travels as one byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConnectionType {
    Agent,
    Worker,
    ConsoleClient,
}

impl ConnectionType {
    pub const ALL: [Self; 3] = [Self::Agent, Self::Worker, Self::ConsoleClient];

    #[must_use]
    pub const fn ordinal(self) -> u8 {
        match self {
            Self::Agent => 0,
            Self::Worker => 1,
            Self::ConsoleClient => 2,
        }
    }
}

impl TryFrom<u8> for ConnectionType {
    type Error = CommunicationError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Agent),
            1 => Ok(Self::Worker),
            2 => Ok(Self::ConsoleClient),
            other => Err(CommunicationError::UnknownConnectionType { value: other }),
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Agent => "AGENT",
            Self::Worker => "WORKER",
            Self::ConsoleClient => "CONSOLE_CLIENT",
        };
        write!(f, "{} connection type", name)
    }
}

/// What a peer told us about itself during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectDetails {
    connection_type: ConnectionType,
    address: Option<Address>,
}

impl ConnectDetails {
    #[must_use]
    pub const fn new(connection_type: ConnectionType, address: Option<Address>) -> Self {
        Self {
            connection_type,
            address,
        }
    }

    #[must_use]
    pub const fn connection_type(&self) -> ConnectionType {
        self.connection_type
    }

    #[must_use]
    pub const fn address(&self) -> Option<&Address> {
        self.address.as_ref()
    }
}

/// Writes the connection type byte followed by one address frame.
///
/// # Errors
///
/// Returns an error when the address cannot be encoded or the write fails.
pub async fn write_handshake<W>(
    writer: &mut W,
    connection_type: ConnectionType,
    address: Option<&Address>,
) -> Result<(), CommunicationError>
where
    W: AsyncWrite + Unpin,
{
    let mut buffer = BytesMut::new();
    buffer.extend_from_slice(&[connection_type.ordinal()]);
    JsonFrameCodec::<Option<&Address>>::new()
        .encode(address, &mut buffer)
        .map_err(|err| CommunicationError::io("encode handshake", err))?;
    writer
        .write_all(&buffer)
        .await
        .map_err(|err| CommunicationError::io("write handshake", err))?;
    writer
        .flush()
        .await
        .map_err(|err| CommunicationError::io("flush handshake", err))
}

/// Reads exactly the handshake bytes, leaving any message frames that follow
/// unread on the stream.
///
/// # Errors
///
/// Returns an error for an unknown connection type byte, an oversized or
/// malformed address frame, or an I/O failure.
pub async fn read_handshake<R>(reader: &mut R) -> Result<ConnectDetails, CommunicationError>
where
    R: AsyncRead + Unpin,
{
    let type_byte = reader
        .read_u8()
        .await
        .map_err(|err| CommunicationError::io("read connection type", err))?;
    let connection_type = ConnectionType::try_from(type_byte)?;

    let len = reader
        .read_u32()
        .await
        .map_err(|err| CommunicationError::io("read address length", err))?;
    let len = usize::try_from(len).unwrap_or(usize::MAX);
    if len > MAX_FRAME_BYTES {
        return Err(CommunicationError::FrameTooLarge {
            len,
            max_bytes: MAX_FRAME_BYTES,
        });
    }

    let mut payload = vec![0_u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|err| CommunicationError::io("read address", err))?;
    let address: Option<Address> =
        serde_json::from_slice(&payload).map_err(|source| CommunicationError::Deserialize {
            context: "handshake address",
            source,
        })?;

    Ok(ConnectDetails::new(connection_type, address))
}
