use tokio::net::TcpStream;

use crate::error::CommunicationError;
use crate::protocol::{Address, ConnectionType, write_handshake};

/// Host used when none is configured.
const DEFAULT_HOST: &str = "localhost";

/// Where and as what to connect. Two connectors are equal when they would
/// open equivalent connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connector {
    host: String,
    port: u16,
    connection_type: ConnectionType,
}

impl Connector {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, connection_type: ConnectionType) -> Self {
        Self {
            host: host.into(),
            port,
            connection_type,
        }
    }

    #[must_use]
    pub const fn connection_type(&self) -> ConnectionType {
        self.connection_type
    }

    #[must_use]
    pub fn host(&self) -> &str {
        if self.host.is_empty() {
            DEFAULT_HOST
        } else {
            &self.host
        }
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host(), self.port)
    }

    /// Opens a connection and performs the handshake.
    ///
    /// # Errors
    ///
    /// Returns [`CommunicationError::Connect`] when the peer cannot be
    /// reached, or an error from writing the handshake.
    pub async fn connect(&self, address: Option<&Address>) -> Result<TcpStream, CommunicationError> {
        let mut stream = TcpStream::connect((self.host(), self.port))
            .await
            .map_err(|source| CommunicationError::Connect {
                addr: self.endpoint(),
                source,
            })?;
        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY on {}: {}", self.endpoint(), err);
        }
        write_handshake(&mut stream, self.connection_type, address).await?;
        Ok(stream)
    }
}
