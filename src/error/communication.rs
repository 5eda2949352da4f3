use std::net::SocketAddr;

use thiserror::Error;

type BoxedCause = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum CommunicationError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("I/O error during {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("Interrupted during {context}.")]
    Interrupted { context: &'static str },
    #[error("{component} has been shut down.")]
    Shutdown { component: &'static str },
    #[error("Unknown connection type {value}.")]
    UnknownConnectionType { value: u8 },
    #[error("Timed out waiting for handshake from {peer}.")]
    HandshakeTimeout { peer: SocketAddr },
    #[error("Frame of {len} bytes exceeds the {max_bytes} byte limit.")]
    FrameTooLarge { len: usize, max_bytes: usize },
    #[error("Connection closed.")]
    ConnectionClosed,
    #[error("Serialization error during {context}: {source}")]
    Serialize {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("Deserialization error during {context}: {source}")]
    Deserialize {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("A response has already been sent for this request.")]
    ResponseAlreadySent,
    #[error("No responder is bound to this request.")]
    NoResponder,
    #[error("Peer answered with no response.")]
    NoResponse,
    #[error("This queue does not pass errors.")]
    QueueRejectsErrors,
    #[error("{message}")]
    Failure {
        message: String,
        #[source]
        source: Option<BoxedCause>,
    },
    #[cfg(test)]
    #[error("Test expectation failed: {message}")]
    TestExpectation { message: &'static str },
    #[cfg(test)]
    #[error("Test expectation failed: {message}: {value}")]
    TestExpectationValue {
        message: &'static str,
        value: String,
    },
}

impl CommunicationError {
    /// Normalises an I/O error; interruption gets its own variant so shutdown
    /// paths never look like network failures.
    #[must_use]
    pub fn io(context: &'static str, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::Interrupted {
            return Self::Interrupted { context };
        }
        Self::Io { context, source }
    }

    pub fn failure<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Failure {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    #[must_use]
    pub const fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown { .. } | Self::Interrupted { .. })
    }
}
