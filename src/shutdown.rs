use std::fmt;

use tokio::sync::broadcast;

/// What asked the process to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownCause {
    Interrupt,
    Terminate,
    /// Raised by the process itself rather than by a signal.
    Requested,
}

impl fmt::Display for ShutdownCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Interrupt => "SIGINT",
            Self::Terminate => "SIGTERM",
            Self::Requested => "shutdown request",
        };
        f.write_str(name)
    }
}

pub type ShutdownSender = broadcast::Sender<ShutdownCause>;
pub type ShutdownReceiver = broadcast::Receiver<ShutdownCause>;
