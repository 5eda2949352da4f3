//! Wire-level vocabulary shared by the console, agents and workers.
//!
//! Every connection opens with a one-byte [`ConnectionType`] and a framed,
//! optional [`Address`]; afterwards it carries length-delimited JSON
//! [`Message`] frames in order.
mod codec;
mod handshake;
mod request;
mod types;


pub use codec::{JsonFrameCodec, MAX_FRAME_BYTES};
pub use handshake::{
    ConnectDetails, ConnectionType, DEFAULT_CONSOLE_PORT, read_handshake, write_handshake,
};
pub use request::MessageRequiringResponse;
pub use types::{
    Address, AgentIdentity, AgentProcessReport, CacheHighWaterMark, ConnectionIdentity,
    ConsoleEndpoint, DistributeFile, InitialiseWorker, Message, MessageKind, ProcessState,
    StartWorkers, WorkerIdentity, WorkerProcessReport, current_time_ms,
};
