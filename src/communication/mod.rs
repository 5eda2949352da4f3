//! Connection accepting, pooled sockets, message queues and dispatch.
//!
//! Long-lived loops (accepting, receiving, pumping) run as groups of tokio
//! tasks owned by their component. Shutdown flips a flag, wakes every
//! waiter and aborts or drains the tasks; "shut down while waiting" always
//! surfaces as [`CommunicationError::Shutdown`](crate::error::CommunicationError),
//! never as a logged failure.
mod acceptor;
mod client;
mod connector;
mod dispatch;
mod fan_out;
mod listener;
mod pump;
mod queue;
mod resource_pool;
mod sender;
mod server_receiver;
mod socket;

#[cfg(test)]
mod tests;

pub use acceptor::{Acceptor, AcceptorListener};
pub use client::{ClientReceiver, ClientSender};
pub use connector::Connector;
pub use dispatch::{MessageDispatchRegistry, MessageDispatchSender};
pub use fan_out::{FanOutServerSender, FanOutStreamSender};
pub use listener::ListenerSupport;
pub use pump::MessagePump;
pub use queue::{MessageQueue, ThreadSafeQueue};
pub use resource_pool::{Closeable, Reservation, Resource, ResourcePool, ResourcePoolListener};
pub use sender::{
    BlockingSender, IgnoreShutdownSender, QueuedSenderDecorator, Receiver, Sender, TeeSender,
};
pub use server_receiver::ServerReceiver;
pub use socket::{SocketClosedListener, SocketWrapper};
