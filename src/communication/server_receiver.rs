use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::CommunicationError;
use crate::protocol::{ConnectionType, Message};

use super::acceptor::Acceptor;
use super::queue::MessageQueue;
use super::resource_pool::{Reservation, Resource, ResourcePool};
use super::sender::{Receiver, Sender};
use super::socket::SocketWrapper;

/// Round-robin view over several pools. The shared cursor advances once
/// per reservation attempt, whichever pool ends up answering.
struct CombinedResourcePool<R: Resource> {
    pools: Vec<ResourcePool<R>>,
    next: AtomicUsize,
}

impl<R: Resource> CombinedResourcePool<R> {
    const fn new(pools: Vec<ResourcePool<R>>) -> Self {
        Self {
            pools,
            next: AtomicUsize::new(0),
        }
    }

    fn reserve_next(&self) -> Reservation<R> {
        let len = self.pools.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed);

        for offset in 0..len {
            let index = start.wrapping_add(offset).checked_rem(len).unwrap_or(0);
            if let Some(pool) = self.pools.get(index) {
                let reservation = pool.reserve_next();
                if !reservation.is_sentinel() {
                    return reservation;
                }
            }
        }

        Reservation::sentinel()
    }
}

struct ReceiverInner {
    queue: MessageQueue,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: AtomicBool,
}

/// Merges messages from many accepted sockets into one stream.
#[derive(Clone)]
pub struct ServerReceiver {
    inner: Arc<ReceiverInner>,
}

impl Default for ServerReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerReceiver {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ReceiverInner {
                queue: MessageQueue::new(true),
                tasks: Mutex::new(Vec::new()),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Starts `threads` poll tasks reading from `acceptor`'s connections of
    /// the given types. An idle task sleeps `idle_poll_delay` only after two
    /// idle passes in a row.
    ///
    /// # Errors
    ///
    /// Returns a shutdown error if this receiver or the acceptor has been
    /// shut down.
    pub fn receive_from(
        &self,
        acceptor: &Acceptor,
        connection_types: &[ConnectionType],
        threads: usize,
        idle_poll_delay: Duration,
    ) -> Result<(), CommunicationError> {
        let pools = connection_types
            .iter()
            .map(|connection_type| acceptor.socket_set(*connection_type))
            .collect::<Result<Vec<_>, _>>()?;
        let sockets = Arc::new(CombinedResourcePool::new(pools));

        let mut tasks = self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(CommunicationError::Shutdown {
                component: "server receiver",
            });
        }
        for _ in 0..threads.max(1) {
            tasks.push(tokio::spawn(poll_loop(
                Arc::clone(&self.inner),
                Arc::clone(&sockets),
                idle_poll_delay,
            )));
        }
        info!(
            "Receiving from {} connection type(s) with {} task(s)",
            connection_types.len(),
            threads.max(1)
        );
        Ok(())
    }
}

#[async_trait]
impl Receiver for ServerReceiver {
    async fn wait_for_message(&self) -> Result<Option<Message>, CommunicationError> {
        match self.inner.queue.dequeue().await {
            Ok(message) => Ok(Some(message)),
            Err(err) if err.is_shutdown() => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn shutdown(&self) {
        let tasks = {
            let mut tasks = self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            if self.inner.shutdown.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *tasks)
        };
        self.inner.queue.shutdown();
        for task in tasks {
            task.abort();
        }
    }
}

async fn poll_loop(
    inner: Arc<ReceiverInner>,
    sockets: Arc<CombinedResourcePool<SocketWrapper>>,
    idle_poll_delay: Duration,
) {
    let mut previous_idle = false;

    while !inner.shutdown.load(Ordering::Acquire) {
        let idle = match poll_once(&inner, &sockets) {
            Ok(idle) => idle,
            Err(err) => {
                debug!("Poll task stopping: {}", err);
                break;
            }
        };

        if idle && previous_idle {
            tokio::time::sleep(idle_poll_delay).await;
        } else {
            tokio::task::yield_now().await;
        }
        previous_idle = idle;
    }
}

/// One poll iteration. `Ok(true)` means nothing was read; an error means the
/// shared queue has been shut down.
fn poll_once(
    inner: &ReceiverInner,
    sockets: &CombinedResourcePool<SocketWrapper>,
) -> Result<bool, CommunicationError> {
    let reservation = sockets.reserve_next();
    let Some(socket) = reservation.resource().cloned() else {
        return Ok(true);
    };

    match socket.try_receive() {
        Ok(None) => {
            reservation.free();
            Ok(true)
        }
        Ok(Some(Message::CloseCommunication)) => {
            debug!("Received close communication from {}", socket.identity());
            reservation.close();
            Ok(false)
        }
        Ok(Some(Message::RequiringResponse(request))) => {
            // The response sender now owns the reservation and frees it once
            // the reply is written.
            request.set_responder(Arc::new(ReservationSender {
                reservation,
            }));
            inner.queue.queue(Message::RequiringResponse(request))?;
            Ok(false)
        }
        Ok(Some(message)) => {
            let queued = inner.queue.queue(message);
            reservation.free();
            queued.map(|()| false)
        }
        Err(err) => {
            debug!("Closing {} after read failure: {}", socket.identity(), err);
            reservation.close();
            inner.queue.queue_error(err)?;
            Ok(false)
        }
    }
}

/// Writes one response back over the reserved socket, then frees it.
struct ReservationSender {
    reservation: Reservation<SocketWrapper>,
}

#[async_trait]
impl Sender for ReservationSender {
    async fn send(&self, message: Message) -> Result<(), CommunicationError> {
        let Some(socket) = self.reservation.resource() else {
            return Err(CommunicationError::ConnectionClosed);
        };
        match socket.write_message(message).await {
            Ok(()) => {
                self.reservation.free();
                Ok(())
            }
            Err(err) => {
                self.reservation.close();
                Err(err)
            }
        }
    }

    async fn shutdown(&self) {
        self.reservation.free();
    }
}
