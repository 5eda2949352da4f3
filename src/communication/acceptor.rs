use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::CommunicationError;
use crate::protocol::{ConnectionIdentity, ConnectionType, read_handshake};

use super::listener::ListenerSupport;
use super::queue::ThreadSafeQueue;
use super::resource_pool::{Closeable, ResourcePool, ResourcePoolListener};
use super::socket::{SocketClosedListener, SocketWrapper};

/// Upper bound on how long a new peer may take to send its handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Told about connections of one [`ConnectionType`] as they come and go.
pub trait AcceptorListener: Send + Sync {
    fn connection_accepted(&self, connection_type: ConnectionType, identity: ConnectionIdentity);
    fn connection_closed(&self, connection_type: ConnectionType, identity: ConnectionIdentity);
}

type AcceptorListeners = ListenerSupport<dyn AcceptorListener>;

struct AcceptorState {
    shutdown: bool,
    pools: HashMap<ConnectionType, ResourcePool<SocketWrapper>>,
    listeners: HashMap<ConnectionType, Arc<AcceptorListeners>>,
    tasks: Vec<JoinHandle<()>>,
}

struct AcceptorInner {
    local_addr: SocketAddr,
    state: Mutex<AcceptorState>,
    exceptions: ThreadSafeQueue<CommunicationError>,
    next_serial: AtomicU64,
}

/// Owns a listening socket and a fixed set of accept tasks. Each new
/// connection is discriminated by its handshake and placed in the resource
/// pool for its connection type.
#[derive(Clone)]
pub struct Acceptor {
    inner: Arc<AcceptorInner>,
}

impl Acceptor {
    /// Binds `address:port` (empty address for all interfaces, port 0 for
    /// any free port) and starts `threads` accept tasks.
    ///
    /// # Errors
    ///
    /// Returns [`CommunicationError::Bind`] when the socket cannot be bound.
    pub async fn bind(address: &str, port: u16, threads: usize) -> Result<Self, CommunicationError> {
        let host = if address.is_empty() { "0.0.0.0" } else { address };
        let addr = format!("{}:{}", host, port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| CommunicationError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| CommunicationError::Bind { addr, source })?;

        let inner = Arc::new(AcceptorInner {
            local_addr,
            state: Mutex::new(AcceptorState {
                shutdown: false,
                pools: HashMap::new(),
                listeners: HashMap::new(),
                tasks: Vec::new(),
            }),
            exceptions: ThreadSafeQueue::new(),
            next_serial: AtomicU64::new(0),
        });

        let listener = Arc::new(listener);
        let tasks: Vec<_> = (0..threads.max(1))
            .map(|_| {
                let acceptor = Self {
                    inner: Arc::clone(&inner),
                };
                tokio::spawn(accept_loop(acceptor, Arc::clone(&listener)))
            })
            .collect();
        {
            let mut state = inner.lock();
            if state.shutdown {
                tasks.iter().for_each(JoinHandle::abort);
            } else {
                state.tasks = tasks;
            }
        }

        info!("Accepting connections on {}", local_addr);
        Ok(Self { inner })
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.inner.local_addr.port()
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// The pool holding connections of `connection_type`, created on first
    /// use.
    ///
    /// # Errors
    ///
    /// Returns [`CommunicationError::Shutdown`] after [`Acceptor::shutdown`].
    pub fn socket_set(
        &self,
        connection_type: ConnectionType,
    ) -> Result<ResourcePool<SocketWrapper>, CommunicationError> {
        self.inner.socket_set(connection_type)
    }

    pub fn add_listener(&self, connection_type: ConnectionType, listener: Arc<dyn AcceptorListener>) {
        let listeners = {
            let mut state = self.inner.lock();
            Arc::clone(state.listeners.entry(connection_type).or_default())
        };
        listeners.add(listener);
    }

    /// Next queued discrimination failure. With `block`, waits for one;
    /// returns `None` once the acceptor is shut down.
    pub async fn pending_exception(&self, block: bool) -> Option<CommunicationError> {
        if block {
            self.inner.exceptions.dequeue().await.ok()
        } else {
            self.inner.exceptions.try_dequeue().ok().flatten()
        }
    }

    #[must_use]
    pub fn number_of_connections(&self) -> usize {
        let pools: Vec<_> = self.inner.lock().pools.values().cloned().collect();
        pools.iter().map(ResourcePool::count_active).sum()
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.lock().shutdown
    }

    /// Stops accepting and closes every pooled connection. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    async fn discriminate(&self, mut stream: TcpStream, peer: SocketAddr) {
        let details = match tokio::time::timeout(HANDSHAKE_TIMEOUT, read_handshake(&mut stream)).await
        {
            Ok(Ok(details)) => details,
            Ok(Err(err)) => {
                self.inner.report(err);
                return;
            }
            Err(_) => {
                self.inner.report(CommunicationError::HandshakeTimeout { peer });
                return;
            }
        };

        let connection_type = details.connection_type();
        let pool = match self.socket_set(connection_type) {
            Ok(pool) => pool,
            Err(err) => {
                debug!("Dropping connection from {}: {}", peer, err);
                return;
            }
        };

        if let Err(err) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer, err);
        }
        let serial = self.inner.next_serial.fetch_add(1, Ordering::Relaxed);
        let identity = ConnectionIdentity::new(peer, serial);
        let socket = Arc::new(SocketWrapper::new(stream, identity, details));
        if self.admit(&pool, &socket) {
            debug!("Accepted {} from {}", connection_type, identity);
        }
    }

    /// Places `socket` in `pool`. Returns false, with the socket closed, when
    /// the acceptor shut down before the socket was pooled.
    #[must_use]
    pub(super) fn admit(
        &self,
        pool: &ResourcePool<SocketWrapper>,
        socket: &Arc<SocketWrapper>,
    ) -> bool {
        let closeable = pool.add(Arc::clone(socket));
        if self.is_shutdown() {
            debug!("Closing {} accepted during shutdown", socket.identity());
            closeable.close();
            return false;
        }
        socket.add_closed_listener(Arc::new(CloseOnSocketClosed { closeable }));
        true
    }
}

impl AcceptorInner {
    fn lock(&self) -> MutexGuard<'_, AcceptorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn socket_set(
        &self,
        connection_type: ConnectionType,
    ) -> Result<ResourcePool<SocketWrapper>, CommunicationError> {
        let mut state = self.lock();
        if state.shutdown {
            return Err(CommunicationError::Shutdown {
                component: "acceptor",
            });
        }
        if let Some(pool) = state.pools.get(&connection_type) {
            return Ok(pool.clone());
        }

        let listeners = Arc::clone(state.listeners.entry(connection_type).or_default());
        let pool = ResourcePool::new();
        pool.add_listener(Arc::new(PoolEvents {
            connection_type,
            listeners,
        }));
        state.pools.insert(connection_type, pool.clone());
        Ok(pool)
    }

    fn shutdown(&self) {
        let (tasks, pools) = {
            let mut state = self.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            let pools: Vec<_> = state.pools.values().cloned().collect();
            (std::mem::take(&mut state.tasks), pools)
        };

        for task in tasks {
            task.abort();
        }
        // Closing resources fires listeners, so no acceptor lock is held here.
        for pool in pools {
            pool.close_current_resources();
        }
        self.exceptions.shutdown();
        info!("Acceptor on {} shut down", self.local_addr);
    }

    fn report(&self, error: CommunicationError) {
        debug!("Connection discrimination failed: {}", error);
        if self.exceptions.queue(error).is_err() {
            debug!("Dropping discrimination failure after shutdown");
        }
    }
}

async fn accept_loop(acceptor: Acceptor, listener: Arc<TcpListener>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => acceptor.discriminate(stream, peer).await,
            Err(err) => {
                if !acceptor.is_shutdown() {
                    warn!("Accept failed on {}: {}", acceptor.local_addr(), err);
                    acceptor.inner.report(CommunicationError::io("accept", err));
                }
                acceptor.shutdown();
                break;
            }
        }
    }
}

struct PoolEvents {
    connection_type: ConnectionType,
    listeners: Arc<AcceptorListeners>,
}

impl ResourcePoolListener<SocketWrapper> for PoolEvents {
    fn resource_added(&self, resource: &Arc<SocketWrapper>) {
        let identity = resource.identity();
        self.listeners
            .apply(|listener| listener.connection_accepted(self.connection_type, identity));
    }

    fn resource_closed(&self, resource: &Arc<SocketWrapper>) {
        let identity = resource.identity();
        self.listeners
            .apply(|listener| listener.connection_closed(self.connection_type, identity));
    }
}

struct CloseOnSocketClosed {
    closeable: Closeable<SocketWrapper>,
}

impl SocketClosedListener for CloseOnSocketClosed {
    fn socket_closed(&self, _identity: ConnectionIdentity) {
        self.closeable.close();
    }
}
