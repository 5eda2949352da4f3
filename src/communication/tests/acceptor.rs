use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::communication::{Acceptor, AcceptorListener, Connector, ResourcePool, SocketWrapper};
use crate::error::{AppError, AppResult, CommunicationError};
use crate::protocol::{Address, AgentIdentity, ConnectDetails, ConnectionIdentity, ConnectionType};

use super::{run_socket_test, wait_until};

const LOOPBACK: &str = "127.0.0.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Accepted(ConnectionType, ConnectionIdentity),
    Closed(ConnectionType, ConnectionIdentity),
}

#[derive(Default)]
struct RecordingListener {
    events: Mutex<Vec<Event>>,
}

impl RecordingListener {
    fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn push(&self, event: Event) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

impl AcceptorListener for RecordingListener {
    fn connection_accepted(&self, connection_type: ConnectionType, identity: ConnectionIdentity) {
        self.push(Event::Accepted(connection_type, identity));
    }

    fn connection_closed(&self, connection_type: ConnectionType, identity: ConnectionIdentity) {
        self.push(Event::Closed(connection_type, identity));
    }
}

/// Reads from every free socket once so end of stream is noticed.
fn poll_sockets(pool: &ResourcePool<SocketWrapper>) {
    for _ in 0..pool.count_active() {
        let reservation = pool.reserve_next();
        if let Some(socket) = reservation.resource()
            && socket.try_receive().is_err()
        {
            reservation.close();
        }
    }
}

#[test]
fn accepted_connection_lands_in_its_pool_and_leaves_on_close() -> AppResult<()> {
    run_socket_test(async {
        let acceptor = Acceptor::bind(LOOPBACK, 0, 2).await?;
        let listener = Arc::new(RecordingListener::default());
        acceptor.add_listener(ConnectionType::Agent, listener.clone());
        let agents = acceptor.socket_set(ConnectionType::Agent)?;
        let workers = acceptor.socket_set(ConnectionType::Worker)?;

        let connector = Connector::new(LOOPBACK, acceptor.port(), ConnectionType::Agent);
        let stream = connector.connect(None).await?;

        wait_until("agent connection", || agents.count_active() == 1).await?;
        if workers.count_active() != 0 {
            return Err(AppError::communication("Connection placed in the wrong pool"));
        }
        let accepted = listener.events();
        let identity = match accepted.as_slice() {
            [Event::Accepted(ConnectionType::Agent, identity)] => *identity,
            other => {
                return Err(AppError::communication(format!(
                    "Expected one accept event, got {:?}",
                    other
                )));
            }
        };

        drop(stream);
        wait_until("agent disconnect", || {
            poll_sockets(&agents);
            agents.count_active() == 0
        })
        .await?;

        if listener.events()
            != vec![
                Event::Accepted(ConnectionType::Agent, identity),
                Event::Closed(ConnectionType::Agent, identity),
            ]
        {
            return Err(AppError::communication(format!(
                "Unexpected listener events {:?}",
                listener.events()
            )));
        }
        acceptor.shutdown();
        Ok(())
    })
}

#[test]
fn every_connection_type_is_discriminated() -> AppResult<()> {
    run_socket_test(async {
        let acceptor = Acceptor::bind(LOOPBACK, 0, 1).await?;
        let agent = Address::Agent {
            identity: AgentIdentity::new("probe"),
        };

        let mut streams = Vec::new();
        for connection_type in ConnectionType::ALL {
            let address = match connection_type {
                ConnectionType::Agent => Some(&agent),
                ConnectionType::Worker | ConnectionType::ConsoleClient => None,
            };
            let connector = Connector::new(LOOPBACK, acceptor.port(), connection_type);
            streams.push(connector.connect(address).await?);
        }

        for connection_type in ConnectionType::ALL {
            let pool = acceptor.socket_set(connection_type)?;
            wait_until("discriminated connection", || pool.count_active() == 1).await?;
            let reservation = pool.reserve_next();
            let Some(socket) = reservation.resource() else {
                return Err(AppError::communication("Pooled socket not reservable"));
            };
            let details = socket.connect_details();
            if details.connection_type() != connection_type {
                return Err(AppError::communication("Socket pooled under the wrong type"));
            }
            let address_matches = match connection_type {
                ConnectionType::Agent => details.address() == Some(&agent),
                ConnectionType::Worker | ConnectionType::ConsoleClient => {
                    details.address().is_none()
                }
            };
            if !address_matches {
                return Err(AppError::communication("Handshake address was not kept"));
            }
        }
        if acceptor.number_of_connections() != ConnectionType::ALL.len() {
            return Err(AppError::communication("Unexpected connection count"));
        }

        acceptor.shutdown();
        Ok(())
    })
}

#[test]
fn unknown_connection_type_is_rejected_and_reported() -> AppResult<()> {
    run_socket_test(async {
        let acceptor = Acceptor::bind(LOOPBACK, 0, 1).await?;
        let mut stream = TcpStream::connect((LOOPBACK, acceptor.port()))
            .await
            .map_err(|err| AppError::communication(format!("connect failed: {}", err)))?;
        stream
            .write_all(&[7, 0, 0, 0, 4])
            .await
            .map_err(|err| AppError::communication(format!("write failed: {}", err)))?;

        let reported = tokio::time::timeout(Duration::from_secs(5), acceptor.pending_exception(true))
            .await
            .map_err(|err| AppError::communication(format!("no failure reported: {}", err)))?;
        match reported {
            Some(CommunicationError::UnknownConnectionType { value: 7 }) => {}
            other => {
                return Err(AppError::communication(format!(
                    "Expected an unknown connection type, got {:?}",
                    other
                )));
            }
        }

        let mut buffer = [0_u8; 8];
        let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buffer))
            .await
            .map_err(|err| AppError::communication(format!("socket left open: {}", err)))?;
        if !matches!(read, Ok(0) | Err(_)) {
            return Err(AppError::communication("Rejected socket carried data"));
        }

        if acceptor.number_of_connections() != 0 {
            return Err(AppError::communication("Rejected socket reached a pool"));
        }
        if acceptor.pending_exception(false).await.is_some() {
            return Err(AppError::communication("Failure reported more than once"));
        }
        acceptor.shutdown();
        Ok(())
    })
}

#[test]
fn shutdown_closes_pools_and_refuses_new_sets() -> AppResult<()> {
    run_socket_test(async {
        let acceptor = Acceptor::bind(LOOPBACK, 0, 1).await?;
        let listener = Arc::new(RecordingListener::default());
        acceptor.add_listener(ConnectionType::Worker, listener.clone());
        let workers = acceptor.socket_set(ConnectionType::Worker)?;

        let connector = Connector::new(LOOPBACK, acceptor.port(), ConnectionType::Worker);
        let mut stream = connector.connect(None).await?;
        wait_until("worker connection", || workers.count_active() == 1).await?;

        acceptor.shutdown();
        acceptor.shutdown();

        if !acceptor.is_shutdown() || workers.count_active() != 0 {
            return Err(AppError::communication("Shutdown left connections pooled"));
        }
        if acceptor.socket_set(ConnectionType::Worker).is_ok() {
            return Err(AppError::communication("Socket set created after shutdown"));
        }
        if acceptor.pending_exception(true).await.is_some() {
            return Err(AppError::communication("Blocking exception wait survived shutdown"));
        }
        let closes = listener
            .events()
            .iter()
            .filter(|event| matches!(event, Event::Closed(..)))
            .count();
        if closes != 1 {
            return Err(AppError::communication(format!(
                "Expected one close event, got {}",
                closes
            )));
        }

        let mut buffer = [0_u8; 8];
        let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buffer))
            .await
            .map_err(|err| AppError::communication(format!("socket left open: {}", err)))?;
        if !matches!(read, Ok(0) | Err(_)) {
            return Err(AppError::communication("Closed socket carried data"));
        }
        Ok(())
    })
}

#[test]
fn socket_accepted_while_shutting_down_is_closed() -> AppResult<()> {
    run_socket_test(async {
        let acceptor = Acceptor::bind(LOOPBACK, 0, 1).await?;
        let listener = Arc::new(RecordingListener::default());
        acceptor.add_listener(ConnectionType::Agent, listener.clone());
        let agents = acceptor.socket_set(ConnectionType::Agent)?;

        let side = TcpListener::bind((LOOPBACK, 0)).await?;
        let mut peer = TcpStream::connect(side.local_addr()?).await?;
        let (stream, address) = side.accept().await?;
        let socket = Arc::new(SocketWrapper::new(
            stream,
            ConnectionIdentity::new(address, 0),
            ConnectDetails::new(ConnectionType::Agent, None),
        ));

        // The pool was handed out before shutdown, the socket arrives after.
        acceptor.shutdown();
        if acceptor.admit(&agents, &socket) {
            return Err(AppError::communication("Socket admitted after shutdown"));
        }
        if !socket.is_closed() || agents.count_active() != 0 {
            return Err(AppError::communication("Late socket left open in the pool"));
        }
        if !matches!(
            listener.events().as_slice(),
            [Event::Accepted(..), Event::Closed(..)]
        ) {
            return Err(AppError::communication(format!(
                "Unexpected listener events {:?}",
                listener.events()
            )));
        }

        let mut buffer = [0_u8; 8];
        let read = tokio::time::timeout(Duration::from_secs(5), peer.read(&mut buffer))
            .await
            .map_err(|err| AppError::communication(format!("socket left open: {}", err)))?;
        if !matches!(read, Ok(0) | Err(_)) {
            return Err(AppError::communication("Closed socket carried data"));
        }
        Ok(())
    })
}
