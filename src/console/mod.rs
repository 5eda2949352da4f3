//! Console side of a distributed run: accepts agent, worker and console
//! client connections, records their process reports and broadcasts
//! control commands to the agents.
mod command;
mod registry;

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::communication::{
    Acceptor, AcceptorListener, FanOutServerSender, MessageDispatchRegistry, MessageDispatchSender,
    Receiver, Sender, ServerReceiver,
};
use crate::error::{CommunicationError, ConsoleError};
use crate::protocol::{
    CacheHighWaterMark, ConnectionIdentity, ConnectionType, DEFAULT_CONSOLE_PORT, DistributeFile,
    Message, StartWorkers, current_time_ms,
};
use crate::shutdown::ShutdownReceiver;

pub use command::{ConsoleCommand, HELP};
pub use registry::ProcessRegistry;

#[derive(Debug, Clone)]
pub struct ConsoleConfig {
    /// Interface to listen on; empty for all interfaces.
    pub host: String,
    pub port: u16,
    pub accept_tasks: usize,
    pub receiver_tasks: usize,
    pub idle_poll_delay: Duration,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_CONSOLE_PORT,
            accept_tasks: 1,
            receiver_tasks: 5,
            idle_poll_delay: Duration::from_millis(500),
        }
    }
}

struct ConnectionLogger;

impl AcceptorListener for ConnectionLogger {
    fn connection_accepted(&self, connection_type: ConnectionType, identity: ConnectionIdentity) {
        info!("{} connected from {}", connection_type, identity);
    }

    fn connection_closed(&self, connection_type: ConnectionType, identity: ConnectionIdentity) {
        info!("{} at {} disconnected", connection_type, identity);
    }
}

struct UnhandledMessages;

#[async_trait]
impl Sender for UnhandledMessages {
    async fn send(&self, message: Message) -> Result<(), CommunicationError> {
        debug!("Console ignoring {}", message.kind());
        Ok(())
    }

    async fn shutdown(&self) {}
}

async fn log_connection_problems(acceptor: Acceptor) {
    while let Some(problem) = acceptor.pending_exception(true).await {
        warn!("Connection problem: {}", problem);
    }
}

/// Handles received messages one at a time. A failure on one connection is
/// logged and the loop carries on with the others.
async fn handle_messages(receiver: ServerReceiver, dispatch: Arc<MessageDispatchSender>) {
    loop {
        let message = match receiver.wait_for_message().await {
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(err) => {
                warn!("Failed to receive message: {}", err);
                continue;
            }
        };
        if let Err(err) = dispatch.send(message).await {
            warn!("Failed to handle message: {}", err);
        }
    }
    dispatch.shutdown().await;
    debug!("console message loop finished");
}

/// A running console service.
pub struct Console {
    acceptor: Acceptor,
    receiver: ServerReceiver,
    messages: JoinHandle<()>,
    broadcast: FanOutServerSender,
    registry: Arc<ProcessRegistry>,
    problems: JoinHandle<()>,
    cache_id: String,
}

impl Console {
    /// Binds the console port and starts receiving.
    ///
    /// # Errors
    ///
    /// Returns an error when the port cannot be bound.
    pub async fn start(config: &ConsoleConfig) -> Result<Self, CommunicationError> {
        let acceptor = Acceptor::bind(&config.host, config.port, config.accept_tasks).await?;
        for connection_type in ConnectionType::ALL {
            acceptor.add_listener(connection_type, Arc::new(ConnectionLogger));
        }

        let receiver = ServerReceiver::new();
        receiver.receive_from(
            &acceptor,
            &ConnectionType::ALL,
            config.receiver_tasks,
            config.idle_poll_delay,
        )?;

        let registry = Arc::new(ProcessRegistry::new());
        let dispatch = Arc::new(MessageDispatchSender::new());
        registry.register_message_handlers(dispatch.as_ref());
        dispatch.add_fallback(Arc::new(UnhandledMessages));

        Ok(Self {
            messages: tokio::spawn(handle_messages(receiver.clone(), dispatch)),
            problems: tokio::spawn(log_connection_problems(acceptor.clone())),
            broadcast: FanOutServerSender::new(acceptor.clone(), ConnectionType::Agent),
            acceptor,
            receiver,
            registry,
            cache_id: format!("console-{}-{}", std::process::id(), current_time_ms()),
        })
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.acceptor.port()
    }

    #[must_use]
    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    #[must_use]
    pub fn number_of_connections(&self) -> usize {
        self.acceptor.number_of_connections()
    }

    /// Carries out one command. Returns `false` once the console should
    /// quit.
    ///
    /// # Errors
    ///
    /// Returns an error when a file cannot be read or a broadcast fails.
    pub async fn execute(&self, command: ConsoleCommand) -> Result<bool, ConsoleError> {
        match command {
            ConsoleCommand::Start(properties) => {
                info!("starting workers");
                self.broadcast
                    .send(Message::StartWorkers(StartWorkers {
                        properties,
                        agent_number: None,
                    }))
                    .await?;
            }
            ConsoleCommand::Stop => {
                info!("stopping workers");
                self.broadcast.send(Message::StopWorkers).await?;
            }
            ConsoleCommand::Reset => {
                info!("resetting workers");
                self.broadcast.send(Message::ResetWorkers).await?;
            }
            ConsoleCommand::ClearCache => {
                info!("clearing agent file stores");
                self.broadcast.send(Message::ClearCache).await?;
            }
            ConsoleCommand::Distribute { local, remote } => {
                let contents =
                    tokio::fs::read(&local)
                        .await
                        .map_err(|source| ConsoleError::ReadFile {
                            path: local.clone(),
                            source,
                        })?;
                let remote = remote.unwrap_or_else(|| {
                    local
                        .file_name()
                        .map_or_else(String::new, |name| name.to_string_lossy().into_owned())
                });
                info!("distributing {} as {}", local.display(), remote);
                self.broadcast
                    .send(Message::DistributeFile(DistributeFile::new(remote, &contents)))
                    .await?;
                self.broadcast
                    .send(Message::DistributionCacheCheckpoint {
                        cache_high_water_mark: CacheHighWaterMark::new(
                            self.cache_id.clone(),
                            current_time_ms(),
                        ),
                    })
                    .await?;
            }
            ConsoleCommand::Status => self.log_status(),
            ConsoleCommand::Help => info!("\n{}", HELP),
            ConsoleCommand::Quit => return Ok(false),
        }
        Ok(true)
    }

    fn log_status(&self) {
        let agents = self.registry.agents();
        let workers = self.registry.workers();
        info!(
            "{} connection(s), {} agent(s), {} worker(s)",
            self.number_of_connections(),
            agents.len(),
            workers.len()
        );
        for agent in agents {
            info!(
                "  agent {} {:?} (cache {})",
                agent.identity.name(),
                agent.state,
                agent.cache_high_water_mark.cache_id()
            );
        }
        for worker in workers {
            info!("  worker {} {:?}", worker.identity.name(), worker.state);
        }
    }

    /// Reads commands line by line until `quit`, end of input or a
    /// shutdown signal.
    ///
    /// # Errors
    ///
    /// Returns an error when the input cannot be read.
    pub async fn run_commands<R>(
        &self,
        input: R,
        mut shutdown_rx: ShutdownReceiver,
    ) -> Result<(), ConsoleError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = input.lines();
        loop {
            let line = tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("shutdown requested");
                    return Ok(());
                }
                line = lines.next_line() => line.map_err(|err| {
                    ConsoleError::Communication(CommunicationError::io("read console input", err))
                })?,
            };
            let Some(line) = line else {
                info!("console input closed");
                return Ok(());
            };

            let command = match ConsoleCommand::parse(&line) {
                Ok(Some(command)) => command,
                Ok(None) => continue,
                Err(err) => {
                    warn!("{}", err);
                    continue;
                }
            };
            match self.execute(command).await {
                Ok(true) => {}
                Ok(false) => return Ok(()),
                Err(err) => error!("{}", err),
            }
        }
    }

    /// Tells connected agents to stop, then closes every connection.
    pub async fn shutdown(self) {
        if let Err(err) = self.broadcast.send(Message::StopWorkers).await {
            debug!("Failed to stop agents: {}", err);
        }
        if let Err(err) = self.broadcast.send(Message::CloseCommunication).await {
            debug!("Failed to close agent connections: {}", err);
        }
        self.acceptor.shutdown();
        self.receiver.shutdown().await;
        if let Err(err) = self.messages.await {
            debug!("Console message loop ended abnormally: {}", err);
        }
        if let Err(err) = self.problems.await {
            debug!("Connection problem logger ended abnormally: {}", err);
        }
        info!("console shut down");
    }
}
