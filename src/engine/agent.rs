use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::communication::{
    ClientReceiver, ClientSender, Connector, FanOutStreamSender, IgnoreShutdownSender,
    MessageDispatchRegistry, MessageDispatchSender, MessagePump, Sender, TeeSender,
};
use crate::error::{ConfigError, EngineError};
use crate::protocol::{
    Address, AgentIdentity, AgentProcessReport, ConnectionType, ConsoleEndpoint,
    DEFAULT_CONSOLE_PORT, Message, ProcessState, StartWorkers,
};

use super::console_listener::{ConsoleListener, Signals};
use super::file_store::FileStore;
use super::launcher::WorkerLauncher;
use super::process_worker::{ProcessWorkerFactory, WorkerCommandLine, WorkerPlan};
use super::task_worker::InProcessWorkerFactory;
use super::worker::{OutputRedirect, WorkerFactory};

/// Start message properties that override the agent's worker plan.
pub const PROCESSES_PROPERTY: &str = "agent.processes";
pub const INITIAL_PROCESSES_PROPERTY: &str = "agent.initial_processes";
pub const PROCESS_INCREMENT_PROPERTY: &str = "agent.process_increment";
pub const PROCESS_INCREMENT_INTERVAL_PROPERTY: &str = "agent.process_increment_interval_ms";

/// Worker property naming the synchronised file store directory.
pub const FILE_STORE_PROPERTY: &str = "agent.file_store_directory";

/// Shortest period accepted for ramp-up and report timers.
const MIN_TIMER_PERIOD: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub name: String,
    pub use_console: bool,
    pub console_host: String,
    pub console_port: u16,
    /// Run with the local plan when the console cannot be reached.
    pub proceed_without_console: bool,
    pub processes: usize,
    /// Workers started before the first ramp-up step. Defaults to the
    /// increment.
    pub initial_processes: Option<usize>,
    /// Zero starts every worker at once.
    pub process_increment: usize,
    pub process_increment_interval: Duration,
    /// How long workers get to end on their own after a console signal.
    pub shutdown_deadline: Duration,
    pub report_interval: Duration,
    /// Run workers as tasks inside the agent.
    pub single_process: bool,
    /// Program and arguments for worker processes; empty runs this
    /// executable's `worker` subcommand.
    pub worker_command: Vec<String>,
    pub worker_output: OutputRedirect,
    /// Defaults to `./<name>-file-store`.
    pub file_store_dir: Option<PathBuf>,
    /// Passed to every worker.
    pub properties: BTreeMap<String, String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "agent".to_owned(),
            use_console: true,
            console_host: "localhost".to_owned(),
            console_port: DEFAULT_CONSOLE_PORT,
            proceed_without_console: false,
            processes: 1,
            initial_processes: None,
            process_increment: 0,
            process_increment_interval: Duration::from_secs(60),
            shutdown_deadline: Duration::from_secs(20),
            report_interval: Duration::from_secs(1),
            single_process: false,
            worker_command: Vec::new(),
            worker_output: OutputRedirect::Inherit,
            file_store_dir: None,
            properties: BTreeMap::new(),
        }
    }
}

impl AgentConfig {
    fn connector(&self) -> Connector {
        Connector::new(
            self.console_host.clone(),
            self.console_port,
            ConnectionType::Agent,
        )
    }

    fn file_store_dir(&self) -> PathBuf {
        self.file_store_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("{}-file-store", self.name)))
    }
}

/// Worker plan for one run: the configured plan with any start message
/// overrides applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct RunSettings {
    pub(super) processes: usize,
    pub(super) initial_processes: Option<usize>,
    pub(super) process_increment: usize,
    pub(super) process_increment_interval: Duration,
    pub(super) properties: BTreeMap<String, String>,
}

fn parse_override<T: FromStr>(key: &str, value: &str) -> Option<T> {
    let parsed = value.trim().parse().ok();
    if parsed.is_none() {
        warn!(
            "Ignoring start property: {}",
            ConfigError::InvalidProperty {
                key: key.to_owned(),
                value: value.to_owned(),
            }
        );
    }
    parsed
}

impl RunSettings {
    pub(super) fn resolve(config: &AgentConfig, start: Option<&StartWorkers>) -> Self {
        let mut settings = Self {
            processes: config.processes,
            initial_processes: config.initial_processes,
            process_increment: config.process_increment,
            process_increment_interval: config.process_increment_interval,
            properties: config.properties.clone(),
        };
        let Some(start) = start else {
            return settings;
        };

        for (key, value) in &start.properties {
            match key.as_str() {
                PROCESSES_PROPERTY => {
                    if let Some(processes) = parse_override(key, value) {
                        settings.processes = processes;
                    }
                }
                INITIAL_PROCESSES_PROPERTY => {
                    if let Some(initial) = parse_override(key, value) {
                        settings.initial_processes = Some(initial);
                    }
                }
                PROCESS_INCREMENT_PROPERTY => {
                    if let Some(increment) = parse_override(key, value) {
                        settings.process_increment = increment;
                    }
                }
                PROCESS_INCREMENT_INTERVAL_PROPERTY => {
                    if let Some(millis) = parse_override(key, value) {
                        settings.process_increment_interval = Duration::from_millis(millis);
                    }
                }
                _ => {
                    settings.properties.insert(key.clone(), value.clone());
                }
            }
        }
        settings
    }
}

fn ticker(period: Duration) -> Interval {
    let mut ticker = tokio::time::interval(period.max(MIN_TIMER_PERIOD));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

fn agent_report(identity: AgentIdentity, state: ProcessState, file_store: &FileStore) -> Message {
    Message::AgentProcessReport(Box::new(AgentProcessReport {
        identity,
        state,
        cache_high_water_mark: file_store.cache_high_water_mark(),
    }))
}

async fn report_running(
    sender: Arc<ClientSender>,
    identity: watch::Receiver<AgentIdentity>,
    file_store: Arc<FileStore>,
    period: Duration,
) {
    let mut interval = ticker(period);
    interval.tick().await;
    loop {
        interval.tick().await;
        let current = identity.borrow().clone();
        let report = agent_report(current, ProcessState::Running, &file_store);
        if let Err(err) = sender.send(report).await {
            debug!("Stopped reporting to the console: {}", err);
            break;
        }
    }
}

/// The agent's link to the console: a pump feeding console messages to
/// the file store, the console listener and the workers, plus a periodic
/// process report.
struct ConsoleCommunication {
    sender: Arc<ClientSender>,
    pump: MessagePump,
    reporter: JoinHandle<()>,
    file_store: Arc<FileStore>,
}

impl ConsoleCommunication {
    async fn connect(
        connector: &Connector,
        identity: &watch::Sender<AgentIdentity>,
        report_interval: Duration,
        file_store: Arc<FileStore>,
        listener: &Arc<ConsoleListener>,
        fan_out: &Arc<FanOutStreamSender>,
    ) -> Result<Self, EngineError> {
        let current = identity.borrow().clone();
        let address = Address::Agent {
            identity: current.clone(),
        };
        let receiver = ClientReceiver::connect(connector, Some(&address)).await?;
        let sender = Arc::new(ClientSender::from_receiver(&receiver));
        sender
            .send(agent_report(current, ProcessState::Started, &file_store))
            .await?;

        let signals = Arc::new(MessageDispatchSender::new());
        listener.register_message_handlers(signals.as_ref());

        let dispatch = Arc::new(MessageDispatchSender::new());
        file_store.register_message_handlers(dispatch.as_ref());
        dispatch.add_fallback(Arc::new(TeeSender::new(
            signals,
            Arc::new(IgnoreShutdownSender::new(Arc::clone(fan_out) as Arc<dyn Sender>)),
        )));

        let pump = MessagePump::new(Arc::new(receiver), dispatch, 1);
        pump.start();

        let reporter = tokio::spawn(report_running(
            Arc::clone(&sender),
            identity.subscribe(),
            Arc::clone(&file_store),
            report_interval,
        ));

        Ok(Self {
            sender,
            pump,
            reporter,
            file_store,
        })
    }

    async fn shutdown(self, identity: AgentIdentity) {
        self.reporter.abort();
        let report = agent_report(identity, ProcessState::Finished, &self.file_store);
        if let Err(err) = self.sender.send(report).await {
            debug!("Failed to send final report: {}", err);
        }
        Sender::shutdown(self.sender.as_ref()).await;
        self.pump.shutdown().await;
    }
}

/// Stops a running [`Agent`] from another task.
#[derive(Clone)]
pub struct AgentShutdown {
    listener: Arc<ConsoleListener>,
    fan_out: Arc<FanOutStreamSender>,
}

impl AgentShutdown {
    /// Closes worker input streams and raises a shutdown signal.
    pub async fn shutdown(&self) {
        self.fan_out.shutdown().await;
        self.listener.shutdown();
    }
}

/// Runs workers according to its configuration, under the direction of the
/// console when one is in use.
pub struct Agent {
    config: AgentConfig,
    identity: watch::Sender<AgentIdentity>,
    events: Arc<Notify>,
    listener: Arc<ConsoleListener>,
    fan_out: Arc<FanOutStreamSender>,
    file_store: Option<Arc<FileStore>>,
}

impl Agent {
    #[must_use]
    pub fn new(config: AgentConfig) -> Self {
        let events = Arc::new(Notify::new());
        let (identity, _) = watch::channel(AgentIdentity::new(config.name.clone()));
        Self {
            listener: Arc::new(ConsoleListener::new(Arc::clone(&events))),
            config,
            identity,
            events,
            fan_out: Arc::new(FanOutStreamSender::new()),
            file_store: None,
        }
    }

    #[must_use]
    pub fn identity(&self) -> AgentIdentity {
        self.identity.borrow().clone()
    }

    #[must_use]
    pub fn shutdown_handle(&self) -> AgentShutdown {
        AgentShutdown {
            listener: Arc::clone(&self.listener),
            fan_out: Arc::clone(&self.fan_out),
        }
    }

    /// Runs until the console says stop or shuts down, or, without a
    /// console, until one run of workers has ended.
    ///
    /// # Errors
    ///
    /// Returns an error when the console is required but unreachable, or
    /// when workers cannot be started.
    pub async fn run(&mut self) -> Result<(), EngineError> {
        let mut console = None;
        let result = self.run_loop(&mut console).await;
        if let Some(console) = console {
            console.shutdown(self.identity()).await;
        }
        self.listener.discard_messages(Signals::ANY);
        info!("agent {} finished", self.config.name);
        result
    }

    async fn run_loop(
        &mut self,
        console: &mut Option<ConsoleCommunication>,
    ) -> Result<(), EngineError> {
        let mut start: Option<StartWorkers> = None;
        loop {
            let settings = RunSettings::resolve(&self.config, start.as_ref());

            if console.is_none() && self.config.use_console {
                *console = self.connect_to_console().await?;
            }

            if console.is_some() && start.is_none() {
                info!("waiting for console signal");
                self.listener.wait_for_message().await;
                if self.listener.received(Signals::START) {
                    start = self.listener.last_start_message();
                    continue;
                }
            } else {
                let number = start.as_ref().and_then(|start| start.agent_number);
                self.identity
                    .send_modify(|identity| identity.set_number(number));
                self.run_workers(&settings, console.is_some()).await?;
            }

            if console.is_none() {
                return Ok(());
            }

            self.listener.discard_messages(Signals::START);
            if !self.listener.received(Signals::ANY) {
                info!("finished, waiting for console signal");
                self.listener.wait_for_message().await;
            }

            if self.listener.received(Signals::START) {
                start = self.listener.last_start_message();
            } else if self.listener.received(Signals::STOP | Signals::SHUTDOWN) {
                return Ok(());
            } else {
                start = None;
            }
        }
    }

    async fn file_store(&mut self) -> Result<Arc<FileStore>, EngineError> {
        if let Some(store) = &self.file_store {
            return Ok(Arc::clone(store));
        }
        let store = Arc::new(FileStore::open(&self.config.file_store_dir()).await?);
        self.file_store = Some(Arc::clone(&store));
        Ok(store)
    }

    async fn open_console(
        &mut self,
        connector: &Connector,
    ) -> Result<ConsoleCommunication, EngineError> {
        let file_store = self.file_store().await?;
        ConsoleCommunication::connect(
            connector,
            &self.identity,
            self.config.report_interval,
            file_store,
            &self.listener,
            &self.fan_out,
        )
        .await
    }

    async fn connect_to_console(&mut self) -> Result<Option<ConsoleCommunication>, EngineError> {
        let connector = self.config.connector();
        let connected = self.open_console(&connector).await;

        match connected {
            Ok(console) => {
                info!("connected to console at {}", connector.endpoint());
                Ok(Some(console))
            }
            Err(err) if self.config.proceed_without_console => {
                error!(
                    "Failed to connect to the console at {}: {}",
                    connector.endpoint(),
                    err
                );
                warn!("proceeding without the console");
                Ok(None)
            }
            Err(err) => {
                error!(
                    "Failed to connect to the console at {}: {}",
                    connector.endpoint(),
                    err
                );
                Err(err)
            }
        }
    }

    fn worker_factory(&self, plan: WorkerPlan) -> Result<Arc<dyn WorkerFactory>, EngineError> {
        if self.config.single_process {
            info!("running workers as tasks inside the agent");
            return Ok(Arc::new(InProcessWorkerFactory::new(
                plan,
                Arc::clone(&self.fan_out),
            )));
        }
        let command_line = WorkerCommandLine::from_configured(&self.config.worker_command)?;
        info!("worker process command line: {}", command_line);
        Ok(Arc::new(ProcessWorkerFactory::new(
            command_line,
            plan,
            Arc::clone(&self.fan_out),
        )))
    }

    async fn run_workers(
        &self,
        settings: &RunSettings,
        console_connected: bool,
    ) -> Result<(), EngineError> {
        let mut properties = settings.properties.clone();
        if console_connected && let Some(store) = &self.file_store {
            let directory = store.directory().await?;
            properties.insert(
                FILE_STORE_PROPERTY.to_owned(),
                directory.to_string_lossy().into_owned(),
            );
        }
        let plan = WorkerPlan {
            agent: self.identity(),
            console: console_connected.then(|| ConsoleEndpoint {
                host: self.config.console_host.clone(),
                port: self.config.console_port,
            }),
            properties,
        };

        let launcher = Arc::new(WorkerLauncher::new(
            settings.processes,
            self.worker_factory(plan)?,
            Arc::clone(&self.events),
            self.config.worker_output,
        ));

        let ramp_up = match start_workers(&launcher, settings) {
            Ok(ramp_up) => ramp_up,
            Err(err) => {
                error!("Failed to start workers: {}", err);
                launcher.destroy_all_workers();
                launcher.shutdown().await;
                return Err(err);
            }
        };

        self.wait_for_workers(&launcher).await;
        if let Some(ramp_up) = ramp_up {
            ramp_up.abort();
        }
        launcher.shutdown().await;
        Ok(())
    }

    /// Waits for every worker to end. After a console signal no more
    /// workers start, and any still running at the shutdown deadline are
    /// destroyed.
    async fn wait_for_workers(&self, launcher: &WorkerLauncher) {
        let deadline = self.config.shutdown_deadline;
        let mut signalled_at: Option<Instant> = None;
        let mut destroyed = false;

        loop {
            let notified = self.events.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if launcher.all_finished() {
                return;
            }

            if signalled_at.is_none()
                && self
                    .listener
                    .check_for_message(Signals::ANY.without(Signals::START))
            {
                launcher.dont_start_any_more();
                signalled_at = Some(Instant::now());
            }

            let mut wait = deadline;
            if let Some(signalled_at) = signalled_at
                && !destroyed
            {
                let elapsed = signalled_at.elapsed();
                if elapsed >= deadline {
                    info!("forcibly terminating unresponsive workers");
                    launcher.destroy_all_workers();
                    destroyed = true;
                } else {
                    wait = deadline.saturating_sub(elapsed);
                }
            }

            if tokio::time::timeout(wait, notified).await.is_err() {
                debug!("still waiting for workers to finish");
            }
        }
    }
}

/// Starts the first batch of workers. Returns the ramp-up task when more
/// remain to be started.
fn start_workers(
    launcher: &Arc<WorkerLauncher>,
    settings: &RunSettings,
) -> Result<Option<JoinHandle<()>>, EngineError> {
    if settings.process_increment == 0 {
        info!("starting {} worker(s)", settings.processes);
        launcher.start_all_workers()?;
        return Ok(None);
    }

    let initial = settings
        .initial_processes
        .unwrap_or(settings.process_increment);
    info!(
        "ramping up {} worker(s): {} now, {} every {:?}",
        settings.processes, initial, settings.process_increment, settings.process_increment_interval
    );
    if !launcher.start_some_workers(initial)? {
        return Ok(None);
    }
    Ok(Some(tokio::spawn(ramp_up(
        Arc::clone(launcher),
        settings.process_increment,
        settings.process_increment_interval,
    ))))
}

async fn ramp_up(launcher: Arc<WorkerLauncher>, increment: usize, period: Duration) {
    let mut interval = ticker(period);
    interval.tick().await;
    loop {
        interval.tick().await;
        match launcher.start_some_workers(increment) {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => {
                error!("Failed to start more workers: {}", err);
                break;
            }
        }
    }
}
