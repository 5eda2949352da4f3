use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, watch};
use tracing::debug;

use crate::communication::FanOutStreamSender;
use crate::error::EngineError;
use crate::protocol::{
    AgentIdentity, ConsoleEndpoint, InitialiseWorker, Message, WorkerIdentity,
};

use super::worker::{OutputRedirect, Worker, WorkerExit, WorkerFactory};

/// Subcommand the worker binary is started with.
const WORKER_SUBCOMMAND: &str = "worker";

/// Program and arguments used to start worker processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommandLine {
    program: PathBuf,
    arguments: Vec<String>,
}

impl WorkerCommandLine {
    #[must_use]
    pub const fn new(program: PathBuf, arguments: Vec<String>) -> Self {
        Self { program, arguments }
    }

    /// This executable run with the `worker` subcommand.
    ///
    /// # Errors
    ///
    /// Returns an error when the current executable cannot be located.
    pub fn current_executable() -> Result<Self, EngineError> {
        let program = std::env::current_exe()
            .map_err(|source| EngineError::CurrentExecutable { source })?;
        Ok(Self::new(program, vec![WORKER_SUBCOMMAND.to_owned()]))
    }

    /// Builds a command line from configuration; an empty list means the
    /// current executable.
    ///
    /// # Errors
    ///
    /// Returns an error when the current executable is needed and cannot be
    /// located.
    pub fn from_configured(command: &[String]) -> Result<Self, EngineError> {
        match command.split_first() {
            Some((program, arguments)) => Ok(Self::new(PathBuf::from(program), arguments.to_vec())),
            None => Self::current_executable(),
        }
    }

    #[must_use]
    pub const fn program(&self) -> &PathBuf {
        &self.program
    }

    #[must_use]
    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.arguments);
        command
    }
}

fn write_quoted(f: &mut fmt::Formatter<'_>, value: &str) -> fmt::Result {
    if value.is_empty() || value.chars().any(char::is_whitespace) {
        write!(f, "\"{}\"", value.replace('"', "\\\""))
    } else {
        f.write_str(value)
    }
}

impl fmt::Display for WorkerCommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_quoted(f, &self.program.to_string_lossy())?;
        for argument in &self.arguments {
            f.write_str(" ")?;
            write_quoted(f, argument)?;
        }
        Ok(())
    }
}

/// What every worker started by one agent run is initialised with.
#[derive(Debug, Clone)]
pub struct WorkerPlan {
    pub agent: AgentIdentity,
    pub console: Option<ConsoleEndpoint>,
    pub properties: BTreeMap<String, String>,
}

impl WorkerPlan {
    /// Allocates the next worker identity and its initialise message.
    pub(super) fn next_worker(&self, numbers: &AtomicU32) -> (WorkerIdentity, Message) {
        let identity = WorkerIdentity::new(&self.agent, numbers.fetch_add(1, Ordering::Relaxed));
        let initialise = Message::InitialiseWorker(Box::new(InitialiseWorker {
            identity: identity.clone(),
            console: self.console.clone(),
            properties: self.properties.clone(),
        }));
        (identity, initialise)
    }
}

/// Starts each worker as a child process whose stdin is fed by the agent's
/// fan-out stream sender.
pub struct ProcessWorkerFactory {
    command_line: WorkerCommandLine,
    plan: WorkerPlan,
    fan_out: Arc<FanOutStreamSender>,
    numbers: AtomicU32,
}

impl ProcessWorkerFactory {
    #[must_use]
    pub const fn new(
        command_line: WorkerCommandLine,
        plan: WorkerPlan,
        fan_out: Arc<FanOutStreamSender>,
    ) -> Self {
        Self {
            command_line,
            plan,
            fan_out,
            numbers: AtomicU32::new(0),
        }
    }
}

impl WorkerFactory for ProcessWorkerFactory {
    fn create(
        &self,
        stdout: OutputRedirect,
        stderr: OutputRedirect,
    ) -> Result<Arc<dyn Worker>, EngineError> {
        let (identity, initialise) = self.plan.next_worker(&self.numbers);

        let mut child = self
            .command_line
            .command()
            .stdin(Stdio::piped())
            .stdout(stdout.stdio())
            .stderr(stderr.stdio())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EngineError::WorkerSpawn {
                program: self.command_line.to_string(),
                source,
            })?;

        let Some(stdin) = child.stdin.take() else {
            if let Err(err) = child.start_kill() {
                debug!("Failed to kill worker without stdin: {}", err);
            }
            return Err(EngineError::WorkerStdin {
                worker: identity.name().to_owned(),
            });
        };
        self.fan_out.add(stdin, Some(initialise));

        let (destroy_tx, _) = watch::channel(false);
        Ok(Arc::new(ProcessWorker {
            identity,
            child: Mutex::new(child),
            destroy_tx,
        }))
    }
}

pub struct ProcessWorker {
    identity: WorkerIdentity,
    child: Mutex<Child>,
    destroy_tx: watch::Sender<bool>,
}

#[async_trait]
impl Worker for ProcessWorker {
    fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    async fn wait_for(&self) -> Result<WorkerExit, EngineError> {
        let mut destroyed = self.destroy_tx.subscribe();
        let mut child = self.child.lock().await;
        let wait_error = |source| EngineError::WorkerWait {
            worker: self.identity.name().to_owned(),
            source,
        };

        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(wait_error)?;
                Ok(WorkerExit::Finished(status.code()))
            }
            _ = async { destroyed.wait_for(|destroyed| *destroyed).await.is_ok() } => {
                if let Err(err) = child.start_kill() {
                    debug!("Worker {} already gone: {}", self.identity.name(), err);
                }
                child.wait().await.map_err(wait_error)?;
                Ok(WorkerExit::Destroyed)
            }
        }
    }

    fn destroy(&self) {
        self.destroy_tx.send_replace(true);
        if let Ok(mut child) = self.child.try_lock()
            && let Err(err) = child.start_kill()
        {
            debug!("Worker {} already gone: {}", self.identity.name(), err);
        }
    }
}
