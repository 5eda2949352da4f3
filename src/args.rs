use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::console::ConsoleConfig;
use crate::engine::{AgentConfig, OutputRedirect};
use crate::error::ConfigError;
use crate::protocol::DEFAULT_CONSOLE_PORT;

#[derive(Debug, Parser, Clone)]
#[clap(
    name = "loadmesh",
    version,
    about = "Control plane for distributed load tests - a console that accepts agent connections, and agents that ramp up, supervise and tear down worker processes."
)]
pub struct LoadmeshArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Path to config file (TOML/JSON); defaults to ./loadmesh.toml or ./loadmesh.json
    #[arg(long, short, global = true)]
    pub config: Option<String>,

    /// Enable debug logging
    #[arg(long, short, global = true)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run an agent that starts workers when the console says so
    Agent(AgentArgs),
    /// Run the console that agents and workers connect to
    Console(ConsoleArgs),
    /// Worker process entry point, started by agents
    #[command(hide = true)]
    Worker,
}

#[derive(Debug, Args, Clone)]
pub struct AgentArgs {
    /// Agent name reported to the console
    #[arg(long, default_value = "agent", env = "LOADMESH_AGENT_NAME")]
    pub name: String,

    /// Console host to connect to
    #[arg(long = "console-host", default_value = "localhost")]
    pub console_host: String,

    /// Console port to connect to
    #[arg(long = "console-port", default_value_t = DEFAULT_CONSOLE_PORT)]
    pub console_port: u16,

    /// Run the local worker plan once without a console
    #[arg(long = "no-console")]
    pub no_console: bool,

    /// Fall back to the local plan when the console is unreachable
    #[arg(long = "proceed-without-console")]
    pub proceed_without_console: bool,

    /// Number of workers to run
    #[arg(long, default_value_t = 1)]
    pub processes: usize,

    /// Workers started before the first ramp-up step (defaults to the increment)
    #[arg(long = "initial-processes")]
    pub initial_processes: Option<usize>,

    /// Workers added per ramp-up step; 0 starts all at once
    #[arg(long = "process-increment", default_value_t = 0)]
    pub process_increment: usize,

    /// Milliseconds between ramp-up steps
    #[arg(long = "process-increment-interval-ms", default_value_t = 60_000)]
    pub process_increment_interval_ms: u64,

    /// Milliseconds workers get to end on their own before they are destroyed
    #[arg(long = "shutdown-deadline-ms", default_value_t = 20_000)]
    pub shutdown_deadline_ms: u64,

    /// Milliseconds between running reports to the console
    #[arg(long = "report-interval-ms", default_value_t = 1_000)]
    pub report_interval_ms: u64,

    /// Run workers as tasks inside the agent process
    #[arg(long = "single-process")]
    pub single_process: bool,

    /// Worker program and arguments (repeatable); defaults to this executable
    #[arg(long = "worker-command", allow_hyphen_values = true)]
    pub worker_command: Vec<String>,

    /// Send worker stdout/stderr to /dev/null
    #[arg(long = "discard-worker-output")]
    pub discard_worker_output: bool,

    /// Directory for files distributed by the console
    #[arg(long = "file-store-dir")]
    pub file_store_dir: Option<PathBuf>,

    /// Worker property in 'key=value' format (repeatable)
    #[arg(long = "property", short = 'p', value_parser = parse_property)]
    pub properties: Vec<(String, String)>,
}

impl AgentArgs {
    #[must_use]
    pub fn to_config(&self) -> AgentConfig {
        AgentConfig {
            name: self.name.clone(),
            use_console: !self.no_console,
            console_host: self.console_host.clone(),
            console_port: self.console_port,
            proceed_without_console: self.proceed_without_console,
            processes: self.processes,
            initial_processes: self.initial_processes,
            process_increment: self.process_increment,
            process_increment_interval: Duration::from_millis(self.process_increment_interval_ms),
            shutdown_deadline: Duration::from_millis(self.shutdown_deadline_ms),
            report_interval: Duration::from_millis(self.report_interval_ms),
            single_process: self.single_process,
            worker_command: self.worker_command.clone(),
            worker_output: if self.discard_worker_output {
                OutputRedirect::Discard
            } else {
                OutputRedirect::Inherit
            },
            file_store_dir: self.file_store_dir.clone(),
            properties: self.properties.iter().cloned().collect::<BTreeMap<_, _>>(),
        }
    }
}

#[derive(Debug, Args, Clone)]
pub struct ConsoleArgs {
    /// Interface to listen on; empty for all interfaces
    #[arg(long, default_value = "")]
    pub host: String,

    /// Port to listen on
    #[arg(long, default_value_t = DEFAULT_CONSOLE_PORT)]
    pub port: u16,

    /// Tasks accepting connections
    #[arg(long = "accept-tasks", default_value_t = 1)]
    pub accept_tasks: usize,

    /// Tasks reading messages from connections
    #[arg(long = "receiver-tasks", default_value_t = 5)]
    pub receiver_tasks: usize,

    /// Milliseconds a receiver task sleeps after finding nothing to read
    #[arg(long = "idle-poll-delay-ms", default_value_t = 500)]
    pub idle_poll_delay_ms: u64,
}

impl ConsoleArgs {
    #[must_use]
    pub fn to_config(&self) -> ConsoleConfig {
        ConsoleConfig {
            host: self.host.clone(),
            port: self.port,
            accept_tasks: self.accept_tasks,
            receiver_tasks: self.receiver_tasks,
            idle_poll_delay: Duration::from_millis(self.idle_poll_delay_ms),
        }
    }
}

pub(crate) fn parse_property(s: &str) -> Result<(String, String), ConfigError> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_owned(), value.trim().to_owned()))
        }
        Some(_) | None => Err(ConfigError::InvalidPropertyFormat {
            value: s.to_owned(),
        }),
    }
}
