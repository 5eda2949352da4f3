use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    pub agent: Option<AgentSection>,
    pub console: Option<ConsoleSection>,
}

/// `[agent]` section. Durations are milliseconds.
#[derive(Debug, Default, Deserialize)]
pub struct AgentSection {
    pub name: Option<String>,
    pub use_console: Option<bool>,
    pub console_host: Option<String>,
    pub console_port: Option<u16>,
    pub proceed_without_console: Option<bool>,
    pub processes: Option<usize>,
    pub initial_processes: Option<usize>,
    pub process_increment: Option<usize>,
    pub process_increment_interval_ms: Option<u64>,
    pub shutdown_deadline_ms: Option<u64>,
    pub report_interval_ms: Option<u64>,
    pub single_process: Option<bool>,
    pub worker_command: Option<Vec<String>>,
    pub discard_worker_output: Option<bool>,
    pub file_store_dir: Option<PathBuf>,
    /// Merged under properties given on the command line.
    pub properties: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ConsoleSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub accept_tasks: Option<usize>,
    pub receiver_tasks: Option<usize>,
    pub idle_poll_delay_ms: Option<u64>,
}
