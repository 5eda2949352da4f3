use clap::ArgMatches;
use clap::parser::ValueSource;

use crate::args::{AgentArgs, ConsoleArgs};
use crate::error::{AppError, AppResult, ConfigError};

use super::types::{AgentSection, ConsoleSection};

fn is_cli(matches: &ArgMatches, name: &str) -> bool {
    matches.value_source(name) == Some(ValueSource::CommandLine)
}

fn ensure_positive(value: usize, field: &'static str) -> AppResult<usize> {
    if value == 0 {
        return Err(AppError::config(ConfigError::FieldMustBePositive { field }));
    }
    Ok(value)
}

fn ensure_positive_u64(value: u64, field: &'static str) -> AppResult<u64> {
    if value == 0 {
        return Err(AppError::config(ConfigError::FieldMustBePositive { field }));
    }
    Ok(value)
}

/// Applies `[agent]` values to agent arguments not given on the command
/// line. `matches` are the agent subcommand's matches.
///
/// # Errors
///
/// Returns an error when a config value is invalid.
pub fn apply_agent_config(
    args: &mut AgentArgs,
    matches: &ArgMatches,
    config: &AgentSection,
) -> AppResult<()> {
    if !is_cli(matches, "name")
        && let Some(name) = config.name.clone()
    {
        args.name = name;
    }

    if !is_cli(matches, "no_console")
        && let Some(use_console) = config.use_console
    {
        args.no_console = !use_console;
    }

    if !is_cli(matches, "console_host")
        && let Some(host) = config.console_host.clone()
    {
        args.console_host = host;
    }

    if !is_cli(matches, "console_port")
        && let Some(port) = config.console_port
    {
        args.console_port = port;
    }

    if !is_cli(matches, "proceed_without_console")
        && let Some(proceed) = config.proceed_without_console
    {
        args.proceed_without_console = proceed;
    }

    if !is_cli(matches, "processes")
        && let Some(processes) = config.processes
    {
        args.processes = processes;
    }

    if !is_cli(matches, "initial_processes")
        && let Some(initial) = config.initial_processes
    {
        args.initial_processes = Some(initial);
    }

    if !is_cli(matches, "process_increment")
        && let Some(increment) = config.process_increment
    {
        args.process_increment = increment;
    }

    if !is_cli(matches, "process_increment_interval_ms")
        && let Some(interval) = config.process_increment_interval_ms
    {
        args.process_increment_interval_ms = interval;
    }

    if !is_cli(matches, "shutdown_deadline_ms")
        && let Some(deadline) = config.shutdown_deadline_ms
    {
        args.shutdown_deadline_ms = deadline;
    }

    if !is_cli(matches, "report_interval_ms")
        && let Some(interval) = config.report_interval_ms
    {
        args.report_interval_ms = ensure_positive_u64(interval, "agent.report_interval_ms")?;
    }

    if !is_cli(matches, "single_process")
        && let Some(single) = config.single_process
    {
        args.single_process = single;
    }

    if !is_cli(matches, "worker_command")
        && let Some(command) = config.worker_command.clone()
    {
        args.worker_command = command;
    }

    if !is_cli(matches, "discard_worker_output")
        && let Some(discard) = config.discard_worker_output
    {
        args.discard_worker_output = discard;
    }

    if !is_cli(matches, "file_store_dir")
        && let Some(dir) = config.file_store_dir.clone()
    {
        args.file_store_dir = Some(dir);
    }

    if let Some(properties) = config.properties.as_ref() {
        let mut merged: Vec<(String, String)> = properties
            .iter()
            .filter(|(key, _)| !args.properties.iter().any(|(cli_key, _)| cli_key == *key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        merged.append(&mut args.properties);
        args.properties = merged;
    }

    Ok(())
}

/// Applies `[console]` values to console arguments not given on the
/// command line.
///
/// # Errors
///
/// Returns an error when a task count is zero.
pub fn apply_console_config(
    args: &mut ConsoleArgs,
    matches: &ArgMatches,
    config: &ConsoleSection,
) -> AppResult<()> {
    if !is_cli(matches, "host")
        && let Some(host) = config.host.clone()
    {
        args.host = host;
    }

    if !is_cli(matches, "port")
        && let Some(port) = config.port
    {
        args.port = port;
    }

    if !is_cli(matches, "accept_tasks")
        && let Some(tasks) = config.accept_tasks
    {
        args.accept_tasks = ensure_positive(tasks, "console.accept_tasks")?;
    }

    if !is_cli(matches, "receiver_tasks")
        && let Some(tasks) = config.receiver_tasks
    {
        args.receiver_tasks = ensure_positive(tasks, "console.receiver_tasks")?;
    }

    if !is_cli(matches, "idle_poll_delay_ms")
        && let Some(delay) = config.idle_poll_delay_ms
    {
        args.idle_poll_delay_ms = delay;
    }

    Ok(())
}
