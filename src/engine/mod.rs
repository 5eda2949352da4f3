//! Agent side of a distributed run: the agent loop, the worker launcher and
//! the workers it supervises, console signals and the distributed file
//! store.
mod agent;
mod console_listener;
mod file_store;
mod launcher;
mod process_worker;
mod task_worker;
mod worker;
mod worker_process;

#[cfg(test)]
mod tests;

pub use agent::{
    Agent, AgentConfig, AgentShutdown, FILE_STORE_PROPERTY, INITIAL_PROCESSES_PROPERTY,
    PROCESS_INCREMENT_INTERVAL_PROPERTY, PROCESS_INCREMENT_PROPERTY, PROCESSES_PROPERTY,
};
pub use console_listener::{ConsoleListener, Signals};
pub use file_store::FileStore;
pub use launcher::WorkerLauncher;
pub use process_worker::{ProcessWorkerFactory, WorkerCommandLine, WorkerPlan};
pub use task_worker::InProcessWorkerFactory;
pub use worker::{OutputRedirect, Worker, WorkerExit, WorkerFactory};
pub use worker_process::{DURATION_PROPERTY, run_worker};
