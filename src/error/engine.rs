use std::path::PathBuf;

use thiserror::Error;

use super::CommunicationError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to start worker '{program}': {source}")]
    WorkerSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Worker '{worker}' has no stdin pipe.")]
    WorkerStdin { worker: String },
    #[error("Failed waiting for worker '{worker}': {source}")]
    WorkerWait {
        worker: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Worker launcher has been shut down.")]
    LauncherShutdown,
    #[error("Could not determine the current executable: {source}")]
    CurrentExecutable {
        #[source]
        source: std::io::Error,
    },
    #[error("Could not write to directory '{path}' as a file with that name already exists.")]
    NotADirectory { path: PathBuf },
    #[error("File store I/O error at '{path}': {source}")]
    FileStore {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Refusing to distribute file outside the store: '{path}'.")]
    InvalidDistributionPath { path: String },
    #[error("Distributed file '{path}' is not valid base64: {source}")]
    Base64 {
        path: String,
        #[source]
        source: base64::DecodeError,
    },
    #[error("Worker input ended before an initialise message arrived.")]
    MissingInitialiseMessage,
    #[error("Expected an initialise message, got '{kind}'.")]
    UnexpectedWorkerMessage { kind: &'static str },
    #[error("Communication error: {0}")]
    Communication(#[from] CommunicationError),
    #[cfg(test)]
    #[error("Test expectation failed: {message}")]
    TestExpectation { message: &'static str },
    #[cfg(test)]
    #[error("Test expectation failed: {message}: {value}")]
    TestExpectationValue {
        message: &'static str,
        value: String,
    },
}
