use std::path::PathBuf;

use thiserror::Error;

use super::CommunicationError;

#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error("Unknown command '{command}'. Type 'help' for the list of commands.")]
    UnknownCommand { command: String },
    #[error("Command '{command}' needs {argument}.")]
    MissingArgument {
        command: &'static str,
        argument: &'static str,
    },
    #[error("Expected key=value, got '{value}'.")]
    InvalidProperty { value: String },
    #[error("Failed to read '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
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
