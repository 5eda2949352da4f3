use thiserror::Error;

use super::{CommunicationError, ConfigError, ConsoleError, EngineError};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("CLI error: {source}")]
    Clap {
        #[from]
        source: clap::Error,
    },
    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
    #[error("TOML error: {source}")]
    Toml {
        #[from]
        source: toml::de::Error,
    },
    #[error("Join error: {source}")]
    Join {
        #[from]
        source: tokio::task::JoinError,
    },
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Communication error: {0}")]
    Communication(#[from] CommunicationError),
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("Console error: {0}")]
    Console(#[from] ConsoleError),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn config<E>(error: E) -> Self
    where
        E: Into<ConfigError>,
    {
        error.into().into()
    }

    pub fn communication<E>(error: E) -> Self
    where
        E: Into<CommunicationError>,
    {
        error.into().into()
    }

    pub fn engine<E>(error: E) -> Self
    where
        E: Into<EngineError>,
    {
        error.into().into()
    }

    pub fn console<E>(error: E) -> Self
    where
        E: Into<ConsoleError>,
    {
        error.into().into()
    }
}
