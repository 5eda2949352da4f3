use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::protocol::WorkerIdentity;

/// Where a worker's stdout or stderr goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputRedirect {
    #[default]
    Inherit,
    Discard,
}

impl OutputRedirect {
    #[must_use]
    pub(super) fn stdio(self) -> Stdio {
        match self {
            Self::Inherit => Stdio::inherit(),
            Self::Discard => Stdio::null(),
        }
    }
}

/// How a worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Ended on its own. Process workers carry their exit code.
    Finished(Option<i32>),
    Destroyed,
}

/// A running worker owned by a [`WorkerLauncher`](super::WorkerLauncher).
#[async_trait]
pub trait Worker: Send + Sync {
    fn identity(&self) -> &WorkerIdentity;

    /// Waits for the worker to end.
    ///
    /// # Errors
    ///
    /// Returns an error when the worker's status cannot be collected.
    async fn wait_for(&self) -> Result<WorkerExit, EngineError>;

    /// Forcibly terminates the worker. Never waits.
    fn destroy(&self);
}

pub trait WorkerFactory: Send + Sync {
    /// Starts a new worker.
    ///
    /// # Errors
    ///
    /// Returns an error when the worker cannot be started.
    fn create(
        &self,
        stdout: OutputRedirect,
        stderr: OutputRedirect,
    ) -> Result<Arc<dyn Worker>, EngineError>;
}
