use std::sync::Arc;
use std::sync::atomic::AtomicU32;

use async_trait::async_trait;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::communication::FanOutStreamSender;
use crate::error::EngineError;
use crate::protocol::WorkerIdentity;

use super::process_worker::WorkerPlan;
use super::worker::{OutputRedirect, Worker, WorkerExit, WorkerFactory};
use super::worker_process::run_worker;

/// Buffer between the fan-out sender and an in-process worker.
const PIPE_BYTES: usize = 64 * 1024;

/// Runs workers as tokio tasks inside the agent. Used for single process
/// debugging; the worker loop is the same one worker processes run.
pub struct InProcessWorkerFactory {
    plan: WorkerPlan,
    fan_out: Arc<FanOutStreamSender>,
    numbers: AtomicU32,
}

impl InProcessWorkerFactory {
    #[must_use]
    pub const fn new(plan: WorkerPlan, fan_out: Arc<FanOutStreamSender>) -> Self {
        Self {
            plan,
            fan_out,
            numbers: AtomicU32::new(0),
        }
    }
}

impl WorkerFactory for InProcessWorkerFactory {
    fn create(
        &self,
        stdout: OutputRedirect,
        stderr: OutputRedirect,
    ) -> Result<Arc<dyn Worker>, EngineError> {
        if stdout != OutputRedirect::Inherit || stderr != OutputRedirect::Inherit {
            debug!("In-process workers share the agent's output");
        }
        let (identity, initialise) = self.plan.next_worker(&self.numbers);
        let (writer, reader) = tokio::io::duplex(PIPE_BYTES);
        self.fan_out.add(writer, Some(initialise));

        let (destroy_tx, _) = watch::channel(false);
        Ok(Arc::new(TaskWorker {
            identity,
            task: Mutex::new(Some(tokio::spawn(run_worker(reader)))),
            destroy_tx,
        }))
    }
}

pub struct TaskWorker {
    identity: WorkerIdentity,
    task: Mutex<Option<JoinHandle<Result<(), EngineError>>>>,
    destroy_tx: watch::Sender<bool>,
}

#[async_trait]
impl Worker for TaskWorker {
    fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    async fn wait_for(&self) -> Result<WorkerExit, EngineError> {
        let mut destroyed = self.destroy_tx.subscribe();
        let mut task = self.task.lock().await;
        let Some(handle) = task.as_mut() else {
            return Ok(WorkerExit::Finished(None));
        };

        let joined = tokio::select! {
            joined = &mut *handle => joined,
            _ = async { destroyed.wait_for(|destroyed| *destroyed).await.is_ok() } => {
                handle.abort();
                (&mut *handle).await
            }
        };
        *task = None;

        match joined {
            Ok(result) => result.map(|()| WorkerExit::Finished(None)),
            Err(err) if err.is_cancelled() => Ok(WorkerExit::Destroyed),
            Err(err) => {
                warn!("Worker task {} failed: {}", self.identity.name(), err);
                Ok(WorkerExit::Finished(None))
            }
        }
    }

    fn destroy(&self) {
        self.destroy_tx.send_replace(true);
        if let Ok(task) = self.task.try_lock()
            && let Some(handle) = task.as_ref()
        {
            handle.abort();
        }
    }
}
