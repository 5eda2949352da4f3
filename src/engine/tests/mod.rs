use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::{AppError, AppResult, EngineError};
use crate::protocol::{AgentIdentity, WorkerIdentity};

use super::worker::{OutputRedirect, Worker, WorkerExit, WorkerFactory};

mod workers;

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const WAIT_STEP: Duration = Duration::from_millis(10);

fn run_async_test<F>(future: F) -> AppResult<()>
where
    F: Future<Output = AppResult<()>>,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::engine(format!("Failed to build runtime: {}", err)))?;
    runtime.block_on(future)
}

fn run_socket_test<F>(future: F) -> AppResult<()>
where
    F: Future<Output = AppResult<()>>,
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .map_err(|err| AppError::engine(format!("Failed to build runtime: {}", err)))?;
    runtime.block_on(future)
}

async fn wait_until<F>(what: &'static str, mut condition: F) -> AppResult<()>
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(WAIT_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(WAIT_STEP).await;
        }
    })
    .await
    .map_err(|err| AppError::engine(format!("Timed out waiting for {}: {}", what, err)))
}

/// Worker that ends when the test says so.
struct FakeWorker {
    identity: WorkerIdentity,
    exit: watch::Sender<Option<WorkerExit>>,
    destroys: AtomicUsize,
}

impl FakeWorker {
    fn new(identity: WorkerIdentity) -> Self {
        let (exit, _) = watch::channel(None);
        Self {
            identity,
            exit,
            destroys: AtomicUsize::new(0),
        }
    }

    fn end(&self, exit: WorkerExit) {
        self.exit.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(exit);
            true
        });
    }

    fn finish(&self) {
        self.end(WorkerExit::Finished(Some(0)));
    }

    fn destroys(&self) -> usize {
        self.destroys.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Worker for FakeWorker {
    fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    async fn wait_for(&self) -> Result<WorkerExit, EngineError> {
        let mut exit = self.exit.subscribe();
        let ended = exit
            .wait_for(Option::is_some)
            .await
            .map_err(|err| EngineError::from(format!("exit channel closed: {}", err)))?;
        (*ended).ok_or_else(|| EngineError::from("worker ended without an exit"))
    }

    fn destroy(&self) {
        self.destroys.fetch_add(1, Ordering::SeqCst);
        self.end(WorkerExit::Destroyed);
    }
}

/// Factory handing out [`FakeWorker`]s, optionally failing from the nth
/// creation on or meeting a barrier inside the first creation.
struct FakeFactory {
    agent: AgentIdentity,
    created: Mutex<Vec<Arc<FakeWorker>>>,
    fail_from: Option<usize>,
    first_create: Option<Arc<Barrier>>,
}

impl FakeFactory {
    fn new() -> Arc<Self> {
        Self::failing_from(None)
    }

    fn failing_from(fail_from: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            agent: AgentIdentity::new("fake"),
            created: Mutex::new(Vec::new()),
            fail_from,
            first_create: None,
        })
    }

    fn pausing_first_create(barrier: Arc<Barrier>) -> Arc<Self> {
        Arc::new(Self {
            agent: AgentIdentity::new("fake"),
            created: Mutex::new(Vec::new()),
            fail_from: None,
            first_create: Some(barrier),
        })
    }

    fn created(&self) -> Vec<Arc<FakeWorker>> {
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn count(&self) -> usize {
        self.created().len()
    }

    fn finish_all(&self) {
        for worker in self.created() {
            worker.finish();
        }
    }
}

impl WorkerFactory for FakeFactory {
    fn create(
        &self,
        _stdout: OutputRedirect,
        _stderr: OutputRedirect,
    ) -> Result<Arc<dyn Worker>, EngineError> {
        let mut created = self.created.lock().unwrap_or_else(PoisonError::into_inner);
        if created.is_empty()
            && let Some(barrier) = &self.first_create
        {
            barrier.wait();
        }
        if self.fail_from == Some(created.len()) {
            return Err(EngineError::WorkerStdin {
                worker: "fake".to_owned(),
            });
        }
        let number = u32::try_from(created.len()).unwrap_or(u32::MAX);
        let worker = Arc::new(FakeWorker::new(WorkerIdentity::new(&self.agent, number)));
        created.push(Arc::clone(&worker));
        Ok(worker)
    }
}
