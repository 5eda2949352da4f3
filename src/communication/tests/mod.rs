use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{AppError, AppResult, CommunicationError};
use crate::protocol::Message;

use super::{MessageQueue, Receiver, Sender};

mod acceptor;

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const WAIT_STEP: Duration = Duration::from_millis(10);

fn run_async_test<F>(future: F) -> AppResult<()>
where
    F: Future<Output = AppResult<()>>,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::communication(format!("Failed to build runtime: {}", err)))?;
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
        .map_err(|err| AppError::communication(format!("Failed to build runtime: {}", err)))?;
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
    .map_err(|err| AppError::communication(format!("Timed out waiting for {}: {}", what, err)))
}

/// Shared log so tests can assert the order several senders were called in.
type CallLog = Arc<Mutex<Vec<&'static str>>>;

fn call_log() -> CallLog {
    Arc::new(Mutex::new(Vec::new()))
}

fn calls(log: &CallLog) -> Vec<&'static str> {
    log.lock().unwrap_or_else(PoisonError::into_inner).clone()
}

struct RecordingSender {
    label: &'static str,
    log: CallLog,
    messages: Mutex<Vec<Message>>,
    shutdowns: AtomicUsize,
    fail_with: Option<&'static str>,
}

impl RecordingSender {
    fn new(label: &'static str, log: &CallLog) -> Arc<Self> {
        Arc::new(Self {
            label,
            log: Arc::clone(log),
            messages: Mutex::new(Vec::new()),
            shutdowns: AtomicUsize::new(0),
            fail_with: None,
        })
    }

    fn failing(label: &'static str, log: &CallLog, message: &'static str) -> Arc<Self> {
        Arc::new(Self {
            label,
            log: Arc::clone(log),
            messages: Mutex::new(Vec::new()),
            shutdowns: AtomicUsize::new(0),
            fail_with: Some(message),
        })
    }

    fn messages(&self) -> Vec<Message> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn count(&self) -> usize {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sender for RecordingSender {
    async fn send(&self, message: Message) -> Result<(), CommunicationError> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(self.label);
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
        match self.fail_with {
            Some(message) => Err(CommunicationError::Failure {
                message: message.to_owned(),
                source: None,
            }),
            None => Ok(()),
        }
    }

    async fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

/// Receiver fed directly by the test.
struct QueueReceiver {
    queue: MessageQueue,
    shutdowns: AtomicUsize,
}

impl QueueReceiver {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: MessageQueue::new(true),
            shutdowns: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Receiver for QueueReceiver {
    async fn wait_for_message(&self) -> Result<Option<Message>, CommunicationError> {
        match self.queue.dequeue().await {
            Ok(message) => Ok(Some(message)),
            Err(err) if err.is_shutdown() => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        self.queue.shutdown();
    }
}
