use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

use crate::communication::{ClientSender, Connector, Sender};
use crate::error::{CommunicationError, EngineError};
use crate::protocol::{
    Address, ConnectionType, InitialiseWorker, JsonFrameCodec, Message, ProcessState,
    WorkerIdentity, WorkerProcessReport,
};

/// Worker property bounding how long a worker runs before finishing on its
/// own, in milliseconds.
pub const DURATION_PROPERTY: &str = "worker.duration_ms";

type WorkerInput<R> = FramedRead<R, JsonFrameCodec<Message>>;

async fn read_initialise<R>(input: &mut WorkerInput<R>) -> Result<InitialiseWorker, EngineError>
where
    R: AsyncRead + Unpin,
{
    match input.next().await {
        Some(Ok(Message::InitialiseWorker(initialise))) => Ok(*initialise),
        Some(Ok(other)) => Err(EngineError::UnexpectedWorkerMessage {
            kind: other.kind().name(),
        }),
        Some(Err(err)) => Err(CommunicationError::io("read worker input", err).into()),
        None => Err(EngineError::MissingInitialiseMessage),
    }
}

async fn connect_reporter(initialise: &InitialiseWorker) -> Option<ClientSender> {
    let console = initialise.console.as_ref()?;
    let connector = Connector::new(console.host.clone(), console.port, ConnectionType::Worker);
    let address = Address::Worker {
        identity: initialise.identity.clone(),
    };
    match ClientSender::connect(&connector, Some(&address)).await {
        Ok(sender) => Some(sender),
        Err(err) => {
            warn!(
                "Worker {} cannot report to the console at {}: {}",
                initialise.identity.name(),
                connector.endpoint(),
                err
            );
            None
        }
    }
}

async fn report(reporter: Option<&ClientSender>, identity: &WorkerIdentity, state: ProcessState) {
    let Some(reporter) = reporter else {
        return;
    };
    let message = Message::WorkerProcessReport(Box::new(WorkerProcessReport {
        identity: identity.clone(),
        state,
    }));
    if let Err(err) = reporter.send(message).await {
        debug!("Failed to report worker state: {}", err);
    }
}

/// Runs until the agent closes our input, tells us to stop or reset, or the
/// configured duration elapses.
async fn run_until_stopped<R>(
    input: &mut WorkerInput<R>,
    duration: Option<Duration>,
) -> Result<(), EngineError>
where
    R: AsyncRead + Unpin,
{
    let deadline = async {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            () = &mut deadline => {
                debug!("Worker duration elapsed");
                return Ok(());
            }
            frame = input.next() => match frame {
                Some(Ok(Message::StopWorkers | Message::ResetWorkers)) => return Ok(()),
                Some(Ok(message)) => debug!("Worker ignoring {}", message.kind()),
                Some(Err(err)) => {
                    return Err(CommunicationError::io("read worker input", err).into());
                }
                None => {
                    debug!("Worker input closed");
                    return Ok(());
                }
            },
        }
    }
}

/// The worker side of the agent/worker protocol: reads its initialise
/// message from `input`, reports Started and Finished to the console when
/// one is configured, and runs until told to stop.
///
/// # Errors
///
/// Returns an error when the input does not start with an initialise
/// message or cannot be read.
pub async fn run_worker<R>(input: R) -> Result<(), EngineError>
where
    R: AsyncRead + Unpin + Send,
{
    let mut input = FramedRead::new(input, JsonFrameCodec::<Message>::new());
    let initialise = read_initialise(&mut input).await?;
    let identity = initialise.identity.clone();
    info!("worker {} initialised", identity.name());

    let duration = initialise
        .properties
        .get(DURATION_PROPERTY)
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis);

    let reporter = connect_reporter(&initialise).await;
    report(reporter.as_ref(), &identity, ProcessState::Started).await;
    report(reporter.as_ref(), &identity, ProcessState::Running).await;

    let outcome = run_until_stopped(&mut input, duration).await;

    report(reporter.as_ref(), &identity, ProcessState::Finished).await;
    if let Some(reporter) = reporter {
        reporter.shutdown().await;
    }
    info!("worker {} finished", identity.name());
    outcome
}
