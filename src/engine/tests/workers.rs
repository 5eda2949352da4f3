use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt;
use tokio::io::DuplexStream;
use tokio::sync::Notify;
use tokio_util::codec::FramedWrite;

use crate::communication::{FanOutStreamSender, Sender};
use crate::engine::{
    DURATION_PROPERTY, InProcessWorkerFactory, OutputRedirect, ProcessWorkerFactory,
    WorkerCommandLine, WorkerLauncher, WorkerPlan, run_worker,
};
use crate::error::{AppError, AppResult, EngineError};
use crate::protocol::{AgentIdentity, InitialiseWorker, JsonFrameCodec, Message, WorkerIdentity};

use super::{run_async_test, run_socket_test, wait_until};

type Input = FramedWrite<DuplexStream, JsonFrameCodec<Message>>;

fn worker_input() -> (Input, DuplexStream) {
    let (writer, reader) = tokio::io::duplex(4096);
    (FramedWrite::new(writer, JsonFrameCodec::new()), reader)
}

fn initialise(properties: BTreeMap<String, String>) -> Message {
    let agent = AgentIdentity::new("test-agent");
    Message::InitialiseWorker(Box::new(InitialiseWorker {
        identity: WorkerIdentity::new(&agent, 0),
        console: None,
        properties,
    }))
}

fn plan(properties: BTreeMap<String, String>) -> WorkerPlan {
    WorkerPlan {
        agent: AgentIdentity::new("test-agent"),
        console: None,
        properties,
    }
}

#[test]
fn worker_runs_until_stopped() -> AppResult<()> {
    run_async_test(async {
        let (mut input, reader) = worker_input();
        let worker = tokio::spawn(run_worker(reader));

        input.send(initialise(BTreeMap::new())).await?;
        input.send(Message::ClearCache).await?;
        tokio::time::sleep(Duration::from_millis(20)).await;
        if worker.is_finished() {
            return Err(AppError::engine("Worker ended before being stopped"));
        }

        input.send(Message::StopWorkers).await?;
        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .map_err(|err| AppError::engine(format!("Worker did not stop: {}", err)))???;
        Ok(())
    })
}

#[test]
fn worker_ends_when_its_input_closes() -> AppResult<()> {
    run_async_test(async {
        let (mut input, reader) = worker_input();
        let worker = tokio::spawn(run_worker(reader));
        input.send(initialise(BTreeMap::new())).await?;
        drop(input);

        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .map_err(|err| AppError::engine(format!("Worker did not end: {}", err)))???;
        Ok(())
    })
}

#[test]
fn worker_duration_bounds_the_run() -> AppResult<()> {
    run_async_test(async {
        let (mut input, reader) = worker_input();
        let mut properties = BTreeMap::new();
        properties.insert(DURATION_PROPERTY.to_owned(), "30".to_owned());
        input.send(initialise(properties)).await?;

        tokio::time::timeout(Duration::from_secs(5), run_worker(reader))
            .await
            .map_err(|err| AppError::engine(format!("Duration was ignored: {}", err)))??;
        drop(input);
        Ok(())
    })
}

#[test]
fn worker_requires_an_initialise_message() -> AppResult<()> {
    run_async_test(async {
        let (input, reader) = worker_input();
        drop(input);
        match run_worker(reader).await {
            Err(EngineError::MissingInitialiseMessage) => {}
            Err(err) => return Err(AppError::engine(format!("Unexpected error: {}", err))),
            Ok(()) => return Err(AppError::engine("Worker ran without initialising")),
        }

        let (mut input, reader) = worker_input();
        input.send(Message::StopWorkers).await?;
        match run_worker(reader).await {
            Err(EngineError::UnexpectedWorkerMessage { kind: "stop_workers" }) => Ok(()),
            Err(err) => Err(AppError::engine(format!("Unexpected error: {}", err))),
            Ok(()) => Err(AppError::engine("Worker accepted a stop as its first message")),
        }
    })
}

#[test]
fn command_line_quotes_arguments_with_spaces() -> AppResult<()> {
    let command_line = WorkerCommandLine::new(
        PathBuf::from("/opt/load gen/bin"),
        vec!["worker".to_owned(), "--name=a b".to_owned(), String::new()],
    );
    let rendered = command_line.to_string();
    if rendered != "\"/opt/load gen/bin\" worker \"--name=a b\" \"\"" {
        return Err(AppError::engine(format!("Unexpected rendering: {}", rendered)));
    }

    let configured = WorkerCommandLine::from_configured(&["sh".to_owned(), "-c".to_owned()])?;
    if configured.program().as_path() != Path::new("sh") || configured.arguments() != ["-c"] {
        return Err(AppError::engine("Configured command line was not split"));
    }
    let default = WorkerCommandLine::from_configured(&[])?;
    if default.arguments() != ["worker"] {
        return Err(AppError::engine("Expected the worker subcommand by default"));
    }
    Ok(())
}

#[test]
fn in_process_workers_stop_on_broadcast() -> AppResult<()> {
    run_socket_test(async {
        let fan_out = Arc::new(FanOutStreamSender::new());
        let factory = Arc::new(InProcessWorkerFactory::new(
            plan(BTreeMap::new()),
            Arc::clone(&fan_out),
        ));
        let launcher = WorkerLauncher::new(
            3,
            factory,
            Arc::new(Notify::new()),
            OutputRedirect::Inherit,
        );
        launcher.start_all_workers()?;
        if fan_out.stream_count() != 3 {
            return Err(AppError::engine("Expected one stream per worker"));
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        if launcher.all_finished() {
            return Err(AppError::engine("Workers ended before being stopped"));
        }

        fan_out.send(Message::StopWorkers).await?;
        wait_until("workers to stop", || launcher.all_finished()).await?;
        launcher.shutdown().await;
        fan_out.shutdown().await;
        Ok(())
    })
}

#[test]
fn in_process_workers_can_be_destroyed() -> AppResult<()> {
    run_socket_test(async {
        let fan_out = Arc::new(FanOutStreamSender::new());
        let factory = Arc::new(InProcessWorkerFactory::new(
            plan(BTreeMap::new()),
            Arc::clone(&fan_out),
        ));
        let launcher = WorkerLauncher::new(
            2,
            factory,
            Arc::new(Notify::new()),
            OutputRedirect::Inherit,
        );
        launcher.start_all_workers()?;

        launcher.destroy_all_workers();
        wait_until("workers to be destroyed", || launcher.all_finished()).await?;
        launcher.shutdown().await;
        fan_out.shutdown().await;
        Ok(())
    })
}

#[cfg(unix)]
#[test]
fn process_workers_end_when_their_stdin_closes() -> AppResult<()> {
    run_socket_test(async {
        let fan_out = Arc::new(FanOutStreamSender::new());
        let command_line = WorkerCommandLine::new(
            PathBuf::from("sh"),
            vec!["-c".to_owned(), "cat > /dev/null".to_owned()],
        );
        let factory = Arc::new(ProcessWorkerFactory::new(
            command_line,
            plan(BTreeMap::new()),
            Arc::clone(&fan_out),
        ));
        let launcher = WorkerLauncher::new(
            2,
            factory,
            Arc::new(Notify::new()),
            OutputRedirect::Discard,
        );
        launcher.start_all_workers()?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        if launcher.all_finished() {
            return Err(AppError::engine("Workers ended with their stdin open"));
        }

        fan_out.shutdown().await;
        wait_until("worker processes to exit", || launcher.all_finished()).await?;
        launcher.shutdown().await;
        Ok(())
    })
}

#[cfg(unix)]
#[test]
fn process_workers_can_be_destroyed() -> AppResult<()> {
    run_socket_test(async {
        let fan_out = Arc::new(FanOutStreamSender::new());
        let command_line = WorkerCommandLine::new(
            PathBuf::from("sh"),
            vec!["-c".to_owned(), "sleep 30".to_owned()],
        );
        let factory = Arc::new(ProcessWorkerFactory::new(
            command_line,
            plan(BTreeMap::new()),
            Arc::clone(&fan_out),
        ));
        let launcher = WorkerLauncher::new(
            1,
            factory,
            Arc::new(Notify::new()),
            OutputRedirect::Discard,
        );
        launcher.start_all_workers()?;

        launcher.destroy_all_workers();
        wait_until("worker process to be killed", || launcher.all_finished()).await?;
        launcher.shutdown().await;
        fan_out.shutdown().await;
        Ok(())
    })
}
