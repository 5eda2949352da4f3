use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::communication::{
    ClientReceiver, ClientSender, Connector, MessageDispatchSender, Receiver, Sender,
};
use crate::error::{AppError, AppResult, ConsoleError};
use crate::protocol::{
    Address, AgentIdentity, AgentProcessReport, CacheHighWaterMark, ConnectionType, Message,
    ProcessState, WorkerIdentity, WorkerProcessReport, write_handshake,
};
use crate::shutdown::ShutdownCause;
use crate::shutdown_handlers::shutdown_channel;

use super::{Console, ConsoleCommand, ConsoleConfig, ProcessRegistry};

const LOOPBACK: &str = "127.0.0.1";
const WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const WAIT_STEP: Duration = Duration::from_millis(10);

fn run_socket_test<F>(future: F) -> AppResult<()>
where
    F: Future<Output = AppResult<()>>,
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .map_err(|err| AppError::console(format!("Failed to build runtime: {}", err)))?;
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
    .map_err(|err| AppError::console(format!("Timed out waiting for {}: {}", what, err)))
}

fn local_config() -> ConsoleConfig {
    ConsoleConfig {
        host: LOOPBACK.to_owned(),
        port: 0,
        idle_poll_delay: Duration::from_millis(20),
        ..ConsoleConfig::default()
    }
}

async fn connect_agent(
    console: &Console,
    identity: &AgentIdentity,
) -> AppResult<ClientReceiver> {
    let connector = Connector::new(LOOPBACK, console.port(), ConnectionType::Agent);
    let address = Address::Agent {
        identity: identity.clone(),
    };
    Ok(ClientReceiver::connect(&connector, Some(&address)).await?)
}

async fn next_message(receiver: &ClientReceiver) -> AppResult<Message> {
    tokio::time::timeout(WAIT_TIMEOUT, receiver.wait_for_message())
        .await
        .map_err(|err| AppError::console(format!("No message arrived: {}", err)))??
        .ok_or_else(|| AppError::console("Connection closed"))
}

fn agent_report(identity: &AgentIdentity, state: ProcessState) -> Message {
    Message::AgentProcessReport(Box::new(AgentProcessReport {
        identity: identity.clone(),
        state,
        cache_high_water_mark: CacheHighWaterMark::out_of_date(),
    }))
}

#[test]
fn start_collects_properties() -> AppResult<()> {
    let separated = ConsoleCommand::parse("start worker.duration_ms=50 agent.processes = 3");
    if !matches!(separated, Err(ConsoleError::InvalidProperty { .. })) {
        return Err(AppError::console("Separated assignment should not parse"));
    }
    let command = ConsoleCommand::parse("start worker.duration_ms=50 agent.processes=3")?;
    let Some(ConsoleCommand::Start(properties)) = command else {
        return Err(AppError::console(format!("Unexpected command {:?}", command)));
    };
    if properties.get("worker.duration_ms").map(String::as_str) != Some("50")
        || properties.get("agent.processes").map(String::as_str) != Some("3")
    {
        return Err(AppError::console(format!("Unexpected properties {:?}", properties)));
    }
    Ok(())
}

#[test]
fn start_rejects_words_without_a_key() -> AppResult<()> {
    let result = ConsoleCommand::parse("start =5");
    if matches!(&result, Err(ConsoleError::InvalidProperty { value }) if value == "=5") {
        return Ok(());
    }
    Err(AppError::console(format!("Unexpected result {:?}", result)))
}

#[test]
fn commands_are_case_insensitive() -> AppResult<()> {
    let expected = [
        ("STOP", ConsoleCommand::Stop),
        ("Reset", ConsoleCommand::Reset),
        ("clear", ConsoleCommand::ClearCache),
        ("status", ConsoleCommand::Status),
        ("?", ConsoleCommand::Help),
        ("exit", ConsoleCommand::Quit),
    ];
    for (line, command) in expected {
        if ConsoleCommand::parse(line)? != Some(command) {
            return Err(AppError::console(format!("'{}' parsed wrongly", line)));
        }
    }
    Ok(())
}

#[test]
fn distribute_needs_a_file() -> AppResult<()> {
    if !matches!(
        ConsoleCommand::parse("distribute"),
        Err(ConsoleError::MissingArgument {
            command: "distribute",
            ..
        })
    ) {
        return Err(AppError::console("Expected a missing argument"));
    }
    let parsed = ConsoleCommand::parse("distribute data/users.csv users.csv")?;
    let expected = ConsoleCommand::Distribute {
        local: PathBuf::from("data/users.csv"),
        remote: Some("users.csv".to_owned()),
    };
    if parsed != Some(expected) {
        return Err(AppError::console(format!("Unexpected command {:?}", parsed)));
    }
    Ok(())
}

#[test]
fn blank_lines_and_unknown_commands() -> AppResult<()> {
    if ConsoleCommand::parse("   ")?.is_some() {
        return Err(AppError::console("Blank line produced a command"));
    }
    let result = ConsoleCommand::parse("launch");
    if matches!(&result, Err(ConsoleError::UnknownCommand { command }) if command == "launch") {
        return Ok(());
    }
    Err(AppError::console(format!("Unexpected result {:?}", result)))
}

#[test]
fn registry_keeps_the_latest_report() -> AppResult<()> {
    run_socket_test(async {
        let registry = Arc::new(ProcessRegistry::new());
        let dispatch = MessageDispatchSender::new();
        registry.register_message_handlers(&dispatch);

        let agent = AgentIdentity::new("agent");
        dispatch
            .send(agent_report(&agent, ProcessState::Started))
            .await?;
        dispatch
            .send(agent_report(&agent, ProcessState::Running))
            .await?;
        dispatch
            .send(Message::WorkerProcessReport(Box::new(WorkerProcessReport {
                identity: WorkerIdentity::new(&agent, 0),
                state: ProcessState::Running,
            })))
            .await?;

        let agents = registry.agents();
        let [report] = agents.as_slice() else {
            return Err(AppError::console(format!("Expected one agent, got {}", agents.len())));
        };
        if report.state != ProcessState::Running {
            return Err(AppError::console("Registry kept a stale report"));
        }
        if registry.workers().len() != 1 {
            return Err(AppError::console("Worker report missing"));
        }
        Ok(())
    })
}

#[test]
fn console_records_agent_reports() -> AppResult<()> {
    run_socket_test(async {
        let console = Console::start(&local_config()).await?;
        let identity = AgentIdentity::new("remote");
        let receiver = connect_agent(&console, &identity).await?;
        let sender = ClientSender::from_receiver(&receiver);

        sender
            .send(agent_report(&identity, ProcessState::Running))
            .await?;
        wait_until("agent report", || {
            console
                .registry()
                .agents()
                .iter()
                .any(|report| report.identity.name() == "remote")
        })
        .await?;

        Sender::shutdown(&sender).await;
        Receiver::shutdown(&receiver).await;
        console.shutdown().await;
        Ok(())
    })
}

#[test]
fn malformed_frame_leaves_other_agents_connected() -> AppResult<()> {
    run_socket_test(async {
        let console = Console::start(&local_config()).await?;

        let mut broken = TcpStream::connect((LOOPBACK, console.port())).await?;
        let address = Address::Agent {
            identity: AgentIdentity::new("broken"),
        };
        write_handshake(&mut broken, ConnectionType::Agent, Some(&address)).await?;
        broken.write_all(&[0, 0, 0, 4, b'{', b'b', b'a', b'd']).await?;
        broken.flush().await?;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let identity = AgentIdentity::new("healthy");
        let receiver = connect_agent(&console, &identity).await?;
        let sender = ClientSender::from_receiver(&receiver);
        sender
            .send(agent_report(&identity, ProcessState::Running))
            .await?;
        wait_until("report after a malformed frame", || {
            console
                .registry()
                .agents()
                .iter()
                .any(|report| report.identity.name() == "healthy")
        })
        .await?;

        Sender::shutdown(&sender).await;
        Receiver::shutdown(&receiver).await;
        console.shutdown().await;
        Ok(())
    })
}

#[test]
fn distribute_reaches_connected_agents() -> AppResult<()> {
    run_socket_test(async {
        let dir = tempdir()?;
        let local = dir.path().join("users.csv");
        tokio::fs::write(&local, b"alice,bob").await?;

        let console = Console::start(&local_config()).await?;
        let receiver = connect_agent(&console, &AgentIdentity::new("remote")).await?;
        wait_until("agent connection", || console.number_of_connections() == 1).await?;

        let keep_going = console
            .execute(ConsoleCommand::Distribute {
                local,
                remote: None,
            })
            .await?;
        if !keep_going {
            return Err(AppError::console("Distribute ended the console"));
        }

        let Message::DistributeFile(file) = next_message(&receiver).await? else {
            return Err(AppError::console("Expected a distributed file"));
        };
        if file.path != "users.csv" {
            return Err(AppError::console(format!("Unexpected path {}", file.path)));
        }
        if !matches!(
            next_message(&receiver).await?,
            Message::DistributionCacheCheckpoint { .. }
        ) {
            return Err(AppError::console("Expected a cache checkpoint"));
        }

        console.shutdown().await;
        if !matches!(next_message(&receiver).await?, Message::StopWorkers) {
            return Err(AppError::console("Shutdown did not stop the agent"));
        }
        Ok(())
    })
}

#[test]
fn missing_distribution_file_is_reported() -> AppResult<()> {
    run_socket_test(async {
        let dir = tempdir()?;
        let console = Console::start(&local_config()).await?;
        let result = console
            .execute(ConsoleCommand::Distribute {
                local: dir.path().join("absent.csv"),
                remote: None,
            })
            .await;
        console.shutdown().await;
        if matches!(result, Err(ConsoleError::ReadFile { .. })) {
            return Ok(());
        }
        Err(AppError::console(format!("Unexpected result {:?}", result)))
    })
}

#[test]
fn command_loop_stops_at_quit() -> AppResult<()> {
    run_socket_test(async {
        let console = Console::start(&local_config()).await?;
        let receiver = connect_agent(&console, &AgentIdentity::new("remote")).await?;
        wait_until("agent connection", || console.number_of_connections() == 1).await?;

        let (_shutdown_tx, shutdown_rx) = shutdown_channel();
        let input: &[u8] = b"\nbogus\nstart worker.duration_ms=10\nquit\nstop\n";
        tokio::time::timeout(WAIT_TIMEOUT, console.run_commands(input, shutdown_rx))
            .await
            .map_err(|err| AppError::console(format!("Command loop hung: {}", err)))??;

        let Message::StartWorkers(start) = next_message(&receiver).await? else {
            return Err(AppError::console("Expected a start message"));
        };
        if start.properties.get("worker.duration_ms").map(String::as_str) != Some("10") {
            return Err(AppError::console("Start properties were not sent"));
        }

        console.shutdown().await;
        // The stop after quit is never read; this one comes from shutdown.
        if !matches!(next_message(&receiver).await?, Message::StopWorkers) {
            return Err(AppError::console("Expected the shutdown stop"));
        }
        Ok(())
    })
}

#[test]
fn command_loop_stops_on_shutdown_signal() -> AppResult<()> {
    run_socket_test(async {
        let console = Console::start(&local_config()).await?;
        let (shutdown_tx, shutdown_rx) = shutdown_channel();
        let (_input_tx, input_rx) = tokio::io::duplex(64);
        if shutdown_tx.send(ShutdownCause::Requested).is_err() {
            return Err(AppError::console("Failed to send shutdown"));
        }
        tokio::time::timeout(
            WAIT_TIMEOUT,
            console.run_commands(tokio::io::BufReader::new(input_rx), shutdown_rx),
        )
        .await
        .map_err(|err| AppError::console(format!("Command loop hung: {}", err)))??;
        console.shutdown().await;
        Ok(())
    })
}
