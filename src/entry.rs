use clap::{ArgMatches, CommandFactory, FromArgMatches};
use tokio::io::BufReader;
use tracing::{error, info};

use crate::args::{AgentArgs, Command, ConsoleArgs, LoadmeshArgs};
use crate::config::{apply_agent_config, apply_console_config, load_config};
use crate::console::Console;
use crate::engine::{Agent, run_worker};
use crate::error::AppResult;
use crate::shutdown_handlers::{on_shutdown, setup_signal_shutdown_handler, shutdown_channel};

pub(crate) fn run() -> AppResult<()> {
    let matches = LoadmeshArgs::command().get_matches();
    let args = LoadmeshArgs::from_arg_matches(&matches)?;

    crate::logger::init_logging(args.verbose);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let result = runtime.block_on(run_async(args, &matches));
    // A pending stdin read would otherwise hold the runtime open.
    runtime.shutdown_background();
    result
}

async fn run_async(args: LoadmeshArgs, matches: &ArgMatches) -> AppResult<()> {
    match args.command {
        Command::Agent(mut agent) => {
            if let Some(config) = load_config(args.config.as_deref())?
                && let Some(section) = config.agent.as_ref()
                && let Some(sub) = matches.subcommand_matches("agent")
            {
                apply_agent_config(&mut agent, sub, section)?;
            }
            run_agent(&agent).await
        }
        Command::Console(mut console) => {
            if let Some(config) = load_config(args.config.as_deref())?
                && let Some(section) = config.console.as_ref()
                && let Some(sub) = matches.subcommand_matches("console")
            {
                apply_console_config(&mut console, sub, section)?;
            }
            run_console(&console).await
        }
        Command::Worker => Ok(run_worker(tokio::io::stdin()).await?),
    }
}

async fn run_agent(args: &AgentArgs) -> AppResult<()> {
    let mut agent = Agent::new(args.to_config());
    let (shutdown_tx, shutdown_rx) = shutdown_channel();
    let signals = setup_signal_shutdown_handler(&shutdown_tx);

    let handle = agent.shutdown_handle();
    let on_signal = on_shutdown(shutdown_rx, move |cause| async move {
        info!("{}, stopping workers", cause);
        handle.shutdown().await;
    });

    let result = agent.run().await;
    if let Err(err) = &result {
        error!("Agent failed: {}", err);
    }

    on_signal.abort();
    signals.abort();
    Ok(result?)
}

async fn run_console(args: &ConsoleArgs) -> AppResult<()> {
    let console = Console::start(&args.to_config()).await?;
    info!("console listening on port {}", console.port());

    let (shutdown_tx, shutdown_rx) = shutdown_channel();
    let signals = setup_signal_shutdown_handler(&shutdown_tx);

    let result = console
        .run_commands(BufReader::new(tokio::io::stdin()), shutdown_rx)
        .await;
    console.shutdown().await;

    signals.abort();
    Ok(result?)
}
