use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::ConsoleError;

/// One line typed at the console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// Start workers on every agent, with extra worker properties.
    Start(BTreeMap<String, String>),
    Stop,
    Reset,
    /// Empty every agent's file store.
    ClearCache,
    /// Send a local file to every agent's file store, optionally under
    /// another relative path.
    Distribute {
        local: PathBuf,
        remote: Option<String>,
    },
    Status,
    Help,
    Quit,
}

pub const HELP: &str = "\
Commands:
  start [key=value ...]        start workers on every agent
  stop                         stop workers and end the agents
  reset                        stop workers and wait for the next start
  clear                        empty every agent's file store
  distribute <file> [<as>]     send a file to every agent's file store
  status                       list connected agents and workers
  quit                         shut the console down";

fn parse_property(value: &str) -> Result<(String, String), ConsoleError> {
    match value.split_once('=') {
        Some((key, property)) if !key.trim().is_empty() => {
            Ok((key.trim().to_owned(), property.trim().to_owned()))
        }
        Some(_) | None => Err(ConsoleError::InvalidProperty {
            value: value.to_owned(),
        }),
    }
}

impl ConsoleCommand {
    /// Parses one input line. Blank lines yield `None`.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown commands, missing arguments or
    /// malformed properties.
    pub fn parse(line: &str) -> Result<Option<Self>, ConsoleError> {
        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            return Ok(None);
        };

        let parsed = match command.to_ascii_lowercase().as_str() {
            "start" => Self::Start(
                words
                    .map(parse_property)
                    .collect::<Result<BTreeMap<_, _>, _>>()?,
            ),
            "stop" => Self::Stop,
            "reset" => Self::Reset,
            "clear" => Self::ClearCache,
            "distribute" => {
                let local = words.next().ok_or(ConsoleError::MissingArgument {
                    command: "distribute",
                    argument: "a file to send",
                })?;
                Self::Distribute {
                    local: PathBuf::from(local),
                    remote: words.next().map(str::to_owned),
                }
            }
            "status" => Self::Status,
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            _ => {
                return Err(ConsoleError::UnknownCommand {
                    command: command.to_owned(),
                });
            }
        };
        Ok(Some(parsed))
    }
}
