mod args;
mod communication;
mod config;
mod console;
mod engine;
mod entry;
mod error;
mod logger;
mod protocol;
mod shutdown;
mod shutdown_handlers;

use error::AppResult;

fn main() -> AppResult<()> {
    entry::run()
}
