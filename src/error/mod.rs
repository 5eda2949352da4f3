mod app;
mod communication;
mod config;
mod console;
mod engine;

#[cfg(test)]
mod test_support;

pub use app::{AppError, AppResult};
pub use communication::CommunicationError;
pub use config::ConfigError;
pub use console::ConsoleError;
pub use engine::EngineError;
