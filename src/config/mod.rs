//! Configuration loading and application.
mod apply;
mod loader;
pub mod types;


pub use apply::{apply_agent_config, apply_console_config};
pub use loader::load_config;

#[cfg(test)]
pub(crate) use loader::load_config_file;
