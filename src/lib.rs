//! Core library for the `loadmesh` CLI.
//!
//! This crate provides the control plane of a distributed load test: the
//! framed TCP protocol spoken between console, agents and workers, the
//! communication primitives built on it, the agent engine that ramps up and
//! supervises worker processes, and the console service that drives them.
//! The primary user-facing interface is the `loadmesh` command-line
//! application; library APIs may evolve as the CLI grows.
pub mod args;
pub mod communication;
pub mod config;
pub mod console;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod shutdown;
pub mod shutdown_handlers;
