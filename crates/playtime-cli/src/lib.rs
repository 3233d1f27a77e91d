//! Playtime limiter CLI library.
//!
//! This crate provides the command-line interface and the stdio host
//! adapter around `playtime-core`.

mod cli;
pub mod commands;
mod config;
pub mod host;

pub use cli::{Cli, Commands};
pub use config::Config;
