//! Command-line argument definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Daily playtime limiter.
///
/// Counts how long each user plays media per day and stops playback once
/// their daily limit is used up.
#[derive(Debug, Parser)]
#[command(name = "playtime", version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Track playback events read from stdin and write host commands to stdout.
    Serve,

    /// Show today's playtime per user.
    Status {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Clear today's playtime for a user.
    Reset {
        /// The user ID to reset.
        #[arg(long)]
        user: String,
    },
}
