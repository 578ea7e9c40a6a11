//! Command-line interface for bingo-duel.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Bingo Duel - two-player networked bingo
#[derive(Parser, Debug)]
#[command(name = "bingo-duel")]
#[command(about = "Two-player bingo over a shared store and a broadcast relay", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the WebSocket broadcast relay
    Relay {
        /// Address to bind (overrides BINGO_RELAY_ADDR)
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Connection limit (overrides BINGO_RELAY_MAX_CONNECTIONS)
        #[arg(long)]
        max_connections: Option<usize>,

        /// Require a seat token on subscribe
        #[arg(long)]
        require_tokens: bool,
    },

    /// Play a full game between two in-process clients
    Demo {
        /// Relay URL; the in-process hub is used when absent
        #[arg(long)]
        relay_url: Option<String>,

        /// Seed for boards and calls
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Host player name (defaults to the profile's last name)
        #[arg(long)]
        host_name: Option<String>,

        /// Guest player name
        #[arg(long, default_value = "Guest")]
        guest_name: String,

        /// Show the opponent's board
        #[arg(long)]
        show_opponent: bool,

        /// Profile file (overrides BINGO_PROFILE_PATH)
        #[arg(long)]
        profile: Option<PathBuf>,
    },
}
