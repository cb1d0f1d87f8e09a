// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};

#[derive(Parser, Debug)]
#[command(
    name = "conductor",
    about = "Broker between WebSocket clients and CLI coding-agent subprocesses",
    version,
    long_about = None,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Increase log verbosity (-v debug, -vv trace). Overridden by RUST_LOG.
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the WebSocket server. Runs until Ctrl+C or SIGTERM.
    ///
    /// A bearer token is generated on first run and printed once; it is
    /// then read from the same path on every subsequent start. Use
    /// `conductor token regenerate` to invalidate it and print a new one.
    Serve {
        /// Path to the config file.
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },

    /// Print the effective configuration and exit.
    ShowConfig {
        /// Path to the config file.
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },

    /// Bearer token management.
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },

    /// Generate a shell completion script.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand, Debug)]
pub enum TokenCommands {
    /// Regenerate the bearer token. The new token is printed once; the old
    /// one stops working immediately.
    Regenerate {
        /// Path to the config file.
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },
}

pub fn print_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "conductor", &mut std::io::stdout());
}
