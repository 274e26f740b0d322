// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "dodo",
    about = "A local AI coding-agent runtime",
    version,
    long_about = None,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Repository to operate on (default: current directory)
    #[arg(long, value_name = "PATH")]
    pub repo: Option<PathBuf>,

    /// Stream model deltas as they arrive (default on)
    #[arg(long, default_value_t = true)]
    pub stream: bool,

    /// Switch into stdio protocol mode (NDJSON on stdout, logs on stderr).
    /// Equivalent to `dodo engine --stdio`.
    #[arg(long)]
    pub stdio: bool,

    /// Path to config file (overrides auto-discovery)
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v = debug, -vv = trace)
    #[arg(long, short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the engine for an external client.
    ///
    /// With --stdio the engine reads NDJSON commands on stdin and writes
    /// NDJSON events on stdout; all logging goes to stderr.
    Engine {
        /// Speak the NDJSON protocol over stdin/stdout.
        #[arg(long, default_value_t = true)]
        stdio: bool,
    },

    /// Print the effective configuration and exit
    ShowConfig,
}

impl Cli {
    pub fn repo_root(&self) -> PathBuf {
        self.repo
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }

    /// Protocol mode is requested by either the flag or the subcommand.
    pub fn is_stdio(&self) -> bool {
        self.stdio || matches!(self.command, Some(Commands::Engine { stdio: true }))
    }
}

// TTY detection for the interactive REPL prompt.
pub trait IsTerminal {
    fn is_terminal(&self) -> bool;
}

impl IsTerminal for std::io::Stdin {
    fn is_terminal(&self) -> bool {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            unsafe { libc::isatty(self.as_raw_fd()) != 0 }
        }
        #[cfg(not(unix))]
        {
            false
        }
    }
}
