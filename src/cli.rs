// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "convo", version, about = "Conversation-routing and turn-execution core for a chat-platform agent bridge")]
pub struct Cli {
    /// Path to the config file. Defaults to the platform config search path.
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(long, short = 'v', global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a single prompt against the configured model, streaming the
    /// Turn Engine's events to stdout. Useful for local development without
    /// a live chat-platform adapter.
    Run {
        /// The prompt text. Reads stdin if omitted.
        prompt: Option<String>,
    },

    /// Validate the config file and print the resolved model/tool setup.
    CheckConfig,
}
