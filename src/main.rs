// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::io::{self, Read};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use convo_engine::{Agent, AgentEvent, Transcript};
use convo_model::Message;
use convo_tools::{ToolPolicy, ToolRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = convo_config::load(cli.config.as_deref())
        .context("failed to load config")?;

    match cli.command {
        Commands::CheckConfig => check_config(&config),
        Commands::Run { prompt } => run_prompt(&config, prompt).await,
    }
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();
}

fn check_config(config: &convo_config::Config) -> anyhow::Result<()> {
    println!("model provider:   {}", config.model.provider);
    println!("model name:       {}", config.model.name);
    println!("models.main:      {}", config.models.main.model);
    println!("models.fast:      {}", config.models.fast.model);
    println!("router.defaultMode: {:?}", config.surface.router.default_mode);
    println!("tools registered: (none built in; register via host integration)");
    Ok(())
}

async fn run_prompt(config: &convo_config::Config, prompt: Option<String>) -> anyhow::Result<()> {
    let text = match prompt {
        Some(p) => p,
        None => {
            let mut buf = String::new();
            io::stdin().read_to_string(&mut buf).context("reading stdin")?;
            buf
        }
    };

    let model = Arc::from(convo_model::from_config(&config.model)?);
    let tools = Arc::new(ToolRegistry::new());
    let policy = ToolPolicy::from_config(&config.tools);
    let context_window = config.model.max_tokens.unwrap_or(32_000) as usize;

    let mut agent = Agent::new(
        Transcript::new(context_window),
        tools,
        policy,
        model,
        config.agent.system_prompt.clone(),
        config.agent.max_tool_rounds,
    );

    let (tx, mut rx) = mpsc::channel(256);
    let drain = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            print_event(&event);
        }
    });

    agent.prompt(tx, vec![Message::user(text)]).await?;
    drain.await.ok();
    Ok(())
}

fn print_event(event: &AgentEvent) {
    match event {
        AgentEvent::MessageUpdate { text_delta: Some(delta), .. } => {
            print!("{delta}");
        }
        AgentEvent::MessageEnd { .. } => println!(),
        AgentEvent::ToolExecutionStart { call } => {
            eprintln!("[tool call: {} {}]", call.name, call.args);
        }
        AgentEvent::ToolExecutionEnd { tool_name, is_error, .. } => {
            eprintln!("[tool {tool_name} finished, error={is_error}]");
        }
        AgentEvent::TurnAbort { reason, phase, .. } => {
            eprintln!("[turn aborted: {reason:?} during {phase:?}]");
        }
        _ => {}
    }
}
