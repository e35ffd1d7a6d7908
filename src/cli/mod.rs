//! Command-line interface.

mod compose;
mod config;
mod serve;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "chatgate", version, about = "Streaming chat gateway for LLM backends")]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub(crate) enum Commands {
    /// Run the HTTP gateway.
    Serve {
        /// Config file (default: $CHATGATE_CONFIG or ~/.chatgate/config.json).
        #[arg(long, short)]
        config: Option<PathBuf>,
        /// Override the bind address.
        #[arg(long)]
        bind: Option<String>,
        /// Override the listen port.
        #[arg(long, short)]
        port: Option<u16>,
    },
    /// Print the effective configuration with secrets redacted.
    Config {
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Print the composite prompt for the given inputs without calling a backend.
    Compose {
        /// The user's message.
        #[arg(long, short)]
        message: String,
        /// User context as a JSON document.
        #[arg(long)]
        context_json: Option<String>,
        /// Retrieved reference snippet; repeat for several.
        #[arg(long = "doc")]
        docs: Vec<String>,
        /// System prompt (default: the built-in prompt).
        #[arg(long)]
        system: Option<String>,
    },
}

pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Serve { config, bind, port } => serve::cmd_serve(config, bind, port).await,
        Commands::Config { config: path } => config::cmd_config(path),
        Commands::Compose {
            message,
            context_json,
            docs,
            system,
        } => compose::cmd_compose(message, context_json, docs, system),
    }
}
