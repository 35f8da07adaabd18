//! CLI module for Recall
//!
//! Provides commands:
//! - `chat`: run one turn and print the reply
//! - `repl`: interactive turns from stdin
//! - `show`: print a session's stored state
//! - `forget`: delete a session's stored state
//! - `demo`: replay the three-session memory scenario on a throwaway store

use crate::app::{loader, Runtime};
use clap::{Parser, Subcommand};
use recall_core::format_error_for_cli;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub mod chat;
pub mod demo;
pub mod inspect;

/// Recall CLI
#[derive(Parser, Debug)]
#[command(name = "recall")]
#[command(about = "Durable session memory for conversational agents")]
#[command(version)]
pub struct Cli {
    /// Override the data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Send one message and print the reply
    Chat {
        /// Session (user identity) to talk as
        #[arg(short, long)]
        session: String,
        /// Message text
        #[arg(required = true, num_args = 1..)]
        message: Vec<String>,
    },
    /// Chat interactively; one line per turn
    Repl {
        /// Session (user identity) to talk as
        #[arg(short, long)]
        session: String,
    },
    /// Print stored state for a session
    Show {
        /// Session id
        session: String,
    },
    /// Delete stored state for a session
    Forget {
        /// Session id
        session: String,
    },
    /// List sessions with stored state
    List,
    /// Replay the name-memory scenario on a temporary store
    Demo,
}

/// Run the CLI command
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let command = match cli.command {
        Some(Commands::Demo) => return demo::run().await,
        Some(command) => command,
        None => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            cmd.print_help()?;
            println!();
            return Ok(());
        }
    };

    let config = loader::load_config()?;
    debug!(?config, "Configuration loaded");
    let runtime = Runtime::build(&config, cli.data_dir).await?;

    match command {
        Commands::Chat { session, message } => {
            chat::run_once(&runtime, &session, &message.join(" "), &ctrl_c_token()).await
        }
        Commands::Repl { session } => chat::run_repl(&runtime, &session).await,
        Commands::Show { session } => inspect::show(&runtime, &session).await,
        Commands::Forget { session } => inspect::forget(&runtime, &session).await,
        Commands::List => inspect::list(&runtime).await,
        Commands::Demo => demo::run().await,
    }
}

/// Token cancelled on Ctrl-C
pub fn ctrl_c_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });
    token
}

/// Turn a core error into a CLI error with a friendly message
pub fn report(error: recall_core::Error) -> anyhow::Error {
    anyhow::anyhow!(format_error_for_cli(&error).trim_end().to_string())
}
