//! Three-run memory demo
//!
//! 1. `user_John` shares his name in conversation `session_789`
//! 2. the process "restarts"; `user_John` asks for his name in `session_101`
//! 3. `user_Jane` asks whether the agent knows her name in `session_202`
//!
//! State is keyed by user identity, so run 2 recalls what run 1 stored while
//! run 3 starts empty. Each run opens the SQLite file afresh.

use crate::app::{AppConfig, Runtime};
use anyhow::Context;
use recall_core::SqliteStore;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// One demo run
pub struct DemoRun {
    pub label: &'static str,
    pub user_id: &'static str,
    pub conversation: &'static str,
    pub message: &'static str,
}

pub const RUNS: [DemoRun; 3] = [
    DemoRun {
        label: "Run 1: user shares their name",
        user_id: "user_John",
        conversation: "session_789",
        message: "Hi, my name is John.",
    },
    DemoRun {
        label: "Run 2: same user asks in a NEW session",
        user_id: "user_John",
        conversation: "session_101",
        message: "What is my name?",
    },
    DemoRun {
        label: "Run 3: a different user in a NEW session",
        user_id: "user_Jane",
        conversation: "session_202",
        message: "Do you know my name?",
    },
];

/// Replay all runs against the database at `db_path`, returning each reply
pub async fn replay(db_path: &Path) -> anyhow::Result<Vec<String>> {
    let config = AppConfig::default();
    let mut replies = Vec::with_capacity(RUNS.len());

    for run in &RUNS {
        let store = Arc::new(
            SqliteStore::new(db_path)
                .await
                .context("Failed to open demo database")?,
        );
        let runtime = Runtime::from_store(store.clone(), &config)?;

        println!("\n[{}]", run.label);
        println!("  {} ({}) > {}", run.user_id, run.conversation, run.message);

        let response = runtime
            .turns
            .handle_turn(run.user_id, run.message)
            .await
            .map_err(super::report)?;
        println!("  agent > {}", response.text);
        println!(
            "  state version {}{}",
            response.version,
            if response.committed { " (written)" } else { "" }
        );

        replies.push(response.text);
        store.close().await;
    }

    Ok(replies)
}

pub async fn run() -> anyhow::Result<()> {
    println!("🧠 Recall demo");

    let dir = TempDir::new().context("Failed to create temporary directory")?;
    let db_path = dir.path().join("demo.db");
    println!("Using throwaway database at {}", db_path.display());

    replay(&db_path).await?;

    println!("\n✅ Demo finished; temporary database removed.");
    Ok(())
}
