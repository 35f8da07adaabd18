//! Runtime wiring
//!
//! Builds the store, session manager and turn loop from configuration.

pub mod config;
pub mod loader;

pub use config::AppConfig;

use anyhow::{Context, Result};
use recall_core::{RuleResponder, SessionStateManager, StateStore, StoreBackend, TurnLoop};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Everything a CLI command needs
pub struct Runtime {
    pub turns: TurnLoop,
    pub manager: Arc<SessionStateManager>,
}

impl Runtime {
    /// Build from configuration, optionally overriding the data directory
    pub async fn build(config: &AppConfig, data_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.unwrap_or_else(|| config.data_dir());
        let backend = StoreBackend::from_config(&config.store, &data_dir)
            .await
            .context("Failed to open state store")?;
        let kind = backend.kind();

        let runtime = Self::from_store(Arc::new(backend), config)?;
        runtime
            .manager
            .health_check()
            .await
            .with_context(|| format!("{} state store is not healthy", kind))?;
        info!(backend = kind, data_dir = %data_dir.display(), "State store ready");

        Ok(runtime)
    }

    /// Wire a manager and turn loop around an existing store
    pub fn from_store(store: Arc<dyn StateStore>, config: &AppConfig) -> Result<Self> {
        let manager = Arc::new(SessionStateManager::with_config(
            store,
            config.session.clone(),
        ));
        let responder = RuleResponder::new().context("Failed to build responder")?;
        let turns = TurnLoop::with_config(
            Arc::clone(&manager),
            Arc::new(responder),
            config.agent.clone(),
        );

        Ok(Self { turns, manager })
    }
}
