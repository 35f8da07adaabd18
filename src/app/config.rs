//! Application configuration types

use recall_core::{ManagerConfig, StoreBackendConfig, TurnConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Directory holding local state; `~/.recall` when unset
    #[serde(default)]
    pub data_dir: Option<String>,
    #[serde(default)]
    pub store: StoreBackendConfig,
    #[serde(default)]
    pub session: ManagerConfig,
    #[serde(default)]
    pub agent: TurnConfig,
}

impl AppConfig {
    /// Resolve the data directory
    pub fn data_dir(&self) -> PathBuf {
        match &self.data_dir {
            Some(dir) => PathBuf::from(dir),
            None => dirs::home_dir()
                .map(|home| home.join(".recall"))
                .unwrap_or_else(|| PathBuf::from(".recall")),
        }
    }
}
