//! Sync configuration
//!
//! Settings come from a JSON file, from the environment (a `.env` file is
//! honored), or both: environment values override the file.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::RetryPolicy;
use crate::sync::Endpoint;

pub const ENV_URL: &str = "DOCSYNC_URL";
pub const ENV_ROOM: &str = "DOCSYNC_ROOM";
pub const ENV_LOG: &str = "DOCSYNC_LOG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Websocket server, e.g. `ws://localhost:1234`
    pub url: String,

    /// Channel of the root document
    pub room: String,

    /// Backoff used when a connection drops
    pub reconnect: RetryPolicy,

    /// `tracing` filter directive used when `RUST_LOG` is unset
    pub log_filter: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:1234".to_string(),
            room: "docsync".to_string(),
            reconnect: RetryPolicy::default(),
            log_filter: "info".to_string(),
        }
    }
}

impl SyncConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("invalid config {}", path.display()))
    }

    /// Defaults overridden by environment variables
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Override fields from `lookup`, keyed by the `DOCSYNC_*` names
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_URL) {
            self.url = url;
        }
        if let Some(room) = lookup(ENV_ROOM) {
            self.room = room;
        }
        if let Some(filter) = lookup(ENV_LOG) {
            self.log_filter = filter;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.room.trim().is_empty() {
            return Err(anyhow!("room must not be empty"));
        }
        let url = url::Url::parse(&self.url)
            .with_context(|| format!("invalid server url: {}", self.url))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(anyhow!(
                "server url must use ws:// or wss://, got {}",
                self.url
            ));
        }
        if self.reconnect.backoff_multiplier < 1.0 {
            return Err(anyhow!("reconnect.backoff_multiplier must be at least 1.0"));
        }
        Ok(())
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.url.clone(), self.room.clone())
    }
}
