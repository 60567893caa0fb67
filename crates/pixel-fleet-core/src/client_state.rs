//! Locally persisted operator state.
//!
//! Survives restarts: the last coordinator address, the preview panel height
//! and the last agent selection. A missing or corrupted file yields defaults.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::data_dir;
use crate::error::Result;

/// Preview panel height used when nothing has been saved yet.
pub const DEFAULT_PANEL_HEIGHT: u32 = 360;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientState {
    #[serde(default)]
    pub coordinator_url: Option<String>,
    #[serde(default = "default_panel_height")]
    pub preview_panel_height: u32,
    #[serde(default)]
    pub selected_agents: Vec<String>,
}

fn default_panel_height() -> u32 {
    DEFAULT_PANEL_HEIGHT
}

impl Default for ClientState {
    fn default() -> Self {
        Self {
            coordinator_url: None,
            preview_panel_height: DEFAULT_PANEL_HEIGHT,
            selected_agents: Vec::new(),
        }
    }
}

/// JSON file backing [`ClientState`].
#[derive(Debug, Clone)]
pub struct ClientStateStore {
    path: PathBuf,
}

impl ClientStateStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn default_path() -> PathBuf {
        data_dir().join("state.json")
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn load(&self) -> ClientState {
        if !self.path.exists() {
            return ClientState::default();
        }
        let parsed = std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok());
        match parsed {
            Some(state) => state,
            None => {
                warn!(path = %self.path.display(), "Client state unreadable, using defaults");
                ClientState::default()
            }
        }
    }

    pub fn save(&self, state: &ClientState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(state)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }

    /// Load, apply `f`, and write back only if something changed.
    pub fn update<F>(&self, f: F) -> Result<ClientState>
    where
        F: FnOnce(&mut ClientState),
    {
        let mut state = self.load();
        let before = state.clone();
        f(&mut state);
        if state != before {
            self.save(&state)?;
        }
        Ok(state)
    }
}
