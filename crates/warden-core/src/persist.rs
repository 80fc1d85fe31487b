use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::WardenError;
use crate::state::DesiredState;

/// Flags that survive a supervisor restart when a state file is configured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    pub desired: DesiredState,
    pub auto_restart_enabled: bool,
}

/// JSON file holding [`PersistedState`]
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when nothing has been saved yet
    pub async fn load(&self) -> Result<Option<PersistedState>, WardenError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(WardenError::Persistence(format!(
                    "cannot read {}: {e}",
                    self.path.display()
                )));
            }
        };

        serde_json::from_slice(&raw).map(Some).map_err(|e| {
            WardenError::Persistence(format!("cannot parse {}: {e}", self.path.display()))
        })
    }

    /// Write through a sibling temp file so a crash never leaves a torn file
    pub async fn save(&self, state: &PersistedState) -> Result<(), WardenError> {
        let json = serde_json::to_vec_pretty(state)
            .map_err(|e| WardenError::Persistence(e.to_string()))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                WardenError::Persistence(format!("cannot create {}: {e}", parent.display()))
            })?;
        }

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, json).await.map_err(|e| {
            WardenError::Persistence(format!("cannot write {}: {e}", tmp.display()))
        })?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| {
            WardenError::Persistence(format!("cannot replace {}: {e}", self.path.display()))
        })
    }
}
