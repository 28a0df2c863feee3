//! JSON file persistence for the actual-state document.
//!
//! The whole document is rewritten on every store. Writes go to a sibling
//! temporary file that is renamed over the target, so readers only ever see
//! a complete document.

use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::StoreError;
use crate::model::ActualState;

/// File name used when no state path is configured.
pub const DEFAULT_STATE_FILE: &str = "tether-actual-state.json";

/// Location of the persisted actual-state document.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document. A missing file is an empty state.
    pub async fn load(&self) -> Result<ActualState, StoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No persisted state, starting empty");
                return Ok(ActualState::new());
            }
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        serde_json::from_slice(&bytes).map_err(|source| StoreError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    /// Overwrite the document with `state`.
    pub async fn store(&self, state: &ActualState) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(state).map_err(StoreError::Encode)?;
        let write_err = |source| StoreError::Write {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
        }

        let temp_path = self.temp_path();
        tokio::fs::write(&temp_path, &json)
            .await
            .map_err(write_err)?;
        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(write_err)?;

        debug!(
            path = %self.path.display(),
            attributes = state.len(),
            bytes = json.len(),
            "Stored actual state"
        );
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| OsString::from(DEFAULT_STATE_FILE));
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}
