//! Error types for the state-achieving engine.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::model::AttributeKind;

/// Errors from loading or storing the actual-state document.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read state file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse state file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode actual state: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to write state file {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A failure tied to one attribute during a reconciliation pass.
#[derive(Debug, Error)]
pub enum AttributeError {
    /// The microcontroller reported an error.
    #[error("{kind} attribute {id:?}: {source:#}")]
    Worker {
        id: String,
        kind: AttributeKind,
        #[source]
        source: anyhow::Error,
    },

    /// The attribute was updated in memory but could not be persisted.
    #[error("persisting {kind} attribute {id:?}: {source}")]
    Persist {
        id: String,
        kind: AttributeKind,
        #[source]
        source: StoreError,
    },
}

impl AttributeError {
    /// Id of the attribute the error belongs to.
    pub fn id(&self) -> &str {
        match self {
            Self::Worker { id, .. } | Self::Persist { id, .. } => id,
        }
    }
}

/// Every attribute failure of one reconciliation pass, in the order they
/// happened. Display prints one failure per line.
#[derive(Debug, Default)]
pub struct AchieveErrors(Vec<AttributeError>);

impl AchieveErrors {
    pub fn push(&mut self, error: AttributeError) {
        self.0.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AttributeError> {
        self.0.iter()
    }

    /// `Ok(())` when nothing failed.
    pub fn into_result(self) -> Result<(), Self> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for AchieveErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, error) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AchieveErrors {}

impl IntoIterator for AchieveErrors {
    type Item = AttributeError;
    type IntoIter = std::vec::IntoIter<AttributeError>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
