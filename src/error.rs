use thiserror::Error;

use crate::terrain::TerrainError;

#[derive(Debug, Error)]
pub enum CoverageError {
    #[error("Missing center point")]
    MissingCenter,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Coverage analysis failed: {0}")]
    Terrain(#[from] TerrainError),

    #[error("Analysis cancelled")]
    Cancelled,

    #[error("Analysis failed: {0}")]
    Unexpected(String),
}

impl CoverageError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
