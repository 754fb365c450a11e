pub mod geo;
pub mod io;
pub mod terrain;
pub mod physics;
pub mod coverage;
pub mod cache;
pub mod config;
pub mod error;
pub mod service;

pub use config::EngineConfig;
pub use coverage::{AnalysisRequest, CoverageGrid, CoveragePoint, CoverageStatistics, DetailLevel};
pub use error::CoverageError;
pub use service::{CoverageAnalysisState, CoverageEvent, CoverageOrchestrator};
