use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{GridConfig, PeerConfig};
use crate::error::CoverageError;
use crate::geo::{feet_to_meters, GeoBounds, LatLon};

pub mod evaluator;
pub mod grid;
pub mod stats;

pub use evaluator::PointEvaluator;
pub use grid::{calculate_resolution, BuildEvent, GridBuilder};
pub use stats::CoverageStatistics;

pub const DEFAULT_ANTENNA_HEIGHT_FEET: f64 = 6.0;

/// Id of the requesting user's own transmitter in contributor lists.
pub const PRIMARY_TRANSMITTER_ID: &str = "self";

/// User-facing coarseness knob applied on top of the zoom-derived cell size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum DetailLevel {
    Low,
    #[default]
    Medium,
    High,
}

impl DetailLevel {
    pub fn multiplier(self) -> f64 {
        match self {
            DetailLevel::Low => 3.0,
            DetailLevel::Medium => 1.5,
            DetailLevel::High => 1.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DetailLevel::Low => "low",
            DetailLevel::Medium => "medium",
            DetailLevel::High => "high",
        }
    }
}

/// Unrecognized names fall back to `Medium`.
impl From<&str> for DetailLevel {
    fn from(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => DetailLevel::Low,
            "high" => DetailLevel::High,
            _ => DetailLevel::Medium,
        }
    }
}

impl From<String> for DetailLevel {
    fn from(value: String) -> Self {
        DetailLevel::from(value.as_str())
    }
}

impl fmt::Display for DetailLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A coverage request as issued by the UI layer. Nothing is checked until
/// it is turned into [`CoverageAnalysisParams`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub center: Option<LatLon>,
    pub radius_m: f64,
    pub zoom_level: u8,
    pub include_peer_extension: bool,
    /// Explicit cell size; derived from zoom and detail level when absent.
    pub resolution_m: Option<f64>,
    pub detail_level: DetailLevel,
    pub user_antenna_height_feet: f64,
    pub receiving_antenna_height_feet: f64,
}

impl AnalysisRequest {
    pub fn new(center: LatLon, radius_m: f64, zoom_level: u8) -> Self {
        Self {
            center: Some(center),
            radius_m,
            zoom_level,
            include_peer_extension: false,
            resolution_m: None,
            detail_level: DetailLevel::Medium,
            user_antenna_height_feet: DEFAULT_ANTENNA_HEIGHT_FEET,
            receiving_antenna_height_feet: DEFAULT_ANTENNA_HEIGHT_FEET,
        }
    }

    pub fn with_detail_level(mut self, detail_level: impl Into<DetailLevel>) -> Self {
        self.detail_level = detail_level.into();
        self
    }

    pub fn with_peer_extension(mut self, enabled: bool) -> Self {
        self.include_peer_extension = enabled;
        self
    }

    pub fn with_resolution(mut self, resolution_m: f64) -> Self {
        self.resolution_m = Some(resolution_m);
        self
    }

    pub fn with_antenna_heights(mut self, user_feet: f64, receiving_feet: f64) -> Self {
        self.user_antenna_height_feet = user_feet;
        self.receiving_antenna_height_feet = receiving_feet;
        self
    }
}

/// Validated, immutable parameters of one analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageAnalysisParams {
    pub center: LatLon,
    pub radius_m: f64,
    pub resolution_m: f64,
    pub zoom_level: u8,
    pub detail_level: DetailLevel,
    pub include_peer_extension: bool,
    pub user_antenna_height_feet: f64,
    pub receiving_antenna_height_feet: f64,
    pub max_peer_distance_m: f64,
}

impl CoverageAnalysisParams {
    pub fn from_request(request: &AnalysisRequest, peers: &PeerConfig) -> Result<Self, CoverageError> {
        let center = request.center.ok_or(CoverageError::MissingCenter)?;
        let invalid = |msg: String| Err(CoverageError::InvalidRequest(msg));

        if !center.is_valid() {
            return invalid(format!(
                "center ({}, {}) is not a valid coordinate",
                center.latitude, center.longitude
            ));
        }
        if !(request.radius_m.is_finite() && request.radius_m > 0.0) {
            return invalid(format!("radius must be positive, got {}", request.radius_m));
        }
        for (name, feet) in [
            ("user antenna height", request.user_antenna_height_feet),
            ("receiving antenna height", request.receiving_antenna_height_feet),
        ] {
            if !(feet.is_finite() && feet >= 0.0) {
                return invalid(format!("{} must not be negative, got {}", name, feet));
            }
        }

        let resolution_m = match request.resolution_m {
            Some(r) if r.is_finite() && r > 0.0 => r,
            Some(r) => return invalid(format!("resolution must be positive, got {}", r)),
            None => calculate_resolution(request.zoom_level, request.detail_level),
        };

        Ok(Self {
            center,
            radius_m: request.radius_m,
            resolution_m,
            zoom_level: request.zoom_level,
            detail_level: request.detail_level,
            include_peer_extension: request.include_peer_extension,
            user_antenna_height_feet: request.user_antenna_height_feet,
            receiving_antenna_height_feet: request.receiving_antenna_height_feet,
            max_peer_distance_m: peers.max_peer_distance_m,
        })
    }

    pub fn user_antenna_height_m(&self) -> f64 {
        feet_to_meters(self.user_antenna_height_feet)
    }

    pub fn receiving_antenna_height_m(&self) -> f64 {
        feet_to_meters(self.receiving_antenna_height_feet)
    }

    /// The full analysis square.
    pub fn bounds(&self) -> GeoBounds {
        GeoBounds::around(self.center, self.radius_m)
    }

    /// Region actually computed: the analysis square clipped to the
    /// viewport, or the whole square when the viewport misses it.
    pub fn region(&self, viewport: Option<&GeoBounds>) -> GeoBounds {
        let full = self.bounds();
        viewport.and_then(|view| full.intersection(view)).unwrap_or(full)
    }

    pub fn check_grid_size(&self, region: &GeoBounds, grid: &GridConfig) -> Result<(), CoverageError> {
        let (rows, cols) = grid_dimensions(region, self.resolution_m);
        if rows.saturating_mul(cols) > grid.max_cells {
            return Err(CoverageError::InvalidRequest(format!(
                "{}x{} cells at {} m exceeds the {} cell limit",
                rows, cols, self.resolution_m, grid.max_cells
            )));
        }
        Ok(())
    }
}

/// A transmitter that may cover a cell: the user or a relay peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transmitter {
    pub id: String,
    pub location: LatLon,
    pub antenna_height_m: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoveragePoint {
    pub latitude: f64,
    pub longitude: f64,
    pub probability: f64,
    pub signal_strength_dbm: f64,
    pub fresnel_blockage: f64,
    pub terrain_occlusion: f64,
    pub contributors: Vec<String>,
    /// Distance to the nearest contributing transmitter; `None` when no
    /// transmitter reaches the contribution threshold.
    pub nearest_contributor_m: Option<f64>,
}

impl CoveragePoint {
    pub fn new(
        location: LatLon,
        probability: f64,
        signal_strength_dbm: f64,
        fresnel_blockage: f64,
        terrain_occlusion: f64,
        contributors: Vec<String>,
        nearest_contributor_m: Option<f64>,
    ) -> Self {
        Self {
            latitude: location.latitude,
            longitude: location.longitude,
            probability: clamp_unit(probability),
            signal_strength_dbm,
            fresnel_blockage: clamp_unit(fresnel_blockage),
            terrain_occlusion: clamp_unit(terrain_occlusion),
            contributors,
            nearest_contributor_m,
        }
    }

    pub fn location(&self) -> LatLon {
        LatLon::new(self.latitude, self.longitude)
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) }
}

/// Cells needed to span `extent_m` at `resolution_m`; at least one.
pub fn cells_along(extent_m: f64, resolution_m: f64) -> usize {
    // Degree round trips leave ~1e-9 noise on exact multiples.
    (((extent_m / resolution_m) - 1e-6).ceil() as usize).max(1)
}

pub fn grid_dimensions(bounds: &GeoBounds, resolution_m: f64) -> (usize, usize) {
    (
        cells_along(bounds.height_m(), resolution_m),
        cells_along(bounds.width_m(), resolution_m),
    )
}

/// Row-major grid of coverage estimates, row 0 at the north edge.
///
/// A partial grid (streamed while a job runs) declares the final `rows` x
/// `cols` but holds only its completed leading rows in `points`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageGrid {
    pub bounds: GeoBounds,
    pub resolution_m: f64,
    pub rows: usize,
    pub cols: usize,
    pub points: Vec<Vec<CoveragePoint>>,
    pub created_at: DateTime<Utc>,
    pub zoom_level: u8,
}

impl CoverageGrid {
    pub fn is_complete(&self) -> bool {
        self.points.len() == self.rows
    }

    pub fn completed_rows(&self) -> usize {
        self.points.len()
    }

    pub fn cells(&self) -> impl Iterator<Item = &CoveragePoint> {
        self.points.iter().flatten()
    }

    pub fn cell_count(&self) -> usize {
        self.points.iter().map(Vec::len).sum()
    }

    pub fn get(&self, row: usize, col: usize) -> Option<&CoveragePoint> {
        self.points.get(row).and_then(|r| r.get(col))
    }

    /// Closest computed cell by great-circle distance.
    pub fn nearest(&self, location: LatLon) -> Option<&CoveragePoint> {
        self.cells()
            .map(|p| (p, p.location().distance_to(location)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(p, _)| p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detail_level_deserializes_leniently() {
        let level: DetailLevel = serde_json::from_str("\"HIGH\"").unwrap();
        assert_eq!(level, DetailLevel::High);
        let level: DetailLevel = serde_json::from_str("\"ultra\"").unwrap();
        assert_eq!(level, DetailLevel::Medium);

        assert_eq!(serde_json::to_string(&DetailLevel::Low).unwrap(), "\"low\"");
    }

    #[test]
    fn request_with_unknown_detail_level_still_parses() {
        let mut json = serde_json::to_value(AnalysisRequest::new(LatLon::new(47.0, -122.0), 5000.0, 14)).unwrap();
        json["detail_level"] = "ultra".into();

        let request: AnalysisRequest = serde_json::from_value(json).unwrap();
        assert_eq!(request.detail_level, DetailLevel::Medium);
    }
}
