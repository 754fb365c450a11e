use serde::{Deserialize, Serialize};

use super::{ElevationSource, TerrainError};
use crate::geo::{calculate_geodesic, intermediate_point, LatLon};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TerrainPoint {
    pub location: LatLon,
    pub elevation: f64,
    /// Cumulative distance from the start of the path, meters.
    pub distance: f64,
}

/// Elevation sampled along the great circle between two points.
///
/// Built once per path and shared by the occlusion and Fresnel checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerrainProfile {
    pub points: Vec<TerrainPoint>,
    pub total_distance: f64,
    pub min_elevation: f64,
    pub max_elevation: f64,
}

impl TerrainProfile {
    /// Samples `source` every `interval_m` meters from `from` to `to`.
    ///
    /// Both endpoints are always included. A path shorter than one interval
    /// yields just the two endpoints.
    pub fn sample<S: ElevationSource + ?Sized>(
        source: &S,
        from: LatLon,
        to: LatLon,
        interval_m: f64,
    ) -> Result<Self, TerrainError> {
        let (total_distance, _) = calculate_geodesic(from, to);
        let segments = if interval_m > 0.0 {
            ((total_distance / interval_m).ceil() as usize).max(1)
        } else {
            1
        };

        let mut points = Vec::with_capacity(segments + 1);
        for i in 0..=segments {
            let fraction = i as f64 / segments as f64;
            let location = match i {
                0 => from,
                i if i == segments => to,
                _ => intermediate_point(from, to, fraction),
            };
            points.push(TerrainPoint {
                location,
                elevation: source.elevation_at(location)?,
                distance: total_distance * fraction,
            });
        }

        Ok(Self::from_points(points, total_distance))
    }

    pub fn from_points(points: Vec<TerrainPoint>, total_distance: f64) -> Self {
        let (min_elevation, max_elevation) = points.iter().fold(
            (f64::INFINITY, f64::NEG_INFINITY),
            |(lo, hi), p| (lo.min(p.elevation), hi.max(p.elevation)),
        );
        Self {
            points,
            total_distance,
            min_elevation,
            max_elevation,
        }
    }

    pub fn start(&self) -> Option<&TerrainPoint> {
        self.points.first()
    }

    pub fn end(&self) -> Option<&TerrainPoint> {
        self.points.last()
    }
}
