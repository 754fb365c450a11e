use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::coverage::evaluator::{candidate_transmitters, PointEvaluator};
use crate::coverage::{grid_dimensions, CoverageAnalysisParams, CoverageGrid, DetailLevel};
use crate::error::CoverageError;
use crate::geo::{meters_to_lat_degrees, meters_to_lon_degrees, GeoBounds, LatLon};
use crate::terrain::ElevationSource;

/// Zoom-level to cell size (meters), finest first.
const ZOOM_RESOLUTION: [(u8, f64); 6] = [
    (20, 20.0),
    (18, 50.0),
    (16, 100.0),
    (14, 200.0),
    (12, 400.0),
    (10, 700.0),
];

const LOWEST_ZOOM_RESOLUTION: f64 = 1000.0;

pub fn zoom_resolution(zoom_level: u8) -> f64 {
    ZOOM_RESOLUTION
        .iter()
        .find(|(min_zoom, _)| zoom_level >= *min_zoom)
        .map_or(LOWEST_ZOOM_RESOLUTION, |(_, res)| *res)
}

pub fn calculate_resolution(zoom_level: u8, detail_level: DetailLevel) -> f64 {
    zoom_resolution(zoom_level) * detail_level.multiplier()
}

/// Emitted by [`GridBuilder::build`] while it works.
#[derive(Debug, Clone)]
pub enum BuildEvent {
    /// Fractions never decrease within one build.
    Progress { fraction: f64, message: String },
    /// Snapshot holding every row finished so far.
    Partial(Arc<CoverageGrid>),
}

pub struct GridBuilder {
    terrain: Arc<dyn ElevationSource>,
    config: EngineConfig,
}

impl GridBuilder {
    pub fn new(terrain: Arc<dyn ElevationSource>, config: EngineConfig) -> Self {
        Self { terrain, config }
    }

    /// Computes every cell of the analysis region, row by row.
    ///
    /// `cancel` is checked before each cell; a cancelled build returns
    /// [`CoverageError::Cancelled`] and nothing it computed escapes.
    pub fn build(
        &self,
        params: &CoverageAnalysisParams,
        viewport: Option<&GeoBounds>,
        peers: &HashMap<String, LatLon>,
        cancel: &CancellationToken,
        events: &UnboundedSender<BuildEvent>,
    ) -> Result<CoverageGrid, CoverageError> {
        let start = Instant::now();
        if let Some(view) = viewport.filter(|view| params.bounds().intersection(view).is_none()) {
            warn!(?view, "viewport does not intersect the analysis area, ignoring it");
        }
        let region = params.region(viewport);
        params.check_grid_size(&region, &self.config.grid)?;

        let (rows, cols) = grid_dimensions(&region, params.resolution_m);
        let candidates = candidate_transmitters(params, peers);
        let rx_height_m = params.receiving_antenna_height_m();

        let evaluator = PointEvaluator::new(
            self.terrain.as_ref(),
            &self.config.radio,
            self.config.refraction,
            &self.config.terrain,
            &self.config.peers,
        );

        let lat_step = meters_to_lat_degrees(params.resolution_m);
        let lon_step = meters_to_lon_degrees(params.resolution_m, region.center().latitude);
        let partial_every = self.config.grid.partial_every_rows;

        debug!(rows, cols, transmitters = candidates.len(), resolution_m = params.resolution_m, "building coverage grid");

        let _ = events.send(BuildEvent::Progress {
            fraction: 0.0,
            message: format!("Analyzing {} x {} coverage grid", rows, cols),
        });

        let mut grid = CoverageGrid {
            bounds: region,
            resolution_m: params.resolution_m,
            rows,
            cols,
            points: Vec::with_capacity(rows),
            created_at: Utc::now(),
            zoom_level: params.zoom_level,
        };

        for row in 0..rows {
            let latitude = region.north - (row as f64 + 0.5) * lat_step;
            let mut cells = Vec::with_capacity(cols);

            for col in 0..cols {
                if cancel.is_cancelled() {
                    debug!(row, col, "coverage build cancelled");
                    return Err(CoverageError::Cancelled);
                }
                let target = LatLon::new(latitude, region.west + (col as f64 + 0.5) * lon_step);
                cells.push(evaluator.evaluate(target, &candidates, rx_height_m)?);
            }
            grid.points.push(cells);

            let done = row + 1;
            let _ = events.send(BuildEvent::Progress {
                fraction: done as f64 / rows as f64,
                message: format!("Analyzing coverage: row {} of {}", done, rows),
            });

            if partial_every > 0 && done % partial_every == 0 && done < rows {
                let _ = events.send(BuildEvent::Partial(Arc::new(grid.clone())));
            }
        }

        grid.created_at = Utc::now();
        debug!(cells = rows * cols, elapsed = ?start.elapsed(), "coverage grid complete");
        Ok(grid)
    }
}
