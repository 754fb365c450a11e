//! mesh-coverage CLI
//!
//! Runs one coverage analysis and writes the resulting grid as JSON.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mesh_coverage::geo::LatLon;
use mesh_coverage::io::{load_peers, NoPeers, PeerLocationProvider, StaticPeers};
use mesh_coverage::terrain::{ElevationSource, FlatTerrain, TerrainLoader, TerrainManager};
use mesh_coverage::{AnalysisRequest, CoverageEvent, CoverageOrchestrator, EngineConfig};

#[derive(Parser)]
#[command(name = "mesh-coverage")]
#[command(about = "Estimate radio coverage of a mesh node over terrain", long_about = None)]
struct Args {
    /// Transmitter latitude in decimal degrees
    #[arg(long, allow_negative_numbers = true)]
    lat: f64,

    /// Transmitter longitude in decimal degrees
    #[arg(long, allow_negative_numbers = true)]
    lon: f64,

    /// Analysis radius in meters
    #[arg(long, default_value = "5000")]
    radius: f64,

    /// Map zoom level, picks the cell size
    #[arg(long, default_value = "14")]
    zoom: u8,

    /// Detail level: low, medium or high
    #[arg(long, default_value = "medium")]
    detail: String,

    /// Override the cell size in meters
    #[arg(long)]
    resolution: Option<f64>,

    /// Transmitter antenna height above ground, feet
    #[arg(long, default_value = "6")]
    user_height_ft: f64,

    /// Receiver antenna height above ground, feet
    #[arg(long, default_value = "6")]
    rx_height_ft: f64,

    /// Peer list (.csv or .json) used for the peer extension
    #[arg(long)]
    peers: Option<PathBuf>,

    /// Include known peers as additional transmitters
    #[arg(long)]
    with_peers: bool,

    /// Directory holding SRTM .hgt tiles; flat terrain when omitted
    #[arg(long)]
    terrain_dir: Option<PathBuf>,

    /// Terrain tiles kept in memory
    #[arg(long, default_value = "16")]
    tile_cache: usize,

    /// Engine configuration (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Where to write the grid; stdout when omitted
    #[arg(long)]
    output: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_writer(std::io::stderr)
        .init();

    let config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    let terrain: Arc<dyn ElevationSource> = match &args.terrain_dir {
        Some(dir) => {
            info!(?dir, "using SRTM terrain");
            Arc::new(TerrainManager::new(TerrainLoader::new(dir.clone()), args.tile_cache))
        }
        None => {
            warn!("no terrain directory given, assuming flat terrain at sea level");
            Arc::new(FlatTerrain::default())
        }
    };

    let peers: Arc<dyn PeerLocationProvider> = match &args.peers {
        Some(path) => {
            let records = load_peers(path)?;
            info!(count = records.len(), "loaded peers");
            Arc::new(StaticPeers::new(records))
        }
        None => Arc::new(NoPeers),
    };

    let orchestrator =
        CoverageOrchestrator::new(config, terrain, peers, tokio::runtime::Handle::current())?;
    let mut events = orchestrator.subscribe();

    let mut request = AnalysisRequest::new(LatLon::new(args.lat, args.lon), args.radius, args.zoom)
        .with_detail_level(args.detail.as_str())
        .with_peer_extension(args.with_peers)
        .with_antenna_heights(args.user_height_ft, args.rx_height_ft);
    if let Some(resolution) = args.resolution {
        request = request.with_resolution(resolution);
    }

    orchestrator.start_analysis(request, None);

    let grid = loop {
        match events.recv().await {
            Ok(CoverageEvent::Progress { fraction, message, .. }) => {
                info!(percent = (fraction * 100.0).round() as u32, "{}", message);
            }
            Ok(CoverageEvent::Completed { grid, .. }) => break grid,
            Ok(CoverageEvent::Failed { message }) => bail!(message),
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "progress events dropped"),
            Err(RecvError::Closed) => bail!("orchestrator stopped before finishing"),
        }
    };

    if let Some(stats) = orchestrator.get_coverage_statistics() {
        info!(
            cells = stats.total_points,
            covered = stats.covered_points,
            strong = stats.strong_points,
            average = stats.average_probability,
            "coverage summary"
        );
    }

    let json = serde_json::to_string_pretty(grid.as_ref())?;
    match &args.output {
        Some(path) => {
            std::fs::write(path, json).with_context(|| format!("Failed to write {:?}", path))?;
            info!(?path, "grid written");
        }
        None => println!("{}", json),
    }

    Ok(())
}
