use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::time::timeout;

use mesh_coverage::geo::{GeoBounds, LatLon};
use mesh_coverage::io::{NoPeers, PeerLocationProvider, PeerRecord, StaticPeers};
use mesh_coverage::terrain::{ElevationSource, FlatTerrain, TerrainError};
use mesh_coverage::{AnalysisRequest, CoverageAnalysisState, CoverageEvent, CoverageOrchestrator, EngineConfig};

struct SlowTerrain;

impl ElevationSource for SlowTerrain {
    fn elevation_at(&self, _loc: LatLon) -> Result<f64, TerrainError> {
        std::thread::sleep(Duration::from_millis(1));
        Ok(0.0)
    }
}

struct FailingTerrain;

impl ElevationSource for FailingTerrain {
    fn elevation_at(&self, _loc: LatLon) -> Result<f64, TerrainError> {
        Err(TerrainError::Unavailable("no DEM mounted".into()))
    }
}

fn orchestrator_with(
    config: EngineConfig,
    terrain: Arc<dyn ElevationSource>,
    peers: Arc<dyn PeerLocationProvider>,
) -> CoverageOrchestrator {
    CoverageOrchestrator::new(config, terrain, peers, tokio::runtime::Handle::current()).unwrap()
}

fn orchestrator(config: EngineConfig, terrain: Arc<dyn ElevationSource>) -> CoverageOrchestrator {
    orchestrator_with(config, terrain, Arc::new(NoPeers))
}

fn reference_request() -> AnalysisRequest {
    AnalysisRequest::new(LatLon::new(47.0, -122.0), 5000.0, 14).with_detail_level("medium")
}

/// 10 x 10 cells.
fn small_request(lat: f64, lon: f64) -> AnalysisRequest {
    AnalysisRequest::new(LatLon::new(lat, lon), 1000.0, 14).with_resolution(200.0)
}

async fn next_event(events: &mut broadcast::Receiver<CoverageEvent>) -> CoverageEvent {
    timeout(Duration::from_secs(60), events.recv())
        .await
        .expect("timed out waiting for coverage event")
        .expect("event channel closed")
}

/// Collects events up to and including the first `Completed` or `Failed`.
async fn until_settled(events: &mut broadcast::Receiver<CoverageEvent>) -> Vec<CoverageEvent> {
    let mut history = Vec::new();
    loop {
        let event = next_event(events).await;
        let done = matches!(event, CoverageEvent::Completed { .. } | CoverageEvent::Failed { .. });
        history.push(event);
        if done {
            return history;
        }
    }
}

fn drain(events: &mut broadcast::Receiver<CoverageEvent>) -> Vec<CoverageEvent> {
    let mut out = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => out.push(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return out,
            Err(TryRecvError::Lagged(_)) => continue,
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn analysis_runs_to_completion() {
    let orchestrator = orchestrator(EngineConfig::default(), Arc::new(FlatTerrain::default()));
    assert_eq!(orchestrator.state(), CoverageAnalysisState::Idle);
    assert_eq!(orchestrator.get_coverage_at_location(LatLon::new(47.0, -122.0)), 0.0);
    assert!(orchestrator.get_coverage_statistics().is_none());

    let mut events = orchestrator.subscribe();
    orchestrator.start_analysis(reference_request(), None);
    let history = until_settled(&mut events).await;

    assert!(matches!(history[0], CoverageEvent::Started { .. }));

    let fractions: Vec<f64> = history
        .iter()
        .filter_map(|e| match e {
            CoverageEvent::Progress { fraction, .. } => Some(*fraction),
            _ => None,
        })
        .collect();
    assert_eq!(fractions.first(), Some(&0.0));
    assert_eq!(fractions.last(), Some(&1.0));
    assert!(fractions.windows(2).all(|w| w[0] <= w[1]));

    let partial_rows: Vec<usize> = history
        .iter()
        .filter_map(|e| match e {
            CoverageEvent::Partial { grid, .. } => Some(grid.completed_rows()),
            _ => None,
        })
        .collect();
    assert_eq!(partial_rows, vec![5, 10, 15, 20, 25, 30]);

    let Some(CoverageEvent::Completed { job: Some(_), grid }) = history.last() else {
        panic!("expected a computed result, got {:?}", history.last());
    };
    assert_eq!((grid.rows, grid.cols), (34, 34));
    assert!(grid.is_complete());
    assert_eq!(orchestrator.state(), CoverageAnalysisState::Success(grid.clone()));
    assert!(orchestrator.partial_grid().is_none());
    assert!(!orchestrator.is_calculating());

    let stats = orchestrator.get_coverage_statistics().unwrap();
    assert_eq!(stats.total_points, 34 * 34);
    assert!(stats.max_probability <= 1.0 && stats.min_probability >= 0.0);

    let cell = grid.get(10, 12).unwrap();
    assert_eq!(orchestrator.get_coverage_at_location(cell.location()), cell.probability);
    assert_eq!(orchestrator.cache().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repeated_request_is_served_from_cache() {
    let orchestrator = orchestrator(EngineConfig::default(), Arc::new(FlatTerrain::default()));
    let mut events = orchestrator.subscribe();
    orchestrator.start_analysis(small_request(47.0, -122.0), None);
    until_settled(&mut events).await;
    let first = orchestrator.current_grid().unwrap();

    // Same key: the center moves by less than the rounding step.
    orchestrator.start_analysis(small_request(47.001, -122.001), None);

    assert!(!orchestrator.is_calculating());
    let CoverageAnalysisState::Success(grid) = orchestrator.state() else {
        panic!("expected an immediate cache hit");
    };
    assert!(Arc::ptr_eq(&grid, &first));
    assert!(matches!(next_event(&mut events).await, CoverageEvent::Completed { job: None, .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn finer_resolution_is_recomputed() {
    let orchestrator = orchestrator(EngineConfig::default(), Arc::new(FlatTerrain::default()));
    let mut events = orchestrator.subscribe();
    orchestrator.start_analysis(small_request(47.0, -122.0), None);
    until_settled(&mut events).await;
    assert_eq!(orchestrator.current_grid().unwrap().resolution_m, 200.0);

    orchestrator.start_analysis(small_request(47.0, -122.0).with_resolution(100.0), None);
    assert!(matches!(next_event(&mut events).await, CoverageEvent::Started { .. }));

    let history = until_settled(&mut events).await;
    assert!(matches!(history.last(), Some(CoverageEvent::Completed { job: Some(_), .. })));
    let grid = orchestrator.current_grid().unwrap();
    assert_eq!(grid.resolution_m, 100.0);
    assert_eq!((grid.rows, grid.cols), (20, 20));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn expired_cache_entry_is_recomputed() {
    let mut config = EngineConfig::default();
    config.cache.ttl_ms = 1;
    let orchestrator = orchestrator(config, Arc::new(FlatTerrain::default()));
    let mut events = orchestrator.subscribe();

    orchestrator.start_analysis(small_request(47.0, -122.0), None);
    until_settled(&mut events).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    orchestrator.start_analysis(small_request(47.0, -122.0), None);
    assert!(matches!(next_event(&mut events).await, CoverageEvent::Started { .. }));

    let history = until_settled(&mut events).await;
    assert!(matches!(history.last(), Some(CoverageEvent::Completed { job: Some(_), .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_during_calculation_is_ignored() {
    let orchestrator = orchestrator(EngineConfig::default(), Arc::new(SlowTerrain));
    let mut events = orchestrator.subscribe();

    orchestrator.start_analysis(small_request(47.0, -122.0), None);
    assert!(orchestrator.is_calculating());
    orchestrator.start_analysis(small_request(10.0, 10.0), None);
    orchestrator.start_analysis(AnalysisRequest { center: None, ..small_request(0.0, 0.0) }, None);
    assert!(orchestrator.state().is_busy());

    let history = until_settled(&mut events).await;
    let started = history.iter().filter(|e| matches!(e, CoverageEvent::Started { .. })).count();
    assert_eq!(started, 1);
    assert!(!history.iter().any(|e| matches!(e, CoverageEvent::Failed { .. })));

    let grid = orchestrator.current_grid().unwrap();
    let center = grid.bounds.center();
    assert!((center.latitude - 47.0).abs() < 1e-9);
    assert!((center.longitude + 122.0).abs() < 1e-9);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn clear_analysis_cancels_running_job() {
    let orchestrator = orchestrator(EngineConfig::default(), Arc::new(SlowTerrain));
    let mut events = orchestrator.subscribe();

    orchestrator.start_analysis(small_request(47.0, -122.0), None);
    assert!(matches!(next_event(&mut events).await, CoverageEvent::Started { .. }));
    assert!(matches!(next_event(&mut events).await, CoverageEvent::Progress { .. }));

    orchestrator.clear_analysis();
    assert_eq!(orchestrator.state(), CoverageAnalysisState::Idle);
    assert!(!orchestrator.is_calculating());

    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(orchestrator.state(), CoverageAnalysisState::Idle);
    assert!(orchestrator.current_grid().is_none());
    assert!(orchestrator.partial_grid().is_none());
    assert!(orchestrator.cache().is_empty());

    let after = drain(&mut events);
    let cleared = after
        .iter()
        .position(|e| matches!(e, CoverageEvent::Cleared))
        .expect("clear_analysis emits Cleared");
    assert_eq!(after.len(), cleared + 1, "events after cancellation: {:?}", &after[cleared..]);

    // A new analysis may start right away.
    orchestrator.start_analysis(small_request(47.0, -122.0), None);
    assert!(orchestrator.is_calculating());
    orchestrator.clear_analysis();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_center_is_an_error() {
    let orchestrator = orchestrator(EngineConfig::default(), Arc::new(FlatTerrain::default()));
    let mut events = orchestrator.subscribe();

    orchestrator.start_analysis(AnalysisRequest { center: None, ..reference_request() }, None);

    assert_eq!(orchestrator.state(), CoverageAnalysisState::Error("Missing center point".into()));
    assert!(!orchestrator.is_calculating());
    assert!(matches!(next_event(&mut events).await, CoverageEvent::Failed { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversized_request_is_rejected_up_front() {
    let orchestrator = orchestrator(EngineConfig::default(), Arc::new(FlatTerrain::default()));

    orchestrator.start_analysis(reference_request().with_resolution(1.0), None);

    let CoverageAnalysisState::Error(message) = orchestrator.state() else {
        panic!("expected an error state");
    };
    assert!(message.starts_with("Invalid request"));
    assert!(!orchestrator.is_calculating());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn terrain_failure_surfaces_as_error() {
    let orchestrator = orchestrator(EngineConfig::default(), Arc::new(FailingTerrain));
    let mut events = orchestrator.subscribe();

    orchestrator.start_analysis(small_request(47.0, -122.0), None);
    let history = until_settled(&mut events).await;

    let Some(CoverageEvent::Failed { message }) = history.last() else {
        panic!("expected failure, got {:?}", history.last());
    };
    assert!(message.starts_with("Coverage analysis failed"));
    assert!(message.contains("no DEM mounted"));
    assert_eq!(orchestrator.state(), CoverageAnalysisState::Error(message.clone()));
    assert!(!orchestrator.is_calculating());
    assert!(orchestrator.cache().is_empty());

    orchestrator.start_analysis(small_request(47.0, -122.0), None);
    assert!(matches!(next_event(&mut events).await, CoverageEvent::Started { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn viewport_grid_is_clipped_and_not_cached() {
    let orchestrator = orchestrator(EngineConfig::default(), Arc::new(FlatTerrain::default()));
    let mut events = orchestrator.subscribe();

    let full = GeoBounds::around(LatLon::new(47.0, -122.0), 1000.0);
    let viewport = GeoBounds { south: full.center().latitude, ..full };
    orchestrator.start_analysis(small_request(47.0, -122.0), Some(viewport));
    until_settled(&mut events).await;

    let grid = orchestrator.current_grid().unwrap();
    assert_eq!((grid.rows, grid.cols), (5, 10));
    assert!(orchestrator.cache().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn peers_extend_coverage() {
    let peers = Arc::new(StaticPeers::new(vec![
        PeerRecord { id: "relay-1".into(), latitude: 47.008, longitude: -122.0 },
        PeerRecord { id: "far-away".into(), latitude: 49.5, longitude: -122.0 },
    ]));
    let orchestrator = orchestrator_with(EngineConfig::default(), Arc::new(FlatTerrain::default()), peers);
    let mut events = orchestrator.subscribe();

    orchestrator.start_analysis(small_request(47.0, -122.0).with_peer_extension(true), None);
    until_settled(&mut events).await;

    let grid = orchestrator.current_grid().unwrap();
    let contributors: Vec<&String> = grid.cells().flat_map(|p| p.contributors.iter()).collect();
    assert!(contributors.iter().any(|id| id.as_str() == "relay-1"));
    assert!(!contributors.iter().any(|id| id.as_str() == "far-away"));

    let near_relay = grid.nearest(LatLon::new(47.008, -122.0)).unwrap();
    assert!(near_relay.contributors.iter().any(|id| id == "relay-1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn clear_cache_forgets_results() {
    let orchestrator = orchestrator(EngineConfig::default(), Arc::new(FlatTerrain::default()));
    let mut events = orchestrator.subscribe();

    orchestrator.start_analysis(small_request(47.0, -122.0), None);
    until_settled(&mut events).await;
    assert_eq!(orchestrator.cache().len(), 1);

    orchestrator.clear_cache();
    assert!(orchestrator.cache().is_empty());
    // The displayed result survives a cache flush.
    assert!(orchestrator.current_grid().is_some());
}
