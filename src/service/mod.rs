//! Public entry point: request coverage, observe its progress, query it.
//!
//! At most one grid build runs per orchestrator. Each build gets a job id
//! and a [`CancellationToken`]; every state change coming back from a build
//! is checked against the active job id under the same lock that
//! `clear_analysis` takes, so a cancelled or superseded build can never
//! publish after the fact.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, CacheLookup, CoverageCache};
use crate::config::EngineConfig;
use crate::coverage::{
    AnalysisRequest, BuildEvent, CoverageAnalysisParams, CoverageGrid, CoverageStatistics, GridBuilder,
};
use crate::error::CoverageError;
use crate::geo::{GeoBounds, LatLon};
use crate::io::PeerLocationProvider;
use crate::terrain::{CachedElevation, ElevationSource};

#[derive(Debug, Clone, PartialEq)]
pub enum CoverageAnalysisState {
    Idle,
    Calculating,
    Progress { fraction: f64, message: String },
    Success(Arc<CoverageGrid>),
    Error(String),
}

impl CoverageAnalysisState {
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Calculating | Self::Progress { .. })
    }
}

/// Ordered notifications for one orchestrator, in the order they happened.
#[derive(Debug, Clone)]
pub enum CoverageEvent {
    Started { job: u64 },
    Progress { job: u64, fraction: f64, message: String },
    Partial { job: u64, grid: Arc<CoverageGrid> },
    /// `job` is `None` when the grid came straight from the cache.
    Completed { job: Option<u64>, grid: Arc<CoverageGrid> },
    Failed { message: String },
    Cleared,
}

struct ActiveJob {
    id: u64,
    cancel: CancellationToken,
    started: Instant,
}

struct Shared {
    cache: Arc<CoverageCache>,
    builder: Arc<GridBuilder>,
    peers: Arc<dyn PeerLocationProvider>,
    config: EngineConfig,
    active: Mutex<Option<ActiveJob>>,
    state_tx: watch::Sender<CoverageAnalysisState>,
    grid_tx: watch::Sender<Option<Arc<CoverageGrid>>>,
    partial_tx: watch::Sender<Option<Arc<CoverageGrid>>>,
    events_tx: broadcast::Sender<CoverageEvent>,
}

pub struct CoverageOrchestrator {
    shared: Arc<Shared>,
    runtime: Handle,
    next_job: AtomicU64,
}

impl CoverageOrchestrator {
    /// Builds an orchestrator with its own cache sized from `config.cache`.
    ///
    /// Grid builds run as blocking tasks on `runtime`.
    pub fn new(
        config: EngineConfig,
        terrain: Arc<dyn ElevationSource>,
        peers: Arc<dyn PeerLocationProvider>,
        runtime: Handle,
    ) -> Result<Self, CoverageError> {
        let cache = Arc::new(CoverageCache::new(&config.cache));
        Self::with_cache(config, terrain, peers, cache, runtime)
    }

    pub fn with_cache(
        config: EngineConfig,
        terrain: Arc<dyn ElevationSource>,
        peers: Arc<dyn PeerLocationProvider>,
        cache: Arc<CoverageCache>,
        runtime: Handle,
    ) -> Result<Self, CoverageError> {
        config.validate()?;

        let terrain: Arc<dyn ElevationSource> = Arc::new(CachedElevation::new(
            terrain,
            config.terrain.elevation_cache_entries,
            config.terrain.elevation_cache_precision_deg,
        ));
        let (events_tx, _) = broadcast::channel(config.grid.event_capacity);

        let shared = Shared {
            cache,
            builder: Arc::new(GridBuilder::new(terrain, config.clone())),
            peers,
            config,
            active: Mutex::new(None),
            state_tx: watch::Sender::new(CoverageAnalysisState::Idle),
            grid_tx: watch::Sender::new(None),
            partial_tx: watch::Sender::new(None),
            events_tx,
        };

        Ok(Self {
            shared: Arc::new(shared),
            runtime,
            next_job: AtomicU64::new(0),
        })
    }

    /// Starts a coverage analysis unless one is already running.
    ///
    /// Never fails: invalid requests land in [`CoverageAnalysisState::Error`],
    /// a cache hit goes straight to `Success`, anything else starts a build.
    pub fn start_analysis(&self, request: AnalysisRequest, viewport: Option<GeoBounds>) {
        let mut active = self.shared.lock_active();
        if let Some(job) = active.as_ref() {
            debug!(job = job.id, "analysis already in flight, ignoring request");
            return;
        }

        let params = match self.validate(&request, viewport.as_ref()) {
            Ok(params) => params,
            Err(err) => {
                warn!(error = %err, "rejected coverage request");
                self.shared.fail(err.to_string());
                return;
            }
        };

        let key = CacheKey::new(&params);
        match self.shared.cache.lookup(&key) {
            CacheLookup::Hit(grid) => {
                info!(%key, "coverage cache hit");
                self.shared.publish_success(None, grid);
                return;
            }
            CacheLookup::Expired => debug!(%key, "cached coverage expired, recomputing"),
            CacheLookup::Miss => debug!(%key, "coverage cache miss"),
        }

        let id = self.next_job.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        *active = Some(ActiveJob { id, cancel: cancel.clone(), started: Instant::now() });

        self.shared.partial_tx.send_replace(None);
        self.shared.state_tx.send_replace(CoverageAnalysisState::Calculating);
        let _ = self.shared.events_tx.send(CoverageEvent::Started { job: id });
        drop(active);

        info!(job = id, %key, resolution_m = params.resolution_m, "starting coverage analysis");

        let peers = if params.include_peer_extension {
            self.shared.peers.peer_locations()
        } else {
            HashMap::new()
        };
        // A clipped grid is not the canonical answer for this key.
        let cache_key = viewport.is_none().then_some(key);

        let shared = self.shared.clone();
        self.runtime.spawn(async move {
            shared.run_job(id, params, viewport, peers, cache_key, cancel).await;
        });
    }

    fn validate(
        &self,
        request: &AnalysisRequest,
        viewport: Option<&GeoBounds>,
    ) -> Result<CoverageAnalysisParams, CoverageError> {
        let params = CoverageAnalysisParams::from_request(request, &self.shared.config.peers)?;
        params.check_grid_size(&params.region(viewport), &self.shared.config.grid)?;
        Ok(params)
    }

    /// Cancels the running build, if any, and returns to `Idle`.
    pub fn clear_analysis(&self) {
        let mut active = self.shared.lock_active();
        if let Some(job) = active.take() {
            job.cancel.cancel();
            info!(job = job.id, "coverage analysis cancelled");
        }
        self.shared.grid_tx.send_replace(None);
        self.shared.partial_tx.send_replace(None);
        self.shared.state_tx.send_replace(CoverageAnalysisState::Idle);
        let _ = self.shared.events_tx.send(CoverageEvent::Cleared);
    }

    pub fn clear_cache(&self) {
        self.shared.cache.clear();
        debug!("coverage cache cleared");
    }

    /// Probability at the cell nearest `point` in the latest result, 0.0
    /// when there is none.
    pub fn get_coverage_at_location(&self, point: LatLon) -> f64 {
        self.current_grid()
            .and_then(|grid| grid.nearest(point).map(|p| p.probability))
            .unwrap_or(0.0)
    }

    pub fn get_coverage_statistics(&self) -> Option<CoverageStatistics> {
        self.current_grid().and_then(|grid| CoverageStatistics::from_grid(&grid))
    }

    pub fn state(&self) -> CoverageAnalysisState {
        self.shared.state_tx.borrow().clone()
    }

    pub fn current_grid(&self) -> Option<Arc<CoverageGrid>> {
        self.shared.grid_tx.borrow().clone()
    }

    pub fn partial_grid(&self) -> Option<Arc<CoverageGrid>> {
        self.shared.partial_tx.borrow().clone()
    }

    pub fn is_calculating(&self) -> bool {
        self.shared.lock_active().is_some()
    }

    pub fn watch_state(&self) -> watch::Receiver<CoverageAnalysisState> {
        self.shared.state_tx.subscribe()
    }

    pub fn watch_grid(&self) -> watch::Receiver<Option<Arc<CoverageGrid>>> {
        self.shared.grid_tx.subscribe()
    }

    pub fn watch_partial_grid(&self) -> watch::Receiver<Option<Arc<CoverageGrid>>> {
        self.shared.partial_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoverageEvent> {
        self.shared.events_tx.subscribe()
    }

    pub fn cache(&self) -> &Arc<CoverageCache> {
        &self.shared.cache
    }
}

impl Drop for CoverageOrchestrator {
    fn drop(&mut self) {
        if let Some(job) = self.shared.lock_active().take() {
            job.cancel.cancel();
        }
    }
}

impl Shared {
    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveJob>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run_job(
        self: Arc<Self>,
        id: u64,
        params: CoverageAnalysisParams,
        viewport: Option<GeoBounds>,
        peers: HashMap<String, LatLon>,
        cache_key: Option<CacheKey>,
        cancel: CancellationToken,
    ) {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let builder = self.builder.clone();

        let work = tokio::task::spawn_blocking(move || {
            builder.build(&params, viewport.as_ref(), &peers, &cancel, &event_tx)
        });

        // Closes once the build drops its sender, so every event is
        // forwarded before the outcome is looked at.
        while let Some(event) = event_rx.recv().await {
            self.on_build_event(id, event);
        }

        let outcome = work.await;
        self.finish_job(id, outcome, cache_key);
    }

    fn on_build_event(&self, id: u64, event: BuildEvent) {
        let active = self.lock_active();
        if !active.as_ref().is_some_and(|job| job.id == id) {
            return;
        }
        match event {
            BuildEvent::Progress { fraction, message } => {
                self.state_tx.send_replace(CoverageAnalysisState::Progress {
                    fraction,
                    message: message.clone(),
                });
                let _ = self.events_tx.send(CoverageEvent::Progress { job: id, fraction, message });
            }
            BuildEvent::Partial(grid) => {
                self.partial_tx.send_replace(Some(grid.clone()));
                let _ = self.events_tx.send(CoverageEvent::Partial { job: id, grid });
            }
        }
    }

    fn finish_job(
        &self,
        id: u64,
        outcome: Result<Result<CoverageGrid, CoverageError>, JoinError>,
        cache_key: Option<CacheKey>,
    ) {
        let mut active = self.lock_active();
        let job = match active.take() {
            Some(job) if job.id == id => job,
            other => {
                *active = other;
                debug!(job = id, "discarding result of superseded coverage job");
                return;
            }
        };

        match outcome {
            Ok(Ok(grid)) => {
                let grid = Arc::new(grid);
                if let Some(key) = cache_key {
                    self.cache.insert(key, grid.clone());
                }
                info!(
                    job = id,
                    cells = grid.cell_count(),
                    elapsed = ?job.started.elapsed(),
                    "coverage analysis complete"
                );
                self.publish_success(Some(id), grid);
            }
            Ok(Err(err)) if err.is_cancelled() => {
                debug!(job = id, "coverage job stopped after cancellation");
                self.partial_tx.send_replace(None);
                self.state_tx.send_replace(CoverageAnalysisState::Idle);
            }
            Ok(Err(err)) => {
                warn!(job = id, error = %err, "coverage analysis failed");
                self.fail(err.to_string());
            }
            Err(join_err) => {
                let err = CoverageError::Unexpected(panic_message(join_err));
                warn!(job = id, error = %err, "coverage worker died");
                self.fail(err.to_string());
            }
        }
    }

    fn publish_success(&self, job: Option<u64>, grid: Arc<CoverageGrid>) {
        self.grid_tx.send_replace(Some(grid.clone()));
        self.partial_tx.send_replace(None);
        self.state_tx.send_replace(CoverageAnalysisState::Success(grid.clone()));
        let _ = self.events_tx.send(CoverageEvent::Completed { job, grid });
    }

    fn fail(&self, message: String) {
        self.partial_tx.send_replace(None);
        self.state_tx.send_replace(CoverageAnalysisState::Error(message.clone()));
        let _ = self.events_tx.send(CoverageEvent::Failed { message });
    }
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "worker panicked".to_string())
}
