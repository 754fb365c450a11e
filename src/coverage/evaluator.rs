use std::collections::HashMap;

use crate::config::{PeerConfig, RadioConfig, TerrainConfig};
use crate::coverage::{CoverageAnalysisParams, CoveragePoint, Transmitter, PRIMARY_TRANSMITTER_ID};
use crate::geo::{calculate_geodesic, LatLon};
use crate::physics::fresnel::FresnelCalculator;
use crate::physics::path_loss::{link_probability, received_power_dbm};
use crate::physics::refraction::RefractionParams;
use crate::physics::{analyze_path, PathObstruction};
use crate::terrain::{ElevationSource, TerrainError, TerrainProfile};

/// One transmitter's estimate for one cell.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkEstimate {
    pub probability: f64,
    pub signal_strength_dbm: f64,
    pub distance_m: f64,
    pub obstruction: PathObstruction,
}

/// Scores a single grid cell against a set of candidate transmitters.
///
/// Each candidate costs one terrain profile, i.e. one elevation lookup per
/// sample along the path. Hand it a [`crate::terrain::CachedElevation`]
/// when many cells share the same transmitters.
pub struct PointEvaluator<'a> {
    terrain: &'a dyn ElevationSource,
    radio: RadioConfig,
    fresnel: FresnelCalculator,
    sample_interval_m: f64,
    min_contribution: f64,
}

impl<'a> PointEvaluator<'a> {
    pub fn new(
        terrain: &'a dyn ElevationSource,
        radio: &RadioConfig,
        refraction: RefractionParams,
        terrain_config: &TerrainConfig,
        peers: &PeerConfig,
    ) -> Self {
        Self {
            terrain,
            radio: radio.clone(),
            fresnel: FresnelCalculator::new(radio.frequency_mhz, refraction),
            sample_interval_m: terrain_config.sample_interval_m,
            min_contribution: peers.min_contribution_probability,
        }
    }

    /// Estimate for a receiver at `target` from a single transmitter.
    pub fn link(
        &self,
        tx: &Transmitter,
        target: LatLon,
        rx_height_m: f64,
    ) -> Result<LinkEstimate, TerrainError> {
        let (distance_m, _) = calculate_geodesic(tx.location, target);
        let signal_strength_dbm = received_power_dbm(&self.radio, distance_m);
        let base = link_probability(&self.radio, signal_strength_dbm);

        let obstruction = if distance_m > 0.0 {
            let profile =
                TerrainProfile::sample(self.terrain, tx.location, target, self.sample_interval_m)?;
            analyze_path(&profile, tx.antenna_height_m, rx_height_m, &self.fresnel)
        } else {
            PathObstruction::CLEAR
        };

        let probability = base * (1.0 - obstruction.occlusion) * (1.0 - obstruction.blockage);

        Ok(LinkEstimate {
            probability: probability.clamp(0.0, 1.0),
            signal_strength_dbm,
            distance_m,
            obstruction,
        })
    }

    /// Best estimate across `candidates`. Contributors are the candidates at
    /// or above the minimum contribution probability.
    pub fn evaluate(
        &self,
        target: LatLon,
        candidates: &[Transmitter],
        rx_height_m: f64,
    ) -> Result<CoveragePoint, TerrainError> {
        let mut best: Option<LinkEstimate> = None;
        let mut contributors = Vec::new();
        let mut nearest_contributor: Option<f64> = None;

        for tx in candidates {
            let estimate = self.link(tx, target, rx_height_m)?;

            if estimate.probability >= self.min_contribution && estimate.probability > 0.0 {
                contributors.push(tx.id.clone());
                nearest_contributor = Some(match nearest_contributor {
                    Some(d) => d.min(estimate.distance_m),
                    None => estimate.distance_m,
                });
            }

            if best.as_ref().is_none_or(|b| estimate.probability > b.probability) {
                best = Some(estimate);
            }
        }

        Ok(match best {
            Some(b) => CoveragePoint::new(
                target,
                b.probability,
                b.signal_strength_dbm,
                b.obstruction.blockage,
                b.obstruction.occlusion,
                contributors,
                nearest_contributor,
            ),
            None => CoveragePoint::new(target, 0.0, f64::NEG_INFINITY, 0.0, 0.0, Vec::new(), None),
        })
    }
}

/// The user's transmitter plus, with peer extension on, every peer within
/// `max_peer_distance_m` of the analysis center.
pub fn candidate_transmitters(
    params: &CoverageAnalysisParams,
    peers: &HashMap<String, LatLon>,
) -> Vec<Transmitter> {
    let mut candidates = vec![Transmitter {
        id: PRIMARY_TRANSMITTER_ID.to_string(),
        location: params.center,
        antenna_height_m: params.user_antenna_height_m(),
    }];

    if params.include_peer_extension {
        let mut nearby: Vec<Transmitter> = peers
            .iter()
            .filter(|(id, loc)| {
                id.as_str() != PRIMARY_TRANSMITTER_ID
                    && loc.is_valid()
                    && params.center.distance_to(**loc) <= params.max_peer_distance_m
            })
            // Peers are field nodes like the receiver, so they transmit from
            // the receiving antenna height.
            .map(|(id, loc)| Transmitter {
                id: id.clone(),
                location: *loc,
                antenna_height_m: params.receiving_antenna_height_m(),
            })
            .collect();
        nearby.sort_by(|a, b| a.id.cmp(&b.id));
        candidates.extend(nearby);
    }

    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::coverage::AnalysisRequest;
    use crate::terrain::FlatTerrain;

    fn evaluator<'a>(terrain: &'a dyn ElevationSource, config: &EngineConfig) -> PointEvaluator<'a> {
        PointEvaluator::new(terrain, &config.radio, config.refraction, &config.terrain, &config.peers)
    }

    fn tx(id: &str, lat: f64, lon: f64) -> Transmitter {
        Transmitter { id: id.to_string(), location: LatLon::new(lat, lon), antenna_height_m: 10.0 }
    }

    #[test]
    fn probability_falls_with_distance() {
        let config = EngineConfig::default();
        let terrain = FlatTerrain::default();
        let eval = evaluator(&terrain, &config);
        let user = tx("self", 47.0, -122.0);

        let near = eval.link(&user, LatLon::new(47.005, -122.0), 10.0).unwrap();
        let far = eval.link(&user, LatLon::new(47.08, -122.0), 10.0).unwrap();

        assert!(near.probability > far.probability);
        assert!(near.signal_strength_dbm > far.signal_strength_dbm);
    }

    #[test]
    fn best_candidate_wins_and_contributors_are_recorded() {
        let config = EngineConfig::default();
        let terrain = FlatTerrain::default();
        let eval = evaluator(&terrain, &config);
        let target = LatLon::new(47.1, -122.0);
        let candidates = vec![tx("self", 47.0, -122.0), tx("relay", 47.099, -122.0)];

        let point = eval.evaluate(target, &candidates, 2.0).unwrap();
        let relay_only = eval.link(&candidates[1], target, 2.0).unwrap();

        assert!((point.probability - relay_only.probability).abs() < 1e-12);
        assert!(point.contributors.contains(&"relay".to_string()));
        let nearest = point.nearest_contributor_m.unwrap();
        assert!((nearest - relay_only.distance_m).abs() < 1e-6);
    }

    #[test]
    fn transmitter_cell_is_fully_covered() {
        let config = EngineConfig::default();
        let terrain = FlatTerrain { elevation: 120.0 };
        let eval = evaluator(&terrain, &config);
        let user = tx("self", 47.0, -122.0);

        let point = eval.evaluate(user.location, &[user.clone()], 2.0).unwrap();
        assert!(point.probability > 0.99);
        assert_eq!(point.fresnel_blockage, 0.0);
        assert_eq!(point.nearest_contributor_m, Some(0.0));
    }

    #[test]
    fn peers_beyond_max_distance_are_dropped() {
        let mut peers = HashMap::new();
        peers.insert("close".to_string(), LatLon::new(47.01, -122.0));
        peers.insert("far".to_string(), LatLon::new(49.0, -122.0));

        let mut peer_config = PeerConfig::default();
        peer_config.max_peer_distance_m = 50_000.0;
        let request = AnalysisRequest::new(LatLon::new(47.0, -122.0), 5000.0, 14).with_peer_extension(true);
        let params = CoverageAnalysisParams::from_request(&request, &peer_config).unwrap();

        let ids: Vec<String> = candidate_transmitters(&params, &peers).into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["self".to_string(), "close".to_string()]);
    }

    #[test]
    fn peers_ignored_without_extension() {
        let mut peers = HashMap::new();
        peers.insert("close".to_string(), LatLon::new(47.01, -122.0));
        let request = AnalysisRequest::new(LatLon::new(47.0, -122.0), 5000.0, 14);
        let params = CoverageAnalysisParams::from_request(&request, &PeerConfig::default()).unwrap();

        assert_eq!(candidate_transmitters(&params, &peers).len(), 1);
    }
}
