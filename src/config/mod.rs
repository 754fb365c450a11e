//! Engine configuration.
//!
//! Every field has a default, so a JSON file only needs to name what it
//! overrides:
//!
//! ```json
//! { "cache": { "ttl_ms": 300000 }, "radio": { "tx_power_dbm": 22.0 } }
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::CoverageError;
use crate::physics::fresnel::DEFAULT_FREQUENCY_MHZ;
use crate::physics::refraction::RefractionParams;

/// 100 statute miles.
pub const DEFAULT_MAX_PEER_DISTANCE_M: f64 = 160_934.4;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub radio: RadioConfig,
    pub refraction: RefractionParams,
    pub terrain: TerrainConfig,
    pub peers: PeerConfig,
    pub cache: CacheConfig,
    pub grid: GridConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    pub frequency_mhz: f64,
    pub tx_power_dbm: f64,
    pub tx_antenna_gain_dbi: f64,
    pub rx_antenna_gain_dbi: f64,
    /// 2.0 is free space; ground-level handheld links sit around 3.
    pub path_loss_exponent: f64,
    pub receiver_sensitivity_dbm: f64,
    /// Width of the logistic turning link margin (dB) into probability.
    pub fade_margin_slope_db: f64,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            frequency_mhz: DEFAULT_FREQUENCY_MHZ,
            tx_power_dbm: 30.0,
            tx_antenna_gain_dbi: 2.15,
            rx_antenna_gain_dbi: 2.15,
            path_loss_exponent: 3.0,
            receiver_sensitivity_dbm: -110.0,
            fade_margin_slope_db: 4.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerrainConfig {
    pub sample_interval_m: f64,
    pub elevation_cache_entries: usize,
    pub elevation_cache_precision_deg: f64,
}

impl Default for TerrainConfig {
    fn default() -> Self {
        Self {
            sample_interval_m: 100.0,
            elevation_cache_entries: 200_000,
            elevation_cache_precision_deg: 1e-4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    pub max_peer_distance_m: f64,
    /// A transmitter counts as a contributor to a cell at or above this.
    pub min_contribution_probability: f64,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            max_peer_distance_m: DEFAULT_MAX_PEER_DISTANCE_M,
            min_contribution_probability: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_ms: u64,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_ms: 30_000, max_entries: 10 }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// Emit a partial grid every this many completed rows. 0 disables.
    pub partial_every_rows: usize,
    pub max_cells: usize,
    pub event_capacity: usize,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self { partial_every_rows: 5, max_cells: 250_000, event_capacity: 1024 }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open config {:?}", path))?;
        let config: EngineConfig = serde_json::from_reader(std::io::BufReader::new(file))
            .with_context(|| format!("Failed to parse config {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CoverageError> {
        let invalid = |msg: &str| Err(CoverageError::InvalidConfig(msg.to_string()));

        if !(self.radio.frequency_mhz > 0.0) {
            return invalid("radio.frequency_mhz must be positive");
        }
        if !(self.radio.path_loss_exponent > 0.0) {
            return invalid("radio.path_loss_exponent must be positive");
        }
        if !(self.radio.fade_margin_slope_db > 0.0) {
            return invalid("radio.fade_margin_slope_db must be positive");
        }
        if !(self.refraction.k_factor > 0.0) {
            return invalid("refraction.k_factor must be positive");
        }
        if !(self.terrain.sample_interval_m > 0.0) {
            return invalid("terrain.sample_interval_m must be positive");
        }
        if !(self.terrain.elevation_cache_precision_deg > 0.0) {
            return invalid("terrain.elevation_cache_precision_deg must be positive");
        }
        if !(0.0..=1.0).contains(&self.peers.min_contribution_probability) {
            return invalid("peers.min_contribution_probability must be within [0, 1]");
        }
        if !(self.peers.max_peer_distance_m >= 0.0) {
            return invalid("peers.max_peer_distance_m must not be negative");
        }
        if self.cache.max_entries == 0 {
            return invalid("cache.max_entries must be at least 1");
        }
        if self.grid.max_cells == 0 || self.grid.event_capacity == 0 {
            return invalid("grid.max_cells and grid.event_capacity must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "cache": { "ttl_ms": 1000 }, "radio": { "tx_power_dbm": 22.0 } }"#)
                .unwrap();

        assert_eq!(config.cache.ttl(), Duration::from_secs(1));
        assert_eq!(config.cache.max_entries, 10);
        assert_eq!(config.radio.tx_power_dbm, 22.0);
        assert_eq!(config.radio.frequency_mhz, 915.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_capacity_cache_is_rejected() {
        let mut config = EngineConfig::default();
        config.cache.max_entries = 0;
        assert!(matches!(config.validate(), Err(CoverageError::InvalidConfig(_))));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coverage.json");
        std::fs::write(&path, r#"{ "peers": { "max_peer_distance_m": 5000.0 } }"#).unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.peers.max_peer_distance_m, 5000.0);
    }
}
