use std::path::PathBuf;
use std::fs::File;
use std::io::Read;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};

use lru::LruCache;
use thiserror::Error;
use tracing::debug;

use crate::geo::LatLon;

mod profile;

pub use profile::{TerrainPoint, TerrainProfile};

pub const SRTM3_SIZE: usize = 1201;
pub const SRTM1_SIZE: usize = 3601;

#[derive(Debug, Error)]
pub enum TerrainError {
    #[error("failed to read terrain tile {tile}: {source}")]
    Io {
        tile: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unknown HGT file size for {tile}: {len} bytes")]
    UnsupportedFormat { tile: String, len: u64 },
    #[error("elevation source unavailable: {0}")]
    Unavailable(String),
}

/// Supplies ground elevation (meters AMSL) for arbitrary points.
///
/// Implementations may be slow or networked. They are called from the
/// grid builder's worker thread, so they must be shareable across threads.
pub trait ElevationSource: Send + Sync {
    fn elevation_at(&self, loc: LatLon) -> Result<f64, TerrainError>;
}

impl<T: ElevationSource + ?Sized> ElevationSource for Arc<T> {
    fn elevation_at(&self, loc: LatLon) -> Result<f64, TerrainError> {
        (**self).elevation_at(loc)
    }
}

/// Constant-elevation terrain. Used when no DEM is available.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlatTerrain {
    pub elevation: f64,
}

impl ElevationSource for FlatTerrain {
    fn elevation_at(&self, _loc: LatLon) -> Result<f64, TerrainError> {
        Ok(self.elevation)
    }
}

#[derive(Debug, Clone)]
pub struct TerrainTile {
    pub latitude: i32,
    pub longitude: i32,
    pub size: usize,
    /// Row-major samples, north row first.
    pub data: Vec<i16>,
}

impl TerrainTile {
    /// Bilinear elevation at fractional tile coordinates: `(0, 0)` is the
    /// NW corner, `(1, 1)` the SE corner. Out-of-range input is clamped.
    pub fn sample(&self, u: f64, v: f64) -> f64 {
        let last = self.size - 1;
        let x = (u * last as f64).clamp(0.0, last as f64);
        let y = (v * last as f64).clamp(0.0, last as f64);
        let (col, row) = (x.floor() as usize, y.floor() as usize);
        let (next_col, next_row) = ((col + 1).min(last), (row + 1).min(last));
        let (fx, fy) = (x - col as f64, y - row as f64);

        let lerp = |a: i16, b: i16, t: f64| a as f64 + (b as f64 - a as f64) * t;
        let north = lerp(self.get_height(col, row), self.get_height(next_col, row), fx);
        let south = lerp(self.get_height(col, next_row), self.get_height(next_col, next_row), fx);
        north + (south - north) * fy
    }

    #[inline(always)]
    pub fn get_height(&self, x: usize, y: usize) -> i16 {
        // SRTM voids are -32768; treat them as sea level.
        match self.data[y * self.size + x] {
            i16::MIN => 0,
            h => h,
        }
    }
}

pub fn tile_name(lat: i32, lon: i32) -> String {
    format!("{}{:02}{}{:03}.hgt",
        if lat >= 0 { "N" } else { "S" }, lat.abs(),
        if lon >= 0 { "E" } else { "W" }, lon.abs()
    )
}

pub struct TerrainLoader {
    pub assets_path: PathBuf,
}

impl TerrainLoader {
    pub fn new(assets_path: PathBuf) -> Self {
        Self { assets_path }
    }

    pub fn load_tile(&self, lat: i32, lon: i32) -> Result<TerrainTile, TerrainError> {
        let filename = tile_name(lat, lon);
        let path = self.assets_path.join(&filename);

        if !path.exists() {
            debug!(tile = %filename, "terrain tile missing, using sea level");
            return Ok(TerrainTile {
                latitude: lat,
                longitude: lon,
                size: SRTM3_SIZE,
                data: vec![0; SRTM3_SIZE * SRTM3_SIZE],
            });
        }

        let io_err = |source| TerrainError::Io { tile: filename.clone(), source };

        let mut file = File::open(&path).map_err(io_err)?;
        let len = file.metadata().map_err(io_err)?.len();
        let size = match len {
            2884802 => SRTM3_SIZE,
            25934402 => SRTM1_SIZE,
            len => return Err(TerrainError::UnsupportedFormat { tile: filename.clone(), len }),
        };

        let mut buffer = Vec::with_capacity(size * size * 2);
        file.read_to_end(&mut buffer).map_err(io_err)?;

        let data: Vec<i16> = buffer
            .chunks_exact(2)
            .map(|chunk| i16::from_be_bytes([chunk[0], chunk[1]]))
            .collect();

        Ok(TerrainTile {
            latitude: lat,
            longitude: lon,
            size,
            data,
        })
    }
}

/// SRTM tile store with an LRU of decoded tiles.
pub struct TerrainManager {
    loader: TerrainLoader,
    cache: Mutex<LruCache<(i32, i32), Arc<TerrainTile>>>,
}

impl TerrainManager {
    pub fn new(loader: TerrainLoader, cache_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            loader,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get_tile(&self, lat: i32, lon: i32) -> Result<Arc<TerrainTile>, TerrainError> {
        {
            let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(tile) = cache.get(&(lat, lon)) {
                return Ok(tile.clone());
            }
        }

        let tile = Arc::new(self.loader.load_tile(lat, lon)?);

        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.put((lat, lon), tile.clone());

        Ok(tile)
    }
}

impl ElevationSource for TerrainManager {
    fn elevation_at(&self, loc: LatLon) -> Result<f64, TerrainError> {
        let lat_deg = loc.latitude.floor() as i32;
        let lon_deg = loc.longitude.floor() as i32;

        let tile = self.get_tile(lat_deg, lon_deg)?;
        let u = loc.longitude - lon_deg as f64;
        // Rows run north to south: row 0 is lat_deg + 1.
        let v = (lat_deg as f64 + 1.0) - loc.latitude;
        Ok(tile.sample(u, v))
    }
}

/// Memoizes elevation samples on a quantized lat/lon lattice.
///
/// Neighbouring grid cells sample almost the same paths back to the
/// transmitter, so a job sharing one of these cuts elevation-source calls
/// by orders of magnitude.
pub struct CachedElevation<S> {
    source: S,
    precision_deg: f64,
    cache: Mutex<LruCache<(i64, i64), f64>>,
}

impl<S: ElevationSource> CachedElevation<S> {
    pub fn new(source: S, capacity: usize, precision_deg: f64) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            source,
            precision_deg,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn quantize(&self, loc: LatLon) -> (i64, i64) {
        (
            (loc.latitude / self.precision_deg).round() as i64,
            (loc.longitude / self.precision_deg).round() as i64,
        )
    }
}

impl<S: ElevationSource> ElevationSource for CachedElevation<S> {
    fn elevation_at(&self, loc: LatLon) -> Result<f64, TerrainError> {
        let key = self.quantize(loc);
        if let Some(h) = self.cache.lock().unwrap_or_else(PoisonError::into_inner).get(&key) {
            return Ok(*h);
        }

        // Sample the lattice node itself so every caller sees the same value.
        let node = LatLon::new(key.0 as f64 * self.precision_deg, key.1 as f64 * self.precision_deg);
        let h = self.source.elevation_at(node)?;
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).put(key, h);
        Ok(h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTerrain {
        calls: AtomicUsize,
    }

    impl ElevationSource for CountingTerrain {
        fn elevation_at(&self, loc: LatLon) -> Result<f64, TerrainError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(loc.latitude * 10.0)
        }
    }

    #[test]
    fn cached_elevation_reuses_nearby_samples() {
        let cached = CachedElevation::new(CountingTerrain { calls: AtomicUsize::new(0) }, 16, 1e-3);

        let a = cached.elevation_at(LatLon::new(10.0001, 5.0)).unwrap();
        let b = cached.elevation_at(LatLon::new(10.0002, 5.0001)).unwrap();

        assert_eq!(a, b);
        assert_eq!(cached.source.calls.load(Ordering::Relaxed), 1);
        assert_eq!(cached.len(), 1);
    }

    #[test]
    fn missing_tile_falls_back_to_sea_level() {
        let dir = tempfile::tempdir().unwrap();
        let manager = TerrainManager::new(TerrainLoader::new(dir.path().to_path_buf()), 2);

        let h = manager.elevation_at(LatLon::new(45.5, 5.5)).unwrap();
        assert_eq!(h, 0.0);
    }

    #[test]
    fn truncated_tile_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("N45E005.hgt"), [0u8; 16]).unwrap();
        let loader = TerrainLoader::new(dir.path().to_path_buf());

        let err = loader.load_tile(45, 5).unwrap_err();
        assert!(matches!(err, TerrainError::UnsupportedFormat { len: 16, .. }));
    }

    #[test]
    fn tile_names_follow_srtm_convention() {
        assert_eq!(tile_name(45, 5), "N45E005.hgt");
        assert_eq!(tile_name(-3, -122), "S03W122.hgt");
    }

    #[test]
    fn bilinear_sample_interpolates_between_posts() {
        let tile = TerrainTile {
            latitude: 0,
            longitude: 0,
            size: 2,
            data: vec![0, 100, 0, 100],
        };
        assert!((tile.sample(0.5, 0.5) - 50.0).abs() < 1e-9);
        assert_eq!(tile.sample(1.0, 0.0), 100.0);
    }
}
