//! First Fresnel zone clearance along a terrain profile.

use serde::{Deserialize, Serialize};

use crate::geo::LatLon;
use crate::physics::path_loss::calculate_wavelength;
use crate::physics::refraction::{earth_bulge, RefractionParams};
use crate::terrain::TerrainProfile;

pub const DEFAULT_FREQUENCY_MHZ: f64 = 915.0;

/// Radius of the first Fresnel zone at `d1`/`d2` meters from the endpoints.
///
/// F1 = sqrt(λ * d1 * d2 / (d1 + d2))
pub fn fresnel_radius(wavelength_m: f64, d1: f64, d2: f64) -> f64 {
    if d1 <= 0.0 || d2 <= 0.0 {
        return 0.0;
    }
    (wavelength_m * d1 * d2 / (d1 + d2)).sqrt()
}

/// Fraction of a circular zone cross-section of radius `radius` lying below
/// terrain when the zone center clears the terrain by `clearance` meters.
pub fn obstructed_fraction(clearance: f64, radius: f64) -> f64 {
    if radius <= 0.0 {
        return if clearance < 0.0 { 1.0 } else { 0.0 };
    }
    let h = (clearance / radius).clamp(-1.0, 1.0);
    ((h.acos() - h * (1.0 - h * h).sqrt()) / std::f64::consts::PI).clamp(0.0, 1.0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FresnelZone {
    /// Path center-line, one entry per profile point.
    pub path: Vec<LatLon>,
    /// First-zone radius at each path point, meters.
    pub radii: Vec<f64>,
    /// Obstructed fraction of the zone at each path point.
    pub point_blockage: Vec<f64>,
    /// Worst obstructed fraction along the path.
    pub blockage: f64,
    pub profile: TerrainProfile,
    pub frequency_mhz: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct FresnelCalculator {
    pub frequency_mhz: f64,
    pub refraction: RefractionParams,
}

impl Default for FresnelCalculator {
    fn default() -> Self {
        Self { frequency_mhz: DEFAULT_FREQUENCY_MHZ, refraction: RefractionParams::default() }
    }
}

impl FresnelCalculator {
    pub fn new(frequency_mhz: f64, refraction: RefractionParams) -> Self {
        Self { frequency_mhz, refraction }
    }

    /// Radius and obstructed fraction at every profile point. Endpoints have
    /// zero radius and no blockage.
    fn per_point<'a>(
        &self,
        profile: &'a TerrainProfile,
        tx_height_m: f64,
        rx_height_m: f64,
    ) -> impl Iterator<Item = (f64, f64)> + 'a {
        let wavelength = calculate_wavelength(self.frequency_mhz);
        let refraction = self.refraction;
        let total = profile.total_distance;
        let tx_top = profile.start().map_or(0.0, |p| p.elevation) + tx_height_m;
        let rx_top = profile.end().map_or(0.0, |p| p.elevation) + rx_height_m;

        profile.points.iter().map(move |point| {
            let d1 = point.distance;
            let d2 = total - d1;
            if total <= 0.0 || d1 <= 0.0 || d2 <= 0.0 {
                return (0.0, 0.0);
            }
            let los_height = tx_top + (rx_top - tx_top) * d1 / total;
            let terrain = point.elevation + earth_bulge(d1, d2, refraction);
            let radius = fresnel_radius(wavelength, d1, d2);
            (radius, obstructed_fraction(los_height - terrain, radius))
        })
    }

    /// Worst first-zone blockage along the path, in [0, 1].
    pub fn blockage(&self, profile: &TerrainProfile, tx_height_m: f64, rx_height_m: f64) -> f64 {
        if profile.total_distance <= 0.0 {
            return 0.0;
        }
        self.per_point(profile, tx_height_m, rx_height_m)
            .map(|(_, blocked)| blocked)
            .fold(0.0, f64::max)
    }

    pub fn zone(&self, profile: TerrainProfile, tx_height_m: f64, rx_height_m: f64) -> FresnelZone {
        let (radii, point_blockage): (Vec<f64>, Vec<f64>) =
            self.per_point(&profile, tx_height_m, rx_height_m).unzip();
        let blockage = point_blockage.iter().copied().fold(0.0, f64::max);
        FresnelZone {
            path: profile.points.iter().map(|p| p.location).collect(),
            radii,
            point_blockage,
            blockage,
            profile,
            frequency_mhz: self.frequency_mhz,
        }
    }
}
