use serde::{Deserialize, Serialize};

use crate::geo::EARTH_RADIUS;

/// Atmospheric refraction expressed as an effective earth-radius factor.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefractionParams {
    pub k_factor: f64,
}

impl Default for RefractionParams {
    fn default() -> Self {
        Self { k_factor: 4.0 / 3.0 }
    }
}

pub fn effective_earth_radius(params: RefractionParams) -> f64 {
    EARTH_RADIUS * params.k_factor
}

/// Height the earth rises above the chord at `d1` meters from one end
/// and `d2` meters from the other.
pub fn earth_bulge(d1: f64, d2: f64, params: RefractionParams) -> f64 {
    if d1 <= 0.0 || d2 <= 0.0 {
        return 0.0;
    }
    d1 * d2 / (2.0 * effective_earth_radius(params))
}
