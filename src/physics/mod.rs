pub mod fresnel;
pub mod los;
pub mod path_loss;
pub mod refraction;

use crate::physics::fresnel::FresnelCalculator;
use crate::physics::los::LosSystem;
use crate::terrain::TerrainProfile;

/// Terrain effects on one transmitter-to-receiver path.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PathObstruction {
    pub line_of_sight: bool,
    pub occlusion: f64,
    pub blockage: f64,
}

impl PathObstruction {
    pub const CLEAR: Self = Self { line_of_sight: true, occlusion: 0.0, blockage: 0.0 };
}

pub fn analyze_path(
    profile: &TerrainProfile,
    tx_height_m: f64,
    rx_height_m: f64,
    fresnel: &FresnelCalculator,
) -> PathObstruction {
    if profile.total_distance <= 0.0 {
        return PathObstruction::CLEAR;
    }
    let los = LosSystem::new(fresnel.refraction).check_visibility(profile, tx_height_m, rx_height_m);
    PathObstruction {
        line_of_sight: los.is_visible,
        occlusion: los.occlusion.clamp(0.0, 1.0),
        blockage: fresnel.blockage(profile, tx_height_m, rx_height_m).clamp(0.0, 1.0),
    }
}
