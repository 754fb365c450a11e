use crate::physics::refraction::{effective_earth_radius, RefractionParams};
use crate::terrain::TerrainProfile;

/// Angular depth below the terrain horizon at which a path counts as fully
/// occluded.
pub const FULL_OCCLUSION_DEG: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LosResult {
    pub is_visible: bool,
    /// 0.0 = clear line of sight, 1.0 = buried at least
    /// [`FULL_OCCLUSION_DEG`] below the terrain horizon.
    pub occlusion: f64,
    pub margin_deg: f64,
    pub obstruction_dist_m: Option<f64>,
}

impl LosResult {
    fn clear() -> Self {
        Self { is_visible: true, occlusion: 0.0, margin_deg: 90.0, obstruction_dist_m: None }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LosSystem {
    pub refraction: RefractionParams,
}

impl LosSystem {
    pub fn new(refraction: RefractionParams) -> Self {
        Self { refraction }
    }

    /// Compares the elevation angle to the receiver's antenna against the
    /// highest terrain angle seen from the transmitter's antenna, both
    /// corrected for earth curvature.
    pub fn check_visibility(
        &self,
        profile: &TerrainProfile,
        tx_height_m: f64,
        rx_height_m: f64,
    ) -> LosResult {
        let dist_m = profile.total_distance;
        let (Some(start), Some(end)) = (profile.start(), profile.end()) else {
            return LosResult::clear();
        };
        if dist_m < 1.0 || profile.points.len() < 3 {
            return LosResult::clear();
        }

        let r_eff = effective_earth_radius(self.refraction);
        let h_tx = start.elevation + tx_height_m;

        let mut max_angle = -std::f64::consts::FRAC_PI_2;
        let mut obstruction_dist = None;

        // h_eff(d) = h_terrain(d) - d^2 / (2 * R_eff)
        for point in &profile.points[1..profile.points.len() - 1] {
            let d = point.distance;
            if d <= 0.0 {
                continue;
            }
            let h_eff = point.elevation - (d * d) / (2.0 * r_eff);
            let angle = (h_eff - h_tx).atan2(d);

            if angle > max_angle {
                max_angle = angle;
                obstruction_dist = Some(d);
            }
        }

        let h_rx = end.elevation + rx_height_m;
        let h_rx_eff = h_rx - (dist_m * dist_m) / (2.0 * r_eff);
        let target_angle = (h_rx_eff - h_tx).atan2(dist_m);

        let margin_deg = (target_angle - max_angle).to_degrees();
        let epsilon = 1e-4;

        if margin_deg > epsilon {
            LosResult {
                is_visible: true,
                occlusion: 0.0,
                margin_deg,
                obstruction_dist_m: None,
            }
        } else {
            LosResult {
                is_visible: false,
                occlusion: (-margin_deg / FULL_OCCLUSION_DEG).clamp(0.0, 1.0),
                margin_deg,
                obstruction_dist_m: obstruction_dist,
            }
        }
    }
}
