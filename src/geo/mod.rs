
use serde::{Deserialize, Serialize};

pub const EARTH_RADIUS: f64 = 6378137.0;

/// Length of one degree of latitude (and of longitude at the equator).
pub const METERS_PER_DEGREE: f64 = EARTH_RADIUS * std::f64::consts::PI / 180.0;

pub const METERS_PER_FOOT: f64 = 0.3048;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LatLon {
    pub latitude: f64,
    pub longitude: f64,
}

impl LatLon {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }

    pub fn distance_to(&self, other: LatLon) -> f64 {
        calculate_geodesic(*self, other).0
    }
}

pub fn feet_to_meters(feet: f64) -> f64 {
    feet * METERS_PER_FOOT
}

// Spherical model, good enough for the ranges a handheld mesh covers.
pub fn calculate_geodesic(p1: LatLon, p2: LatLon) -> (f64, f64) {
    let lat1 = p1.latitude.to_radians();
    let lat2 = p2.latitude.to_radians();
    let dlat = (p2.latitude - p1.latitude).to_radians();
    let dlon = (p2.longitude - p1.longitude).to_radians();

    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    let dist = EARTH_RADIUS * c;

    let y = dlon.sin() * lat2.cos();
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlon.cos();
    let bearing = y.atan2(x).to_degrees();

    (dist, bearing)
}

/// Point at `fraction` (0..=1) of the great-circle arc from `p1` to `p2`.
pub fn intermediate_point(p1: LatLon, p2: LatLon, fraction: f64) -> LatLon {
    let lat1 = p1.latitude.to_radians();
    let lon1 = p1.longitude.to_radians();
    let lat2 = p2.latitude.to_radians();
    let lon2 = p2.longitude.to_radians();

    let delta = calculate_geodesic(p1, p2).0 / EARTH_RADIUS;
    if delta < 1e-12 {
        return p1;
    }

    let a = ((1.0 - fraction) * delta).sin() / delta.sin();
    let b = (fraction * delta).sin() / delta.sin();

    let x = a * lat1.cos() * lon1.cos() + b * lat2.cos() * lon2.cos();
    let y = a * lat1.cos() * lon1.sin() + b * lat2.cos() * lon2.sin();
    let z = a * lat1.sin() + b * lat2.sin();

    LatLon {
        latitude: z.atan2((x * x + y * y).sqrt()).to_degrees(),
        longitude: y.atan2(x).to_degrees(),
    }
}

/// Degrees of longitude spanned by `meters` at the given latitude.
pub fn meters_to_lon_degrees(meters: f64, latitude: f64) -> f64 {
    let cos_lat = latitude.to_radians().cos().max(1e-6);
    meters / (METERS_PER_DEGREE * cos_lat)
}

pub fn meters_to_lat_degrees(meters: f64) -> f64 {
    meters / METERS_PER_DEGREE
}

/// Axis-aligned lat/lon rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoBounds {
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
}

impl GeoBounds {
    /// Square of side `2 * radius_m` centered on `center`.
    ///
    /// Latitudes are clamped to the poles; a square wider than the whole
    /// parallel spans every longitude.
    pub fn around(center: LatLon, radius_m: f64) -> Self {
        let dlat = meters_to_lat_degrees(radius_m);
        let dlon = meters_to_lon_degrees(radius_m, center.latitude);
        let (west, east) = if dlon >= 180.0 {
            (-180.0, 180.0)
        } else {
            (center.longitude - dlon, center.longitude + dlon)
        };
        Self {
            north: (center.latitude + dlat).min(90.0),
            south: (center.latitude - dlat).max(-90.0),
            east,
            west,
        }
    }

    pub fn center(&self) -> LatLon {
        LatLon {
            latitude: (self.north + self.south) / 2.0,
            longitude: (self.east + self.west) / 2.0,
        }
    }

    pub fn height_m(&self) -> f64 {
        (self.north - self.south) * METERS_PER_DEGREE
    }

    pub fn width_m(&self) -> f64 {
        let cos_lat = self.center().latitude.to_radians().cos();
        (self.east - self.west) * METERS_PER_DEGREE * cos_lat
    }

    pub fn contains(&self, point: LatLon) -> bool {
        (self.south..=self.north).contains(&point.latitude)
            && (self.west..=self.east).contains(&point.longitude)
    }

    pub fn intersection(&self, other: &GeoBounds) -> Option<GeoBounds> {
        let bounds = GeoBounds {
            north: self.north.min(other.north),
            south: self.south.max(other.south),
            east: self.east.min(other.east),
            west: self.west.max(other.west),
        };
        if bounds.north > bounds.south && bounds.east > bounds.west {
            Some(bounds)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_near_pole_stay_on_the_globe() {
        let bounds = GeoBounds::around(LatLon::new(89.99, 0.0), 5000.0);

        assert_eq!(bounds.north, 90.0);
        assert!(bounds.south < 89.99);
        assert!(bounds.east - bounds.west <= 360.0);
        assert!(bounds.west >= -180.0 && bounds.east <= 180.0);
    }

    #[test]
    fn bounds_at_mid_latitude_are_symmetric() {
        let center = LatLon::new(47.0, -122.0);
        let bounds = GeoBounds::around(center, 5000.0);

        assert!((bounds.height_m() - 10_000.0).abs() < 1e-6);
        assert!((bounds.center().latitude - center.latitude).abs() < 1e-12);
        assert!((bounds.center().longitude - center.longitude).abs() < 1e-12);
        assert!(bounds.contains(center));
    }
}
