//! Geographic helpers.

/// Mean Earth radius in meters.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance between two coordinates in meters (haversine).
pub fn great_circle_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let dphi = (lat2 - lat1).to_radians();
    let dlambda = (lon2 - lon1).to_radians();

    let a = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().asin()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_distance() {
        assert!(great_circle_distance(41.38, 2.18, 41.38, 2.18) < 1e-6);
    }

    #[test]
    fn known_distance() {
        // Barcelona (LEBL) to London Heathrow (EGLL), roughly 1140 km.
        let d = great_circle_distance(41.2971, 2.0785, 51.4706, -0.4619);
        assert!((d - 1_140_000.0).abs() < 15_000.0, "got {}", d);
    }

    #[test]
    fn symmetric() {
        let d1 = great_circle_distance(10.0, 20.0, -30.0, 40.0);
        let d2 = great_circle_distance(-30.0, 40.0, 10.0, 20.0);
        assert!((d1 - d2).abs() < 1e-6);
    }
}
