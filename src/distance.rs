// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

use serde::{Deserialize, Serialize};

/// Radius of Earth used by the Haversine formula, in statute miles.
pub const EARTH_RADIUS_MI: f64 = 3958.0;

/// Radius of Earth used by the Haversine formula, in kilometers.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// A WGS84 position, in decimal degrees.
///
/// Valid points satisfy `-180 ≤ lon ≤ 180` and `-90 ≤ lat ≤ 90`,
/// see [Point::is_valid].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub lon: f64,
    pub lat: f64,
}

impl Point {
    pub const fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }

    /// Checks that both coordinates are finite and within WGS84 bounds.
    pub fn is_valid(&self) -> bool {
        self.lon.is_finite()
            && self.lat.is_finite()
            && (-180.0..=180.0).contains(&self.lon)
            && (-90.0..=90.0).contains(&self.lat)
    }
}

impl std::fmt::Display for Point {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.lon, self.lat)
    }
}

/// Great-circle distance between two [Points](Point),
/// expressed in both miles and kilometers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Distance {
    pub miles: f64,
    pub kilometers: f64,
}

impl Distance {
    pub fn meters(&self) -> f64 {
        self.kilometers * 1000.0
    }
}

/// Calculates the great-circle distance between two positions
/// on Earth using the [haversine formula](https://en.wikipedia.org/wiki/Haversine_formula).
///
/// Both units come from the same central angle. The function never fails:
/// equal points give zero, and antipodal or polar inputs do not produce NaN.
pub fn haversine(a: Point, b: Point) -> Distance {
    let c = central_angle(a, b);
    Distance {
        miles: EARTH_RADIUS_MI * c,
        kilometers: EARTH_RADIUS_KM * c,
    }
}

/// Calculates the great-circle distance between two positions, in meters.
pub fn earth_distance(a: Point, b: Point) -> f64 {
    EARTH_RADIUS_KM * 1000.0 * central_angle(a, b)
}

fn central_angle(a: Point, b: Point) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();

    let sin_dlat_half = ((b.lat - a.lat).to_radians() * 0.5).sin();
    let sin_dlon_half = ((b.lon - a.lon).to_radians() * 0.5).sin();

    // Rounding can push h slightly outside of [0, 1] for (near-)antipodal points
    let h = (sin_dlat_half * sin_dlat_half
        + lat1.cos() * lat2.cos() * sin_dlon_half * sin_dlon_half)
        .clamp(0.0, 1.0);

    2.0 * h.sqrt().atan2((1.0 - h).sqrt())
}

/// Rectangular area in WGS84 degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub fn contains(&self, p: Point) -> bool {
        p.lon >= self.min_lon
            && p.lon <= self.max_lon
            && p.lat >= self.min_lat
            && p.lat <= self.max_lat
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    macro_rules! assert_almost_eq {
        ($a:expr, $b:expr, $eps:expr) => {
            assert!(
                (($a - $b).abs() < $eps),
                "assertion failed: {} ≈ {}",
                $a,
                $b
            )
        };
    }

    const LA: Point = Point::new(-118.2437, 34.0522);
    const SF: Point = Point::new(-122.4194, 37.7749);

    #[test]
    fn known_distance() {
        let d = haversine(LA, SF);
        assert_almost_eq!(d.kilometers, 559.1, 1.0);
        assert_almost_eq!(d.miles, d.kilometers * EARTH_RADIUS_MI / EARTH_RADIUS_KM, 1e-9);
        assert_almost_eq!(earth_distance(LA, SF), d.meters(), 1e-6);
    }

    #[test]
    fn symmetric() {
        let ab = earth_distance(LA, SF);
        let ba = earth_distance(SF, LA);
        assert!((ab - ba).abs() <= ab * 1e-6);
    }

    #[test]
    fn equal_points() {
        let d = haversine(SF, SF);
        assert_eq!(d.kilometers, 0.0);
        assert_eq!(d.miles, 0.0);
    }

    #[test]
    fn extremes_do_not_produce_nan() {
        let cases = [
            (Point::new(180.0, 0.0), Point::new(-180.0, 0.0)),
            (Point::new(0.0, 90.0), Point::new(0.0, -90.0)),
            (Point::new(0.0, 0.0), Point::new(180.0, 0.0)),
            (Point::new(45.0, 90.0), Point::new(-135.0, 90.0)),
        ];
        for (a, b) in cases {
            let d = earth_distance(a, b);
            assert!(d.is_finite(), "{a} → {b} gave {d}");
            assert!(d >= 0.0);
        }

        // Half the circumference for antipodes
        let half = std::f64::consts::PI * EARTH_RADIUS_KM * 1000.0;
        let poles = earth_distance(Point::new(0.0, 90.0), Point::new(0.0, -90.0));
        assert_almost_eq!(poles, half, 1e-3);
        let antimeridian = earth_distance(Point::new(180.0, 0.0), Point::new(-180.0, 0.0));
        assert_almost_eq!(antimeridian, 0.0, 1e-6);
    }

    #[test]
    fn point_validity() {
        assert!(LA.is_valid());
        assert!(Point::new(180.0, -90.0).is_valid());
        assert!(!Point::new(180.1, 0.0).is_valid());
        assert!(!Point::new(0.0, f64::NAN).is_valid());
    }

    #[test]
    fn bbox_contains() {
        let california = BoundingBox {
            min_lon: -125.0,
            min_lat: 32.0,
            max_lon: -114.0,
            max_lat: 42.0,
        };
        assert!(california.contains(LA));
        assert!(!california.contains(Point::new(-74.0, 40.7)));
    }
}
