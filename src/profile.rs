// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

use serde::{Deserialize, Serialize};

use crate::{Edge, Graph};

/// Kind of vehicle a route is computed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vehicle {
    #[default]
    Car,

    /// Heavy goods vehicle; only edges with `truck_allowed` are used.
    Truck,
}

/// Edge metric minimized by the route search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Optimize {
    #[default]
    Distance,
    Time,
}

/// Assumption about traffic conditions, expressed as a travel-time multiplier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepartureModel {
    #[default]
    BestGuess,
    Optimistic,
    Pessimistic,
}

impl DepartureModel {
    pub fn factor(&self) -> f64 {
        match self {
            Self::BestGuess => 1.0,
            Self::Optimistic => 0.9,
            Self::Pessimistic => 1.15,
        }
    }
}

/// Search strategy. [Algorithm::Dijkstra] runs the same search with a zero heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[default]
    AStar,
    Dijkstra,
}

/// Cost, constraint and avoidance parameters of a single route query.
///
/// The stored graph is profile-neutral: a Profile only decides, at relaxation time,
/// which edges may be used ([Profile::allows]) and how much they cost ([Profile::cost]).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    pub vehicle: Vehicle,
    pub optimize: Optimize,
    pub departure_model: DepartureModel,
    pub algorithm: Algorithm,

    /// Never use edges with `toll = true`.
    pub avoid_tolls: bool,

    /// Never use motorway or trunk edges.
    pub avoid_highways: bool,

    /// Accepted for compatibility; road edges carry no ferry attribute, so this has no effect.
    pub avoid_ferries: bool,

    /// Accepted for compatibility; road edges carry no indoor attribute, so this has no effect.
    pub avoid_indoor: bool,

    /// Gross vehicle weight. Edges with a known, lower `max_weight_kg` are not used.
    pub weight_kg: Option<f64>,

    /// Vehicle height. Edges with a known, lower `max_height_m` are not used.
    pub height_m: Option<f64>,
}

impl Profile {
    pub fn car() -> Self {
        Self::default()
    }

    pub fn truck() -> Self {
        Self {
            vehicle: Vehicle::Truck,
            ..Self::default()
        }
    }

    /// Checks whether an edge may be used by this profile.
    pub fn allows(&self, e: &Edge) -> bool {
        if self.vehicle == Vehicle::Truck && !e.attrs.truck_allowed {
            return false;
        }
        if self.avoid_tolls && e.attrs.toll {
            return false;
        }
        if self.avoid_highways && e.attrs.highway.is_some_and(|h| h.is_highway()) {
            return false;
        }
        if exceeds(self.weight_kg, e.attrs.max_weight_kg) {
            return false;
        }
        if exceeds(self.height_m, e.attrs.max_height_m) {
            return false;
        }
        true
    }

    /// Travel time over an edge, in seconds, scaled by the [DepartureModel].
    pub fn travel_time(&self, e: &Edge) -> f64 {
        e.travel_time * self.departure_model.factor()
    }

    /// Returns the cost of traversing an edge under the selected [Optimize] metric,
    /// or `None` if the edge can't be used.
    pub fn cost(&self, e: &Edge) -> Option<f64> {
        if !self.allows(e) {
            return None;
        }
        Some(match self.optimize {
            Optimize::Distance => e.distance,
            Optimize::Time => self.travel_time(e),
        })
    }

    /// Canonical text form of every field which may change the result of a query,
    /// used to key saved routes.
    pub fn cache_key(&self) -> String {
        let limit = |v: Option<f64>| v.map(|v| v.to_string()).unwrap_or_default();
        format!(
            "{}:{}:{}:{}:tolls={}:highways={}:ferries={}:indoor={}:weight={}:height={}",
            self.vehicle.as_str(),
            self.optimize.as_str(),
            self.departure_model.as_str(),
            self.algorithm.as_str(),
            self.avoid_tolls as u8,
            self.avoid_highways as u8,
            self.avoid_ferries as u8,
            self.avoid_indoor as u8,
            limit(self.weight_kg),
            limit(self.height_m),
        )
    }

    /// Multiplier converting straight-line meters into an admissible lower bound
    /// of the remaining [Profile::cost] over the given graph.
    ///
    /// Zero for [Algorithm::Dijkstra].
    pub fn heuristic_scale(&self, g: &Graph) -> f64 {
        match (self.algorithm, self.optimize) {
            (Algorithm::Dijkstra, _) => 0.0,
            (Algorithm::AStar, Optimize::Distance) => g.distance_lower_bound(),
            (Algorithm::AStar, Optimize::Time) => {
                g.time_lower_bound() * self.departure_model.factor()
            }
        }
    }
}

#[inline]
fn exceeds(vehicle: Option<f64>, limit: Option<f64>) -> bool {
    match (vehicle, limit) {
        (Some(v), Some(l)) => l < v,
        _ => false,
    }
}

macro_rules! impl_str_conversions {
    ($t:ty, $($s:literal => $v:path),+ $(,)?) => {
        impl $t {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($v => $s,)+
                }
            }
        }

        impl std::str::FromStr for $t {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok($v),)+
                    _ => Err(format!("unknown value: {s:?}")),
                }
            }
        }
    };
}

impl_str_conversions!(Vehicle, "car" => Vehicle::Car, "truck" => Vehicle::Truck);
impl_str_conversions!(Optimize, "distance" => Optimize::Distance, "time" => Optimize::Time);
impl_str_conversions!(
    DepartureModel,
    "best_guess" => DepartureModel::BestGuess,
    "optimistic" => DepartureModel::Optimistic,
    "pessimistic" => DepartureModel::Pessimistic,
);
impl_str_conversions!(Algorithm, "a_star" => Algorithm::AStar, "dijkstra" => Algorithm::Dijkstra);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::osm::HighwayClass;
    use crate::testing;

    fn sample_edge() -> Edge {
        testing::edge(1, 2, 1000.0, 40.0)
    }

    #[test]
    fn truck_access() {
        let mut e = sample_edge();
        e.attrs.truck_allowed = false;
        assert!(Profile::car().allows(&e));
        assert!(!Profile::truck().allows(&e));
    }

    #[test]
    fn avoidances() {
        let mut e = sample_edge();
        e.attrs.toll = true;
        e.attrs.highway = Some(HighwayClass::Trunk);

        let p = Profile {
            avoid_tolls: true,
            ..Profile::car()
        };
        assert!(!p.allows(&e));

        let p = Profile {
            avoid_highways: true,
            ..Profile::car()
        };
        assert!(!p.allows(&e));

        e.attrs.highway = Some(HighwayClass::Primary);
        assert!(p.allows(&e));

        let p = Profile {
            avoid_ferries: true,
            avoid_indoor: true,
            ..Profile::car()
        };
        assert!(p.allows(&e));
    }

    #[test]
    fn dimension_limits() {
        let mut e = sample_edge();
        let p = Profile {
            weight_kg: Some(20_000.0),
            height_m: Some(4.0),
            ..Profile::truck()
        };
        assert!(p.allows(&e));

        e.attrs.max_weight_kg = Some(7_500.0);
        assert!(!p.allows(&e));

        e.attrs.max_weight_kg = Some(40_000.0);
        e.attrs.max_height_m = Some(3.8);
        assert!(!p.allows(&e));

        e.attrs.max_height_m = Some(4.0);
        assert!(p.allows(&e));
    }

    #[test]
    fn cost_metrics() {
        let e = sample_edge();
        assert_eq!(Profile::car().cost(&e), Some(1000.0));

        let mut p = Profile {
            optimize: Optimize::Time,
            ..Profile::car()
        };
        assert_eq!(p.cost(&e), Some(40.0));

        p.departure_model = DepartureModel::Pessimistic;
        assert!((p.cost(&e).unwrap() - 46.0).abs() < 1e-9);

        p.departure_model = DepartureModel::Optimistic;
        assert!((p.cost(&e).unwrap() - 36.0).abs() < 1e-9);
    }

    #[test]
    fn dijkstra_has_no_heuristic() {
        let g = testing::california();
        let p = Profile {
            algorithm: Algorithm::Dijkstra,
            ..Profile::car()
        };
        assert_eq!(p.heuristic_scale(&g), 0.0);
        assert!(Profile::car().heuristic_scale(&g) > 0.0);
    }

    #[test]
    fn parse() {
        assert_eq!("truck".parse::<Vehicle>(), Ok(Vehicle::Truck));
        assert_eq!("time".parse::<Optimize>(), Ok(Optimize::Time));
        assert_eq!(
            "pessimistic".parse::<DepartureModel>(),
            Ok(DepartureModel::Pessimistic)
        );
        assert_eq!("dijkstra".parse::<Algorithm>(), Ok(Algorithm::Dijkstra));
        assert!("bike".parse::<Vehicle>().is_err());
        assert_eq!(DepartureModel::BestGuess.as_str(), "best_guess");
    }

    #[test]
    fn cache_keys() {
        assert_eq!(
            Profile::car().cache_key(),
            "car:distance:best_guess:a_star:tolls=0:highways=0:ferries=0:indoor=0:weight=:height="
        );

        let heavy = Profile {
            weight_kg: Some(36_000.0),
            height_m: Some(4.1),
            ..Profile::truck()
        };
        assert_eq!(
            heavy.cache_key(),
            "truck:distance:best_guess:a_star:tolls=0:highways=0:ferries=0:indoor=0:weight=36000:height=4.1"
        );
        assert_ne!(
            Profile::car().cache_key(),
            Profile {
                avoid_tolls: true,
                ..Profile::car()
            }
            .cache_key()
        );
    }
}
