// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Routable values of the [highway](https://wiki.openstreetmap.org/wiki/Key:highway) tag,
/// ordered from the most to the least important road class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HighwayClass {
    Motorway,
    Trunk,
    Primary,
    Secondary,
    Tertiary,
    Unclassified,
    Residential,
    Service,
}

impl HighwayClass {
    pub const ALL: [HighwayClass; 8] = [
        Self::Motorway,
        Self::Trunk,
        Self::Primary,
        Self::Secondary,
        Self::Tertiary,
        Self::Unclassified,
        Self::Residential,
        Self::Service,
    ];

    /// Parses the value of a `highway` tag. Returns `None` for non-routable values.
    pub fn from_tag(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == value)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Motorway => "motorway",
            Self::Trunk => "trunk",
            Self::Primary => "primary",
            Self::Secondary => "secondary",
            Self::Tertiary => "tertiary",
            Self::Unclassified => "unclassified",
            Self::Residential => "residential",
            Self::Service => "service",
        }
    }

    /// Assumed speed, in km/h, when no usable `maxspeed` tag is present.
    pub fn default_speed_kmh(&self) -> f64 {
        match self {
            Self::Motorway => 80.0,
            Self::Trunk => 70.0,
            Self::Primary => 60.0,
            Self::Secondary => 50.0,
            Self::Tertiary => 40.0,
            Self::Unclassified => 30.0,
            Self::Residential => 25.0,
            Self::Service => 15.0,
        }
    }

    /// Heavy-goods-vehicle access when no `hgv` or `access` tag decides it.
    pub fn default_truck_access(&self) -> bool {
        !matches!(self, Self::Service)
    }

    /// Returns true for motorways and trunk roads, the classes excluded by `avoid_highways`.
    pub fn is_highway(&self) -> bool {
        matches!(self, Self::Motorway | Self::Trunk)
    }
}

impl std::fmt::Display for HighwayClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse interpretation of the [surface](https://wiki.openstreetmap.org/wiki/Key:surface) tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurfaceClass {
    Paved,
    Unpaved,
}

impl SurfaceClass {
    pub fn from_tag(value: &str) -> Option<Self> {
        match value {
            "paved" | "asphalt" | "chipseal" | "concrete" | "concrete:plates"
            | "concrete:lanes" | "paving_stones" | "sett" | "cobblestone" | "metal" | "wood" => {
                Some(Self::Paved)
            }

            "unpaved" | "compacted" | "fine_gravel" | "gravel" | "pebblestone" | "rock"
            | "ground" | "dirt" | "earth" | "grass" | "mud" | "sand" | "woodchips" => {
                Some(Self::Unpaved)
            }

            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Paved => "paved",
            Self::Unpaved => "unpaved",
        }
    }
}

/// Routing-relevant attributes of a road segment, derived from the tags of its way.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EdgeAttrs {
    pub truck_allowed: bool,
    pub max_weight_kg: Option<f64>,
    pub max_height_m: Option<f64>,
    pub surface: Option<SurfaceClass>,
    pub toll: bool,
    pub highway: Option<HighwayClass>,
}

impl Default for EdgeAttrs {
    fn default() -> Self {
        Self {
            truck_allowed: true,
            max_weight_kg: None,
            max_height_m: None,
            surface: None,
            toll: false,
            highway: None,
        }
    }
}

/// Traversal directions permitted along a way, relative to the order of its nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Direction {
    pub forward: bool,
    pub backward: bool,
}

/// Result of classifying a routable way.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WayClassification {
    pub attrs: EdgeAttrs,
    pub speed_kmh: f64,
    pub direction: Direction,
}

/// Converts raw OSM way tags into routable edge attributes.
///
/// Returns `None` for ways which are not routable: ways without a `highway` tag,
/// with an unsupported `highway` value, or which can't be traversed in any direction.
pub fn classify_way(tags: &HashMap<String, String>) -> Option<WayClassification> {
    let highway = HighwayClass::from_tag(tag(tags, "highway"))?;

    let direction = way_direction(tags, highway);
    if !direction.forward && !direction.backward {
        return None;
    }

    let speed_kmh = tags
        .get("maxspeed")
        .and_then(|v| parse_speed_kmh(v))
        .unwrap_or_else(|| highway.default_speed_kmh());

    let attrs = EdgeAttrs {
        truck_allowed: truck_access(tags, highway),
        max_weight_kg: tags.get("maxweight").and_then(|v| parse_weight_kg(v)),
        max_height_m: tags.get("maxheight").and_then(|v| parse_height_m(v)),
        surface: tags.get("surface").and_then(|v| SurfaceClass::from_tag(v)),
        toll: is_truthy(tag(tags, "toll")),
        highway: Some(highway),
    };

    Some(WayClassification {
        attrs,
        speed_kmh,
        direction,
    })
}

/// Decides heavy-goods-vehicle access.
/// The most specific tag wins: `hgv` over `access` over the class default.
fn truck_access(tags: &HashMap<String, String>, highway: HighwayClass) -> bool {
    match tag(tags, "hgv") {
        "no" => return false,
        "yes" | "designated" | "destination" | "delivery" | "permissive" | "agricultural" => {
            return true
        }
        _ => {}
    }

    if tag(tags, "access") == "no" {
        return false;
    }

    highway.default_truck_access()
}

/// Checks if a way is traversable forward and backwards, by investigating the `oneway` tag.
///
/// Motorways and roundabouts default to being one-way, except if overridden by `oneway=no`.
fn way_direction(tags: &HashMap<String, String>, highway: HighwayClass) -> Direction {
    let mut d = Direction {
        forward: true,
        backward: true,
    };

    if highway == HighwayClass::Motorway {
        d.backward = false;
    }

    if matches!(tag(tags, "junction"), "roundabout" | "circular") {
        d.backward = false;
    }

    match tag(tags, "oneway") {
        "yes" | "true" | "1" => {
            d.forward = true;
            d.backward = false;
        }

        "-1" | "reverse" => {
            d.forward = false;
            d.backward = true;
        }

        "no" | "false" | "0" => {
            d.forward = true;
            d.backward = true;
        }

        _ => {}
    }

    d
}

#[inline]
fn tag<'t>(tags: &'t HashMap<String, String>, key: &str) -> &'t str {
    tags.get(key).map(|v| v.as_str()).unwrap_or("")
}

#[inline]
fn is_truthy(value: &str) -> bool {
    matches!(value, "yes" | "true" | "1")
}

const KMH_PER_MPH: f64 = 1.609344;
const KG_PER_LB: f64 = 0.45359237;
const KG_PER_SHORT_TON: f64 = 907.18474;
const M_PER_FOOT: f64 = 0.3048;
const M_PER_INCH: f64 = 0.0254;

/// Splits a tag value like "7.5 t" or "30mph" into its numeric part and a trimmed unit suffix.
fn split_number(value: &str) -> Option<(f64, &str)> {
    let value = value.trim();
    let end = value
        .char_indices()
        .find(|&(_, c)| !(c.is_ascii_digit() || c == '.'))
        .map(|(i, _)| i)
        .unwrap_or(value.len());
    let number = value[..end].parse::<f64>().ok()?;
    if !number.is_finite() || number < 0.0 {
        return None;
    }
    Some((number, value[end..].trim()))
}

/// Parses a [maxspeed](https://wiki.openstreetmap.org/wiki/Key:maxspeed) value into km/h.
/// Symbolic values ("none", "signals", "walk", "RO:urban") are ignored.
pub fn parse_speed_kmh(value: &str) -> Option<f64> {
    let (n, unit) = split_number(value)?;
    let kmh = match unit {
        "" | "km/h" | "kmh" | "kph" => n,
        "mph" => n * KMH_PER_MPH,
        "knots" => n * 1.852,
        _ => return None,
    };
    if kmh > 0.0 {
        Some(kmh)
    } else {
        None
    }
}

/// Parses a [maxweight](https://wiki.openstreetmap.org/wiki/Key:maxweight) value into kilograms.
/// Values without a unit are in metric tonnes.
pub fn parse_weight_kg(value: &str) -> Option<f64> {
    let (n, unit) = split_number(value)?;
    let kg = match unit {
        "" | "t" => n * 1000.0,
        "kg" => n,
        "lbs" | "lb" => n * KG_PER_LB,
        "st" => n * KG_PER_SHORT_TON,
        _ => return None,
    };
    Some(kg)
}

/// Parses a [maxheight](https://wiki.openstreetmap.org/wiki/Key:maxheight) value into meters.
/// Values without a unit are in meters; imperial values may be written as `14'6"` or `14 ft`.
pub fn parse_height_m(value: &str) -> Option<f64> {
    let value = value.trim();

    if let Some((feet, rest)) = value.split_once('\'') {
        let feet = feet.trim().parse::<f64>().ok()?;
        let inches = rest.trim().trim_end_matches('"').trim();
        let inches = if inches.is_empty() {
            0.0
        } else {
            inches.parse::<f64>().ok()?
        };
        let m = feet * M_PER_FOOT + inches * M_PER_INCH;
        return if m.is_finite() && m >= 0.0 { Some(m) } else { None };
    }

    let (n, unit) = split_number(value)?;
    match unit {
        "" | "m" => Some(n),
        "ft" => Some(n * M_PER_FOOT),
        _ => None,
    }
}
