// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

use crate::{earth_distance, Node, Point};

/// KDTree implements the [k-d tree data structure](https://en.wikipedia.org/wiki/K-d_tree),
/// which speeds up snapping arbitrary positions to the road network. A linear scan
/// over all nodes quickly dominates query time on regional graphs,
/// so stores without a spatial index keep one of these next to their nodes.
///
/// This implementation assumes euclidean geometry, even though distances are computed
/// with [earth_distance]. This results in undefined behavior when points
/// are close to the ante meridian (180°/-180° longitude) or poles (90°/-90° latitude),
/// or when the data spans multiple continents.
#[derive(Debug, Clone)]
pub struct KDTree {
    pivot: Node,
    left: Option<Box<KDTree>>,
    right: Option<Box<KDTree>>,
}

impl KDTree {
    /// Finds the closest [Node] to the given position,
    /// returning it together with the distance to it in meters.
    pub fn find_nearest_node(&self, p: Point) -> (Node, f64) {
        self.find_nearest_node_impl(p, false)
    }

    fn find_nearest_node_impl(&self, p: Point, lon_divides: bool) -> (Node, f64) {
        // Start by assuming that pivot is the closest
        let mut best = self.pivot;
        let mut best_dist = earth_distance(p, best.location);

        // Select which branch to recurse into first
        let first_left = if lon_divides {
            p.lon < best.location.lon
        } else {
            p.lat < best.location.lat
        };
        let (first, second) = if first_left {
            (&self.left, &self.right)
        } else {
            (&self.right, &self.left)
        };

        if let Some(ref branch) = first {
            let (alt, alt_dist) = branch.find_nearest_node_impl(p, !lon_divides);
            if alt_dist < best_dist {
                best = alt;
                best_dist = alt_dist;
            }
        }

        if let Some(ref branch) = second {
            // A closer node is possible in the second branch if and only if
            // the splitting axis is closer than the current best candidate.
            let axis = if lon_divides {
                Point::new(self.pivot.location.lon, p.lat)
            } else {
                Point::new(p.lon, self.pivot.location.lat)
            };

            if earth_distance(p, axis) < best_dist {
                let (alt, alt_dist) = branch.find_nearest_node_impl(p, !lon_divides);
                if alt_dist < best_dist {
                    best = alt;
                    best_dist = alt_dist;
                }
            }
        }

        (best, best_dist)
    }

    /// Builds a k-d tree from an iterable of [Nodes](Node).
    pub fn from_iter<I: IntoIterator<Item = Node>>(nodes: I) -> Option<Self> {
        let mut nodes = nodes.into_iter().collect::<Vec<_>>();
        Self::build(nodes.as_mut_slice())
    }

    /// Builds a k-d tree from a mutable slice of [Nodes](Node). Nodes will be reordered
    /// in the slice to facilitate building the tree.
    pub fn build(nodes: &mut [Node]) -> Option<Self> {
        Self::build_impl(nodes, false)
    }

    fn build_impl(nodes: &mut [Node], lon_divides: bool) -> Option<Self> {
        match nodes.len() {
            0 => None,
            1 => Some(Self {
                pivot: nodes[0],
                left: None,
                right: None,
            }),
            _ => {
                if lon_divides {
                    nodes.sort_by(|a, b| a.location.lon.total_cmp(&b.location.lon));
                } else {
                    nodes.sort_by(|a, b| a.location.lat.total_cmp(&b.location.lat));
                }
                let median = nodes.len() / 2;
                let pivot = nodes[median];
                let (left, right_and_pivot) = nodes.split_at_mut(median);
                let right = &mut right_and_pivot[1..];
                Some(Self {
                    pivot,
                    left: Self::build_impl(left, !lon_divides).map(Box::new),
                    right: Self::build_impl(right, !lon_divides).map(Box::new),
                })
            }
        }
    }
}
