// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use tokio_util::sync::CancellationToken;

use crate::{earth_distance, AStarError, Edge, Graph};

/// Number of node expansions between checks of the cancellation token.
const CANCEL_CHECK_INTERVAL: usize = 1024;

const NO_EDGE: u32 = u32::MAX;

/// A route found by [find_route].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Path {
    /// Ids of visited nodes, starting with the origin and ending with the destination.
    pub nodes: Vec<i64>,

    /// Ids of traversed edges; always one shorter than `nodes`.
    pub edges: Vec<i64>,

    /// Sum of the costs of all traversed edges.
    pub cost: f64,
}

#[derive(Debug, Clone, Copy)]
struct QueueItem {
    at: u32,
    id: i64,
    cost: f64,
    heuristic: f64,
}

impl QueueItem {
    #[inline]
    fn score(&self) -> f64 {
        self.cost + self.heuristic
    }
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueItem {}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // NOTE: We revert the order of comparison,
        // as lower scores are considered better ("higher"),
        // and Rust's BinaryHeap is a max-heap.
        // Ties are broken by the lower heuristic, then by the lower node id.
        other
            .score()
            .total_cmp(&self.score())
            .then_with(|| other.heuristic.total_cmp(&self.heuristic))
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// Uses the [A* algorithm](https://en.wikipedia.org/wiki/A*_search_algorithm)
/// to find the cheapest route between two nodes in the provided graph.
///
/// `cost` returns the cost of traversing an edge, or `None` if the edge
/// must not be used. Returned costs must be finite and non-negative.
///
/// The heuristic is the straight-line distance to the destination (in meters)
/// multiplied by `heuristic_scale`. It stays admissible and consistent as long as
/// no edge costs less than `heuristic_scale` times the straight-line distance between
/// its endpoints; see [Graph::distance_lower_bound] and [Graph::time_lower_bound].
/// A scale of zero turns the search into Dijkstra's algorithm.
///
/// Returns `Ok(None)` if the destination is unreachable.
///
/// `step_limit` limits how many nodes may be expanded during the search
/// before returning [AStarError::StepLimitExceeded]. Concluding that no route exists requires
/// expanding all nodes accessible from the start, which is usually very time-consuming,
/// especially on large datasets. The recommended value is
/// [DEFAULT_STEP_LIMIT](crate::DEFAULT_STEP_LIMIT).
pub fn find_route<F>(
    g: &Graph,
    from_id: i64,
    to_id: i64,
    cost: F,
    heuristic_scale: f64,
    step_limit: usize,
    cancel: &CancellationToken,
) -> Result<Option<Path>, AStarError>
where
    F: Fn(&Edge) -> Option<f64>,
{
    let from = g
        .index_of(from_id)
        .ok_or(AStarError::InvalidReference(from_id))?;
    let to = g
        .index_of(to_id)
        .ok_or(AStarError::InvalidReference(to_id))?;
    let target = g.node_at(to).location;
    let heuristic = |idx: u32| heuristic_scale * earth_distance(g.node_at(idx).location, target);

    let mut queue: BinaryHeap<QueueItem> = BinaryHeap::default();
    let mut known_costs: Vec<f64> = vec![f64::INFINITY; g.len()];
    let mut came_from: Vec<(u32, u32)> = vec![(NO_EDGE, NO_EDGE); g.len()];
    let mut closed: Vec<bool> = vec![false; g.len()];
    let mut steps: usize = 0;

    known_costs[from as usize] = 0.0;
    queue.push(QueueItem {
        at: from,
        id: from_id,
        cost: 0.0,
        heuristic: heuristic(from),
    });

    while let Some(item) = queue.pop() {
        if item.at == to {
            return Ok(Some(reconstruct_path(g, &came_from, to, item.cost)));
        }

        // Multiple items may be queued for the same node; only the first one is expanded.
        if closed[item.at as usize] {
            continue;
        }
        closed[item.at as usize] = true;

        steps += 1;
        if steps > step_limit {
            return Err(AStarError::StepLimitExceeded);
        }
        if steps % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
            return Err(AStarError::Canceled);
        }

        for (edge_idx, neighbor) in g.outgoing(item.at) {
            if closed[neighbor as usize] {
                continue;
            }

            let Some(edge_cost) = cost(g.edge_at(edge_idx)) else {
                continue;
            };
            debug_assert!(edge_cost.is_finite() && edge_cost >= 0.0);

            // Check if this is the cheapest way to the neighbor
            let neighbor_cost = item.cost + edge_cost;
            if neighbor_cost >= known_costs[neighbor as usize] {
                continue;
            }

            came_from[neighbor as usize] = (edge_idx, item.at);
            known_costs[neighbor as usize] = neighbor_cost;
            queue.push(QueueItem {
                at: neighbor,
                id: g.node_at(neighbor).id,
                cost: neighbor_cost,
                heuristic: heuristic(neighbor),
            });
        }
    }

    Ok(None)
}

fn reconstruct_path(g: &Graph, came_from: &[(u32, u32)], mut last: u32, cost: f64) -> Path {
    let mut nodes = vec![g.node_at(last).id];
    let mut edges = Vec::default();

    loop {
        let (edge_idx, prev) = came_from[last as usize];
        if edge_idx == NO_EDGE {
            break;
        }
        edges.push(g.edge_at(edge_idx).id);
        nodes.push(g.node_at(prev).id);
        last = prev;
    }

    nodes.reverse();
    edges.reverse();
    Path { nodes, edges, cost }
}
