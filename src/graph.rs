// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

use std::collections::hash_map::{Entry, HashMap};

use serde::{Deserialize, Serialize};

use crate::osm::EdgeAttrs;
use crate::{earth_distance, Point};

/// A vertex of the road network, usually an OpenStreetMap node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: i64,
    pub location: Point,
}

/// A directed, routable road segment between two [Nodes](Node).
///
/// Two-way roads are represented by two edges, one in each direction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: i64,
    pub from: i64,
    pub to: i64,

    /// Length of the segment, in meters.
    pub distance: f64,

    /// Time required to traverse the segment, in seconds.
    pub travel_time: f64,

    pub attrs: EdgeAttrs,

    /// Id of the OpenStreetMap way this segment comes from, if any.
    pub way_id: Option<i64>,
}

/// Violations of the [Graph] invariants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("duplicate edge id {0}")]
    Conflict(i64),

    #[error("edge references unknown node {0}")]
    MissingNode(i64),

    #[error("edge {0} has a negative or non-finite distance or travel time")]
    InvalidWeight(i64),
}

/// In-memory road network: an arena of [Nodes](Node) and [Edges](Edge),
/// with per-node outgoing adjacency lists.
///
/// Nodes and edges are addressed by their stable 64-bit ids from the outside,
/// and by dense `u32` indices inside route search.
#[derive(Debug, Clone)]
pub struct Graph {
    nodes: Vec<Node>,
    adjacency: Vec<Vec<u32>>,
    edges: Vec<Edge>,
    edge_targets: Vec<u32>,
    node_index: HashMap<i64, u32>,
    edge_index: HashMap<i64, u32>,

    /// Lowest ratio of edge distance to the straight-line distance between its nodes, capped at 1.
    distance_ratio: f64,

    /// Lowest ratio of edge travel time to the straight-line distance between its nodes,
    /// i.e. the inverse of the fastest straight-line speed.
    time_ratio: f64,
}

impl Default for Graph {
    fn default() -> Self {
        Self {
            nodes: Vec::default(),
            adjacency: Vec::default(),
            edges: Vec::default(),
            edge_targets: Vec::default(),
            node_index: HashMap::default(),
            edge_index: HashMap::default(),
            distance_ratio: 1.0,
            time_ratio: f64::INFINITY,
        }
    }
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of nodes in the graph.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns the number of edges in the graph.
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Returns an iterator over all [Nodes](Node), in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    /// Returns an iterator over all [Edges](Edge), in insertion order.
    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter()
    }

    /// Retrieves a [Node] with the provided id.
    pub fn get_node(&self, id: i64) -> Option<&Node> {
        self.node_index.get(&id).map(|&idx| &self.nodes[idx as usize])
    }

    /// Retrieves an [Edge] with the provided id.
    pub fn get_edge(&self, id: i64) -> Option<&Edge> {
        self.edge_index.get(&id).map(|&idx| &self.edges[idx as usize])
    }

    /// Inserts a [Node]. Returns false, leaving the existing node untouched,
    /// if a node with the same id is already present.
    pub fn add_node(&mut self, node: Node) -> bool {
        match self.node_index.entry(node.id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(e) => {
                let idx = u32::try_from(self.nodes.len()).expect("graph node capacity exceeded");
                e.insert(idx);
                self.nodes.push(node);
                self.adjacency.push(Vec::default());
                true
            }
        }
    }

    /// Inserts an [Edge] and appends it to the outgoing edges of `edge.from`.
    ///
    /// Both endpoints must already exist, the edge id must be unused,
    /// and the distance and travel time must be finite and non-negative.
    pub fn add_edge(&mut self, edge: Edge) -> Result<(), GraphError> {
        if !(edge.distance.is_finite()
            && edge.travel_time.is_finite()
            && edge.distance >= 0.0
            && edge.travel_time >= 0.0)
        {
            return Err(GraphError::InvalidWeight(edge.id));
        }

        let from_idx = *self
            .node_index
            .get(&edge.from)
            .ok_or(GraphError::MissingNode(edge.from))?;
        let to_idx = *self
            .node_index
            .get(&edge.to)
            .ok_or(GraphError::MissingNode(edge.to))?;

        let edge_idx = u32::try_from(self.edges.len()).expect("graph edge capacity exceeded");
        match self.edge_index.entry(edge.id) {
            Entry::Occupied(_) => return Err(GraphError::Conflict(edge.id)),
            Entry::Vacant(e) => e.insert(edge_idx),
        };

        let straight = earth_distance(
            self.nodes[from_idx as usize].location,
            self.nodes[to_idx as usize].location,
        );
        if straight > 0.0 {
            self.distance_ratio = self.distance_ratio.min(edge.distance / straight);
            self.time_ratio = self.time_ratio.min(edge.travel_time / straight);
        }

        self.edges.push(edge);
        self.edge_targets.push(to_idx);
        self.adjacency[from_idx as usize].push(edge_idx);
        Ok(())
    }

    /// Returns the outgoing [Edges](Edge) of a node, in insertion order.
    /// Unknown nodes have no neighbors.
    pub fn neighbors(&self, id: i64) -> impl Iterator<Item = &Edge> + '_ {
        self.node_index
            .get(&id)
            .map(|&idx| self.adjacency[idx as usize].as_slice())
            .unwrap_or_default()
            .iter()
            .map(move |&e| &self.edges[e as usize])
    }

    /// Lower bound on edge distance per meter of straight-line distance, at most 1.
    /// Multiplying a straight-line distance by this value gives an admissible
    /// estimate of the remaining distance.
    pub fn distance_lower_bound(&self) -> f64 {
        self.distance_ratio.clamp(0.0, 1.0)
    }

    /// Lower bound on seconds of travel per meter of straight-line distance,
    /// i.e. the inverse of the fastest edge speed. Zero if no edge constrains it.
    pub fn time_lower_bound(&self) -> f64 {
        if self.time_ratio.is_finite() {
            self.time_ratio.max(0.0)
        } else {
            0.0
        }
    }

    #[inline]
    pub(crate) fn index_of(&self, id: i64) -> Option<u32> {
        self.node_index.get(&id).copied()
    }

    #[inline]
    pub(crate) fn node_at(&self, idx: u32) -> &Node {
        &self.nodes[idx as usize]
    }

    #[inline]
    pub(crate) fn edge_at(&self, idx: u32) -> &Edge {
        &self.edges[idx as usize]
    }

    /// Outgoing edges of the node at `idx` as `(edge index, target node index)` pairs.
    #[inline]
    pub(crate) fn outgoing(&self, idx: u32) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.adjacency[idx as usize]
            .iter()
            .map(move |&e| (e, self.edge_targets[e as usize]))
    }
}
