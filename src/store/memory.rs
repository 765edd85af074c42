// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{CachedRoute, GraphStore, StoreCounts, StoreError, ZipNode, ZipRecord};
use crate::{BoundingBox, Edge, Graph, KDTree, Node, Point};

#[derive(Debug, Default)]
struct Inner {
    nodes: BTreeMap<i64, Node>,
    edges: BTreeMap<i64, Edge>,
    zip_nodes: BTreeMap<String, ZipNode>,

    /// Keyed by origin ZIP, destination ZIP and profile key.
    route_cache: BTreeMap<(String, String, String), CachedRoute>,

    /// Spatial index over `nodes`, rebuilt lazily after nodes change.
    index: Option<KDTree>,
}

impl Inner {
    fn nearest(&mut self, p: Point) -> Option<(Node, f64)> {
        if self.index.is_none() {
            self.index = KDTree::from_iter(self.nodes.values().copied());
        }
        self.index.as_ref().map(|tree| tree.find_nearest_node(p))
    }
}

/// [GraphStore] keeping all rows in process memory.
///
/// Enforces the same keys and references as the PostGIS schema,
/// which makes it a drop-in replacement for tests and small embedded datasets.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all stored ZIP code mappings, ordered by ZIP code.
    pub fn zip_nodes(&self) -> Vec<ZipNode> {
        self.lock().zip_nodes.values().cloned().collect()
    }

    /// Returns a snapshot of all stored edges, ordered by id.
    pub fn edges(&self) -> Vec<Edge> {
        self.lock().edges.values().copied().collect()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl GraphStore for MemoryStore {
    async fn migrate(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn write_nodes(&self, nodes: &[Node]) -> Result<(), StoreError> {
        if let Some(n) = nodes.iter().find(|n| !n.location.is_valid()) {
            return Err(StoreError::Constraint(format!(
                "node {} has an invalid location {}",
                n.id, n.location
            )));
        }

        let mut inner = self.lock();
        inner.nodes.extend(nodes.iter().map(|n| (n.id, *n)));
        inner.index = None;
        Ok(())
    }

    async fn write_edges(&self, edges: &[Edge]) -> Result<(), StoreError> {
        let mut inner = self.lock();

        // Validate the whole batch first, so that a failed batch leaves no rows behind
        for e in edges {
            for id in [e.from, e.to] {
                if !inner.nodes.contains_key(&id) {
                    return Err(StoreError::Constraint(format!(
                        "edge {} references missing node {}",
                        e.id, id
                    )));
                }
            }
            if !(e.distance >= 0.0 && e.travel_time >= 0.0) {
                return Err(StoreError::Constraint(format!(
                    "edge {} has a negative distance or travel time",
                    e.id
                )));
            }
        }

        inner.edges.extend(edges.iter().map(|e| (e.id, *e)));
        Ok(())
    }

    async fn upsert_zip_nodes(&self, records: &[ZipRecord]) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let mut written = 0;

        for r in records {
            let Some((node, _)) = inner.nearest(r.centroid) else {
                continue;
            };
            inner.zip_nodes.insert(
                r.zip_code.clone(),
                ZipNode {
                    zip_code: r.zip_code.clone(),
                    node_id: node.id,
                    centroid: r.centroid,
                    state: r.state.clone(),
                    city: r.city.clone(),
                },
            );
            written += 1;
        }

        Ok(written)
    }

    async fn create_indexes(&self) -> Vec<StoreError> {
        let mut inner = self.lock();
        if inner.index.is_none() {
            inner.index = KDTree::from_iter(inner.nodes.values().copied());
        }
        Vec::default()
    }

    async fn nearest_node(&self, p: Point) -> Result<Option<(i64, Point, f64)>, StoreError> {
        Ok(self
            .lock()
            .nearest(p)
            .map(|(n, dist)| (n.id, n.location, dist)))
    }

    async fn zip_node(&self, zip_code: &str) -> Result<Option<i64>, StoreError> {
        Ok(self.lock().zip_nodes.get(zip_code).map(|z| z.node_id))
    }

    async fn load_graph(&self, region: Option<BoundingBox>) -> Result<Graph, StoreError> {
        let inner = self.lock();
        let mut g = Graph::new();

        for n in inner.nodes.values() {
            if region.map_or(true, |bbox| bbox.contains(n.location)) {
                g.add_node(*n);
            }
        }

        for e in inner.edges.values() {
            if g.get_node(e.from).is_some() && g.get_node(e.to).is_some() {
                g.add_edge(*e)
                    .map_err(|err| StoreError::Constraint(err.to_string()))?;
            }
        }

        Ok(g)
    }

    async fn cached_route(
        &self,
        origin_zip: &str,
        dest_zip: &str,
        profile: &str,
    ) -> Result<Option<CachedRoute>, StoreError> {
        let key = (origin_zip.to_string(), dest_zip.to_string(), profile.to_string());
        Ok(self.lock().route_cache.get(&key).copied())
    }

    async fn save_route(
        &self,
        origin_zip: &str,
        dest_zip: &str,
        profile: &str,
        route: CachedRoute,
    ) -> Result<(), StoreError> {
        if !(route.distance_meters >= 0.0 && route.travel_time_seconds >= 0.0) {
            return Err(StoreError::Constraint(format!(
                "route {origin_zip} -> {dest_zip} has a negative distance or travel time"
            )));
        }

        let key = (origin_zip.to_string(), dest_zip.to_string(), profile.to_string());
        self.lock().route_cache.insert(key, route);
        Ok(())
    }

    async fn clear_route_cache(&self) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let removed = inner.route_cache.len() as u64;
        inner.route_cache.clear();
        Ok(removed)
    }

    async fn counts(&self) -> Result<StoreCounts, StoreError> {
        let inner = self.lock();
        Ok(StoreCounts {
            nodes: inner.nodes.len() as u64,
            edges: inner.edges.len() as u64,
            zip_nodes: inner.zip_nodes.len() as u64,
            cached_routes: inner.route_cache.len() as u64,
        })
    }
}
