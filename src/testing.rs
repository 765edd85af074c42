// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

//! California sample network shared by unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio_util::sync::CancellationToken;

use crate::osm::EdgeAttrs;
use crate::store::{
    CachedRoute, GraphStore, MemoryStore, StoreCounts, StoreError, ZipNode, ZipRecord,
};
use crate::{BoundingBox, Edge, Graph, Node, Point};

pub const LA: i64 = 1;
pub const SF: i64 = 2;
pub const SJ: i64 = 3;
pub const FRESNO: i64 = 4;
pub const SD: i64 = 5;
pub const SAC: i64 = 6;
pub const OAKLAND: i64 = 7;
pub const SB: i64 = 8;
pub const MV: i64 = 9;
pub const LAX: i64 = 10;

pub fn nodes() -> Vec<Node> {
    [
        (LA, -118.2437, 34.0522),
        (SF, -122.4194, 37.7749),
        (SJ, -121.8863, 37.3382),
        (FRESNO, -119.7871, 36.7378),
        (SD, -117.1611, 32.7157),
        (SAC, -121.4944, 38.5816),
        (OAKLAND, -122.2711, 37.8044),
        (SB, -119.7051, 34.4208),
        (MV, -122.0808, 37.3861),
        (LAX, -118.2437, 33.9425),
    ]
    .into_iter()
    .map(|(id, lon, lat)| Node {
        id,
        location: Point::new(lon, lat),
    })
    .collect()
}

/// Creates an edge with the `from * 1000 + to` id and default attributes.
pub fn edge(from: i64, to: i64, distance: f64, travel_time: f64) -> Edge {
    Edge {
        id: from * 1000 + to,
        from,
        to,
        distance,
        travel_time,
        attrs: EdgeAttrs::default(),
        way_id: None,
    }
}

/// Both directions of every road in the sample, with `travel_time = distance / 25`.
pub fn edges() -> Vec<Edge> {
    [
        (LA, FRESNO, 220_000.0, true),
        (FRESNO, SAC, 170_000.0, true),
        (SAC, OAKLAND, 130_000.0, true),
        (OAKLAND, SF, 20_000.0, true),
        (LA, SB, 150_000.0, true),
        (SB, SF, 480_000.0, true),
        (LA, LAX, 30_000.0, false),
        (SF, MV, 65_000.0, true),
        (SF, SJ, 75_000.0, true),
        (SJ, MV, 25_000.0, true),
        (SD, LA, 190_000.0, true),
        (SJ, FRESNO, 250_000.0, true),
        (OAKLAND, SJ, 65_000.0, true),
    ]
    .into_iter()
    .flat_map(|(a, b, distance, truck_allowed)| {
        [(a, b), (b, a)].map(|(from, to)| {
            let mut e = edge(from, to, distance, distance / 25.0);
            e.attrs.truck_allowed = truck_allowed;
            e
        })
    })
    .collect()
}

pub fn california() -> Graph {
    let mut g = Graph::new();
    for n in nodes() {
        g.add_node(n);
    }
    for e in edges() {
        g.add_edge(e).expect("sample edges must be valid");
    }
    g
}

/// [MemoryStore] holding the sample nodes and the provided edges.
pub async fn store_with_edges(edges: &[Edge]) -> MemoryStore {
    let store = MemoryStore::new();
    store.write_nodes(&nodes()).await.unwrap();
    store.write_edges(edges).await.unwrap();
    store
}

pub async fn california_store() -> MemoryStore {
    store_with_edges(&edges()).await
}

/// Two-row ZIP code export, in the `;`-separated layout of the USPS open data dump.
pub const ZIP_CSV: &str = "\
Zip Code;Official USPS city;Official USPS State Code;Geo Point;Timezone
90001;Los Angeles;CA;34.0500, -118.2400;America/Los_Angeles
94016;San Francisco;CA;37.7700, -122.4300;America/Los_Angeles
";

/// `n` ZIP codes from 90000 upwards, all around Los Angeles.
pub fn zip_csv(n: usize) -> String {
    let mut csv = String::from("Zip Code;Official USPS city;Official USPS State Code;Geo Point\n");
    for i in 0..n {
        let lat = 34.0 + i as f64 * 1e-4;
        csv.push_str(&format!("{};Los Angeles;CA;{lat:.4}, -118.2400\n", 90_000 + i));
    }
    csv
}

/// [MemoryStore] with injected write failures.
#[derive(Debug, Default)]
pub struct FaultyStore {
    pub inner: MemoryStore,

    /// Error returned by every `write_edges` call.
    pub edge_error: Option<fn() -> StoreError>,

    /// Error returned by the n-th (0-based) `upsert_zip_nodes` call.
    pub zip_error: Option<(usize, fn() -> StoreError)>,

    /// Number of errors returned by `create_indexes`.
    pub index_errors: usize,

    /// Canceled once the first batch of nodes is written.
    pub cancel_on_nodes: Option<CancellationToken>,

    pub edge_calls: AtomicUsize,
    pub zip_calls: AtomicUsize,
}

impl FaultyStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            ..Default::default()
        }
    }

    pub fn zip_nodes(&self) -> Vec<ZipNode> {
        self.inner.zip_nodes()
    }
}

impl GraphStore for FaultyStore {
    async fn migrate(&self) -> Result<(), StoreError> {
        self.inner.migrate().await
    }

    async fn write_nodes(&self, nodes: &[Node]) -> Result<(), StoreError> {
        self.inner.write_nodes(nodes).await?;
        if let Some(token) = &self.cancel_on_nodes {
            token.cancel();
        }
        Ok(())
    }

    async fn write_edges(&self, edges: &[Edge]) -> Result<(), StoreError> {
        self.edge_calls.fetch_add(1, Ordering::SeqCst);
        match self.edge_error {
            Some(error) => Err(error()),
            None => self.inner.write_edges(edges).await,
        }
    }

    async fn upsert_zip_nodes(&self, records: &[ZipRecord]) -> Result<u64, StoreError> {
        let call = self.zip_calls.fetch_add(1, Ordering::SeqCst);
        match self.zip_error {
            Some((n, error)) if n == call => Err(error()),
            _ => self.inner.upsert_zip_nodes(records).await,
        }
    }

    async fn create_indexes(&self) -> Vec<StoreError> {
        (0..self.index_errors)
            .map(|i| StoreError::Constraint(format!("index {i}")))
            .collect()
    }

    async fn nearest_node(&self, p: Point) -> Result<Option<(i64, Point, f64)>, StoreError> {
        self.inner.nearest_node(p).await
    }

    async fn zip_node(&self, zip_code: &str) -> Result<Option<i64>, StoreError> {
        self.inner.zip_node(zip_code).await
    }

    async fn load_graph(&self, region: Option<BoundingBox>) -> Result<Graph, StoreError> {
        self.inner.load_graph(region).await
    }

    async fn cached_route(
        &self,
        origin_zip: &str,
        dest_zip: &str,
        profile: &str,
    ) -> Result<Option<CachedRoute>, StoreError> {
        self.inner.cached_route(origin_zip, dest_zip, profile).await
    }

    async fn save_route(
        &self,
        origin_zip: &str,
        dest_zip: &str,
        profile: &str,
        route: CachedRoute,
    ) -> Result<(), StoreError> {
        self.inner.save_route(origin_zip, dest_zip, profile, route).await
    }

    async fn clear_route_cache(&self) -> Result<u64, StoreError> {
        self.inner.clear_route_cache().await
    }

    async fn counts(&self) -> Result<StoreCounts, StoreError> {
        self.inner.counts().await
    }
}
