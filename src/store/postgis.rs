// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

use std::collections::HashMap;
use std::time::{Duration, Instant};

use futures_util::TryStreamExt;
use log::{debug, info};
use sqlx::postgres::{PgPool, PgPoolOptions};

use super::{CachedRoute, GraphStore, StoreCounts, StoreError, ZipRecord};
use crate::osm::{EdgeAttrs, HighwayClass, SurfaceClass};
use crate::{BoundingBox, Edge, Graph, Node, Point};

const UPSERT_NODES: &str = "
INSERT INTO nodes (id, location)
SELECT t.id, ST_SetSRID(ST_MakePoint(t.lon, t.lat), 4326)::geography
FROM UNNEST($1::int8[], $2::float8[], $3::float8[]) AS t(id, lon, lat)
ON CONFLICT (id) DO UPDATE SET location = EXCLUDED.location";

const UPSERT_EDGES: &str = "
INSERT INTO edges (id, from_id, to_id, distance, travel_time, truck_allowed,
                   max_weight_kg, max_height_m, surface, toll, highway, osm_way_id)
SELECT * FROM UNNEST($1::int8[], $2::int8[], $3::int8[], $4::float8[], $5::float8[], $6::bool[],
                     $7::float8[], $8::float8[], $9::text[], $10::bool[], $11::text[], $12::int8[])
ON CONFLICT (id) DO UPDATE SET
    from_id = EXCLUDED.from_id,
    to_id = EXCLUDED.to_id,
    distance = EXCLUDED.distance,
    travel_time = EXCLUDED.travel_time,
    truck_allowed = EXCLUDED.truck_allowed,
    max_weight_kg = EXCLUDED.max_weight_kg,
    max_height_m = EXCLUDED.max_height_m,
    surface = EXCLUDED.surface,
    toll = EXCLUDED.toll,
    highway = EXCLUDED.highway,
    osm_way_id = EXCLUDED.osm_way_id";

const UPSERT_ZIP_NODES: &str = "
INSERT INTO zip_nodes (zip_code, node_id, centroid, state, city)
SELECT z.zip_code, n.id, ST_SetSRID(ST_MakePoint(z.lon, z.lat), 4326)::geography, z.state, z.city
FROM UNNEST($1::text[], $2::float8[], $3::float8[], $4::text[], $5::text[])
    AS z(zip_code, lon, lat, state, city)
CROSS JOIN LATERAL (
    SELECT nodes.id FROM nodes
    ORDER BY nodes.location <-> ST_SetSRID(ST_MakePoint(z.lon, z.lat), 4326)::geography
    LIMIT 1
) AS n
ON CONFLICT (zip_code) DO UPDATE SET
    node_id = EXCLUDED.node_id,
    centroid = EXCLUDED.centroid,
    state = EXCLUDED.state,
    city = EXCLUDED.city";

const NEAREST_NODE: &str = "
SELECT id,
       ST_X(location::geometry) AS lon,
       ST_Y(location::geometry) AS lat,
       ST_Distance(location, ST_SetSRID(ST_MakePoint($1, $2), 4326)::geography) AS distance
FROM nodes
ORDER BY location <-> ST_SetSRID(ST_MakePoint($1, $2), 4326)::geography
LIMIT 1";

const LOAD_NODES: &str = "
SELECT id, ST_X(location::geometry) AS lon, ST_Y(location::geometry) AS lat
FROM nodes
WHERE $1::float8 IS NULL
   OR location::geometry && ST_MakeEnvelope($1, $2, $3, $4, 4326)
ORDER BY id";

const LOAD_EDGES: &str = "
SELECT e.id, e.from_id, e.to_id, e.distance, e.travel_time, e.truck_allowed,
       e.max_weight_kg, e.max_height_m, e.surface, e.toll, e.highway, e.osm_way_id
FROM edges e
JOIN nodes a ON a.id = e.from_id
JOIN nodes b ON b.id = e.to_id
WHERE $1::float8 IS NULL
   OR (a.location::geometry && ST_MakeEnvelope($1, $2, $3, $4, 4326)
       AND b.location::geometry && ST_MakeEnvelope($1, $2, $3, $4, 4326))
ORDER BY e.id";

const CACHED_ROUTE: &str = "
SELECT distance, travel_time
FROM route_cache
WHERE origin_zip = $1 AND dest_zip = $2 AND profile = $3";

const SAVE_ROUTE: &str = "
INSERT INTO route_cache (origin_zip, dest_zip, profile, distance, travel_time)
VALUES ($1, $2, $3, $4, $5)
ON CONFLICT (origin_zip, dest_zip, profile) DO UPDATE SET
    distance = EXCLUDED.distance,
    travel_time = EXCLUDED.travel_time,
    calculated_at = now()";

/// Index builds which are independent of each other. Steps within a single
/// build run sequentially, as clustering requires its index to exist.
const INDEX_BUILDS: [&[&str]; 3] = [
    &["CREATE INDEX CONCURRENTLY IF NOT EXISTS idx_edges_distance ON edges (distance)"],
    &["CREATE INDEX CONCURRENTLY IF NOT EXISTS idx_edges_travel_time ON edges (travel_time)"],
    &[
        "CREATE INDEX CONCURRENTLY IF NOT EXISTS idx_nodes_location_cluster \
         ON nodes USING GIST (location) WITH (fillfactor = 90)",
        "CLUSTER nodes USING idx_nodes_location_cluster",
    ],
];

const ANALYZE: [&str; 2] = ["ANALYZE nodes", "ANALYZE edges"];

/// Container for the raw output of the node queries
#[derive(sqlx::FromRow, Debug, Clone, Copy)]
struct NodeRow {
    id: i64,
    lon: f64,
    lat: f64,
}

impl NodeRow {
    fn prepare(self) -> Node {
        Node {
            id: self.id,
            location: Point::new(self.lon, self.lat),
        }
    }
}

#[derive(sqlx::FromRow, Debug, Clone, Copy)]
struct NearestRow {
    id: i64,
    lon: f64,
    lat: f64,
    distance: f64,
}

/// Container for the raw output of the edges query
#[derive(sqlx::FromRow, Debug)]
struct EdgeRow {
    id: i64,
    from_id: i64,
    to_id: i64,
    distance: f64,
    travel_time: f64,
    truck_allowed: bool,
    max_weight_kg: Option<f64>,
    max_height_m: Option<f64>,
    surface: Option<String>,
    toll: bool,
    highway: Option<String>,
    osm_way_id: Option<i64>,
}

impl EdgeRow {
    /// Unpack the raw edge data into a format which can be loaded into the graph
    fn prepare(self) -> Edge {
        Edge {
            id: self.id,
            from: self.from_id,
            to: self.to_id,
            distance: self.distance,
            travel_time: self.travel_time,
            attrs: EdgeAttrs {
                truck_allowed: self.truck_allowed,
                max_weight_kg: self.max_weight_kg,
                max_height_m: self.max_height_m,
                surface: self.surface.as_deref().and_then(SurfaceClass::from_tag),
                toll: self.toll,
                highway: self.highway.as_deref().and_then(HighwayClass::from_tag),
            },
            way_id: self.osm_way_id,
        }
    }
}

/// [GraphStore] backed by PostgreSQL with the PostGIS extension.
#[derive(Debug, Clone)]
pub struct PostgisStore {
    pool: PgPool,
}

impl PostgisStore {
    /// Opens a connection pool to the database under `dsn`.
    ///
    /// Imports should size the pool to at least the number of writer workers
    /// plus three connections for the concurrent index builds.
    pub async fn connect(dsn: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(dsn)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn run_ddl(&self, steps: &[&str]) -> Result<(), StoreError> {
        for sql in steps {
            let started = Instant::now();
            sqlx::raw_sql(sql).execute(&self.pool).await?;
            debug!("{sql} took {:?}", started.elapsed());
        }
        Ok(())
    }
}

/// Removes earlier duplicates of the same key, keeping the last occurrence.
/// A single upsert statement may not touch the same row twice.
fn last_by_key<'a, T, K, F>(items: &'a [T], key: F) -> Vec<&'a T>
where
    K: std::hash::Hash + Eq,
    F: Fn(&'a T) -> K,
{
    let mut last: HashMap<K, usize> = HashMap::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        last.insert(key(item), i);
    }
    items
        .iter()
        .enumerate()
        .filter(|&(i, item)| last.get(&key(item)) == Some(&i))
        .map(|(_, item)| item)
        .collect()
}

impl GraphStore for PostgisStore {
    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn write_nodes(&self, nodes: &[Node]) -> Result<(), StoreError> {
        let nodes = last_by_key(nodes, |n| n.id);
        let ids: Vec<i64> = nodes.iter().map(|n| n.id).collect();
        let lons: Vec<f64> = nodes.iter().map(|n| n.location.lon).collect();
        let lats: Vec<f64> = nodes.iter().map(|n| n.location.lat).collect();

        sqlx::query(UPSERT_NODES)
            .bind(ids)
            .bind(lons)
            .bind(lats)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn write_edges(&self, edges: &[Edge]) -> Result<(), StoreError> {
        let edges = last_by_key(edges, |e| e.id);

        sqlx::query(UPSERT_EDGES)
            .bind(edges.iter().map(|e| e.id).collect::<Vec<_>>())
            .bind(edges.iter().map(|e| e.from).collect::<Vec<_>>())
            .bind(edges.iter().map(|e| e.to).collect::<Vec<_>>())
            .bind(edges.iter().map(|e| e.distance).collect::<Vec<_>>())
            .bind(edges.iter().map(|e| e.travel_time).collect::<Vec<_>>())
            .bind(edges.iter().map(|e| e.attrs.truck_allowed).collect::<Vec<_>>())
            .bind(edges.iter().map(|e| e.attrs.max_weight_kg).collect::<Vec<_>>())
            .bind(edges.iter().map(|e| e.attrs.max_height_m).collect::<Vec<_>>())
            .bind(
                edges
                    .iter()
                    .map(|e| e.attrs.surface.map(|s| s.as_str()))
                    .collect::<Vec<_>>(),
            )
            .bind(edges.iter().map(|e| e.attrs.toll).collect::<Vec<_>>())
            .bind(
                edges
                    .iter()
                    .map(|e| e.attrs.highway.map(|h| h.as_str()))
                    .collect::<Vec<_>>(),
            )
            .bind(edges.iter().map(|e| e.way_id).collect::<Vec<_>>())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_zip_nodes(&self, records: &[ZipRecord]) -> Result<u64, StoreError> {
        let records = last_by_key(records, |r| r.zip_code.as_str());

        let result = sqlx::query(UPSERT_ZIP_NODES)
            .bind(records.iter().map(|r| r.zip_code.as_str()).collect::<Vec<_>>())
            .bind(records.iter().map(|r| r.centroid.lon).collect::<Vec<_>>())
            .bind(records.iter().map(|r| r.centroid.lat).collect::<Vec<_>>())
            .bind(records.iter().map(|r| r.state.as_str()).collect::<Vec<_>>())
            .bind(records.iter().map(|r| r.city.as_str()).collect::<Vec<_>>())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn create_indexes(&self) -> Vec<StoreError> {
        let started = Instant::now();
        let (a, b, c) = tokio::join!(
            self.run_ddl(INDEX_BUILDS[0]),
            self.run_ddl(INDEX_BUILDS[1]),
            self.run_ddl(INDEX_BUILDS[2]),
        );
        let mut failures: Vec<StoreError> = [a, b, c].into_iter().filter_map(Result::err).collect();

        for sql in ANALYZE {
            if let Err(e) = self.run_ddl(&[sql]).await {
                failures.push(e);
            }
        }

        info!(
            "Index creation finished in {:?} with {} failure(s)",
            started.elapsed(),
            failures.len()
        );
        failures
    }

    async fn nearest_node(&self, p: Point) -> Result<Option<(i64, Point, f64)>, StoreError> {
        let row = sqlx::query_as::<_, NearestRow>(NEAREST_NODE)
            .bind(p.lon)
            .bind(p.lat)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| (r.id, Point::new(r.lon, r.lat), r.distance)))
    }

    async fn zip_node(&self, zip_code: &str) -> Result<Option<i64>, StoreError> {
        let id = sqlx::query_scalar::<_, i64>("SELECT node_id FROM zip_nodes WHERE zip_code = $1")
            .bind(zip_code)
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }

    async fn load_graph(&self, region: Option<BoundingBox>) -> Result<Graph, StoreError> {
        let started = Instant::now();
        let bounds = [
            region.map(|b| b.min_lon),
            region.map(|b| b.min_lat),
            region.map(|b| b.max_lon),
            region.map(|b| b.max_lat),
        ];
        let mut g = Graph::new();

        let mut nodes = sqlx::query_as::<_, NodeRow>(LOAD_NODES)
            .bind(bounds[0])
            .bind(bounds[1])
            .bind(bounds[2])
            .bind(bounds[3])
            .fetch(&self.pool);
        while let Some(row) = nodes.try_next().await? {
            g.add_node(row.prepare());
        }
        drop(nodes);

        let mut edges = sqlx::query_as::<_, EdgeRow>(LOAD_EDGES)
            .bind(bounds[0])
            .bind(bounds[1])
            .bind(bounds[2])
            .bind(bounds[3])
            .fetch(&self.pool);
        while let Some(row) = edges.try_next().await? {
            g.add_edge(row.prepare())
                .map_err(|e| StoreError::Constraint(e.to_string()))?;
        }

        info!(
            "Loaded {} nodes and {} edges in {:?}",
            g.len(),
            g.edge_count(),
            started.elapsed()
        );
        Ok(g)
    }

    async fn cached_route(
        &self,
        origin_zip: &str,
        dest_zip: &str,
        profile: &str,
    ) -> Result<Option<CachedRoute>, StoreError> {
        let row = sqlx::query_as::<_, (f64, f64)>(CACHED_ROUTE)
            .bind(origin_zip)
            .bind(dest_zip)
            .bind(profile)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(distance, travel_time)| CachedRoute {
            distance_meters: distance,
            travel_time_seconds: travel_time,
        }))
    }

    async fn save_route(
        &self,
        origin_zip: &str,
        dest_zip: &str,
        profile: &str,
        route: CachedRoute,
    ) -> Result<(), StoreError> {
        sqlx::query(SAVE_ROUTE)
            .bind(origin_zip)
            .bind(dest_zip)
            .bind(profile)
            .bind(route.distance_meters)
            .bind(route.travel_time_seconds)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn clear_route_cache(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM route_cache")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn counts(&self) -> Result<StoreCounts, StoreError> {
        let (nodes, edges, zip_nodes, cached_routes) =
            sqlx::query_as::<_, (i64, i64, i64, i64)>(
                "SELECT (SELECT count(*) FROM nodes), (SELECT count(*) FROM edges), \
                 (SELECT count(*) FROM zip_nodes), (SELECT count(*) FROM route_cache)",
            )
            .fetch_one(&self.pool)
            .await?;
        Ok(StoreCounts {
            nodes: nodes as u64,
            edges: edges as u64,
            zip_nodes: zip_nodes as u64,
            cached_routes: cached_routes as u64,
        })
    }
}
