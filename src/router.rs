// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::osm::is_valid_zip;
use crate::profile::{Algorithm, Profile};
use crate::store::{CachedRoute, GraphStore, StoreError};
use crate::{find_route, AStarError, BoundingBox, Graph, Point, DEFAULT_STEP_LIMIT};

const METERS_PER_MILE: f64 = 1609.344;

/// One end of a route query.
#[derive(Debug, Clone, PartialEq)]
pub enum Endpoint {
    Node(i64),
    Point(Point),
    Zip(String),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node(id) => write!(f, "node {id}"),
            Self::Point(p) => write!(f, "point {p}"),
            Self::Zip(code) => write!(f, "ZIP {code}"),
        }
    }
}

/// Parses `node:<id>`, `<lon>,<lat>` or a ZIP code.
///
/// Anything which is neither a node nor a point is taken to be a ZIP code,
/// whose format is checked only by [Router::route].
impl FromStr for Endpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        if let Some(id) = s.strip_prefix("node:") {
            return id
                .trim()
                .parse()
                .map(Self::Node)
                .map_err(|e| format!("invalid node id {id:?}: {e}"));
        }

        if let Some((lon, lat)) = s.split_once(',') {
            let lon: f64 = lon.trim().parse().map_err(|e| format!("invalid longitude: {e}"))?;
            let lat: f64 = lat.trim().parse().map_err(|e| format!("invalid latitude: {e}"))?;
            let p = Point::new(lon, lat);
            return if p.is_valid() {
                Ok(Self::Point(p))
            } else {
                Err(format!("coordinates out of range: {p}"))
            };
        }

        Ok(Self::Zip(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundReason {
    Unreachable,
    UnknownZip,
    InvalidZip,
}

impl fmt::Display for NotFoundReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unreachable => "unreachable",
            Self::UnknownZip => "unknown zip",
            Self::InvalidZip => "invalid zip",
        })
    }
}

/// Error conditions which may occur during [Router::route].
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("route not found: {reason}")]
    NotFound { reason: NotFoundReason },

    #[error("{0} is outside of the graph coverage")]
    OutOfCoverage(String),

    #[error("route query canceled")]
    Canceled,

    #[error("route too complex: step limit exceeded")]
    StepLimitExceeded,

    #[error("storage: {0}")]
    Storage(#[from] StoreError),
}

impl RouteError {
    fn not_found(reason: NotFoundReason) -> Self {
        Self::NotFound { reason }
    }
}

/// A found route with its totals.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RouteResult {
    pub nodes: Vec<i64>,
    pub edges: Vec<i64>,
    pub total_distance_meters: f64,

    /// Sum of edge travel times, scaled by the departure model of the query.
    pub total_travel_time_seconds: f64,

    /// Set if the search ran without a heuristic.
    pub dijkstra: bool,
}

impl RouteResult {
    pub fn distance_miles(&self) -> f64 {
        self.total_distance_meters / METERS_PER_MILE
    }

    pub fn travel_time_minutes(&self) -> f64 {
        self.total_travel_time_seconds / 60.0
    }
}

/// Totals of a route between two ZIP codes, see [Router::zip_route].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RouteSummary {
    pub distance_meters: f64,
    pub travel_time_seconds: f64,

    /// Set if the totals were saved by an earlier query.
    pub cache_hit: bool,
}

impl RouteSummary {
    pub fn distance_miles(&self) -> f64 {
        self.distance_meters / METERS_PER_MILE
    }

    pub fn travel_time_minutes(&self) -> f64 {
        self.travel_time_seconds / 60.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RouterConfig {
    /// Part of the stored graph projected into memory; `None` loads everything.
    pub region: Option<BoundingBox>,

    /// Points further than this from the closest node are out of coverage.
    pub max_snap_distance_m: f64,

    /// See [find_route].
    pub step_limit: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            region: None,
            max_snap_distance_m: 25_000.0,
            step_limit: DEFAULT_STEP_LIMIT,
        }
    }
}

/// Answers route queries over a [GraphStore].
///
/// The graph (or its configured region) is loaded into memory on the first query
/// and shared read-only by all following queries. Endpoints are resolved
/// through the store, and every search runs on a blocking thread.
#[derive(Debug)]
pub struct Router<S: GraphStore> {
    store: S,
    config: RouterConfig,
    graph: OnceCell<Arc<Graph>>,
}

impl<S: GraphStore> Router<S> {
    pub fn new(store: S, config: RouterConfig) -> Self {
        Self {
            store,
            config,
            graph: OnceCell::new(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Returns the in-memory projection of the stored graph, loading it if necessary.
    pub async fn graph(&self) -> Result<Arc<Graph>, StoreError> {
        self.graph
            .get_or_try_init(|| async {
                let g = self.store.load_graph(self.config.region).await?;
                info!(
                    "Loaded routing graph: {} nodes, {} edges",
                    g.len(),
                    g.edge_count()
                );
                Ok(Arc::new(g))
            })
            .await
            .cloned()
    }

    /// Finds the cheapest route between two endpoints under the given [Profile].
    pub async fn route(
        &self,
        origin: &Endpoint,
        destination: &Endpoint,
        profile: &Profile,
        cancel: &CancellationToken,
    ) -> Result<RouteResult, RouteError> {
        for e in [origin, destination] {
            if let Endpoint::Zip(code) = e {
                if !is_valid_zip(code) {
                    return Err(RouteError::not_found(NotFoundReason::InvalidZip));
                }
            }
        }

        let g = self.graph().await?;
        let from = self.resolve(&g, origin, cancel).await?;
        let to = self.resolve(&g, destination, cancel).await?;
        debug!("Routing {origin} ({from}) -> {destination} ({to}) with {profile:?}");

        let heuristic_scale = profile.heuristic_scale(&g);
        let dijkstra = heuristic_scale == 0.0;

        if from == to {
            return Ok(RouteResult {
                nodes: vec![from],
                dijkstra,
                ..Default::default()
            });
        }

        let profile = *profile;
        let step_limit = self.config.step_limit;
        let cancel = cancel.clone();
        let search = tokio::task::spawn_blocking(move || {
            let path = find_route(
                &g,
                from,
                to,
                |e| profile.cost(e),
                heuristic_scale,
                step_limit,
                &cancel,
            );

            path.map(|found| {
                found.map(|path| {
                    let mut result = RouteResult {
                        nodes: path.nodes,
                        edges: path.edges,
                        dijkstra,
                        ..Default::default()
                    };
                    for e in result.edges.iter().filter_map(|&id| g.get_edge(id)) {
                        result.total_distance_meters += e.distance;
                        result.total_travel_time_seconds += profile.travel_time(e);
                    }
                    result
                })
            })
        });

        let found = match search.await {
            Ok(found) => found,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => return Err(RouteError::Canceled),
        };

        match found {
            Ok(Some(result)) => Ok(result),
            Ok(None) => Err(RouteError::not_found(NotFoundReason::Unreachable)),
            Err(AStarError::InvalidReference(id)) => {
                Err(RouteError::OutOfCoverage(format!("node {id}")))
            }
            Err(AStarError::StepLimitExceeded) => Err(RouteError::StepLimitExceeded),
            Err(AStarError::Canceled) => Err(RouteError::Canceled),
        }
    }

    /// Returns the distance and travel time between two ZIP codes.
    ///
    /// Totals are saved in the store, keyed by both ZIP codes and the [Profile::cache_key],
    /// and repeated queries are answered from there without searching the graph.
    /// Failures of the cache itself are logged and don't fail the query.
    pub async fn zip_route(
        &self,
        origin_zip: &str,
        dest_zip: &str,
        profile: &Profile,
        cancel: &CancellationToken,
    ) -> Result<RouteSummary, RouteError> {
        if !is_valid_zip(origin_zip) || !is_valid_zip(dest_zip) {
            return Err(RouteError::not_found(NotFoundReason::InvalidZip));
        }
        if cancel.is_cancelled() {
            return Err(RouteError::Canceled);
        }

        let key = profile.cache_key();
        match self.store.cached_route(origin_zip, dest_zip, &key).await {
            Ok(Some(cached)) => {
                debug!("Route {origin_zip} -> {dest_zip} ({key}) found in cache");
                return Ok(RouteSummary {
                    distance_meters: cached.distance_meters,
                    travel_time_seconds: cached.travel_time_seconds,
                    cache_hit: true,
                });
            }
            Ok(None) => {}
            Err(e) => warn!("Reading route {origin_zip} -> {dest_zip} from cache failed: {e}"),
        }

        let origin = Endpoint::Zip(origin_zip.to_string());
        let destination = Endpoint::Zip(dest_zip.to_string());
        let result = self.route(&origin, &destination, profile, cancel).await?;

        let totals = CachedRoute {
            distance_meters: result.total_distance_meters,
            travel_time_seconds: result.total_travel_time_seconds,
        };
        if let Err(e) = self.store.save_route(origin_zip, dest_zip, &key, totals).await {
            warn!("Saving route {origin_zip} -> {dest_zip} to cache failed: {e}");
        }

        Ok(RouteSummary {
            distance_meters: totals.distance_meters,
            travel_time_seconds: totals.travel_time_seconds,
            cache_hit: false,
        })
    }

    /// Maps an endpoint onto a node of the in-memory graph.
    async fn resolve(
        &self,
        g: &Graph,
        endpoint: &Endpoint,
        cancel: &CancellationToken,
    ) -> Result<i64, RouteError> {
        if cancel.is_cancelled() {
            return Err(RouteError::Canceled);
        }

        let id = match endpoint {
            Endpoint::Node(id) => *id,

            Endpoint::Point(p) => {
                let nearest = tokio::select! {
                    _ = cancel.cancelled() => return Err(RouteError::Canceled),
                    r = self.store.nearest_node(*p) => r?,
                };
                match nearest {
                    Some((id, _, dist)) if dist <= self.config.max_snap_distance_m => id,
                    _ => return Err(RouteError::OutOfCoverage(endpoint.to_string())),
                }
            }

            Endpoint::Zip(code) => {
                let node = tokio::select! {
                    _ = cancel.cancelled() => return Err(RouteError::Canceled),
                    r = self.store.zip_node(code) => r?,
                };
                node.ok_or(RouteError::not_found(NotFoundReason::UnknownZip))?
            }
        };

        if g.get_node(id).is_none() {
            return Err(RouteError::OutOfCoverage(endpoint.to_string()));
        }
        Ok(id)
    }
}
