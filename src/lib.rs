// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

//! Truck-aware routing over [OpenStreetMap](https://www.openstreetmap.org/) data kept in PostGIS.
//!
//! OSM PBF extracts are loaded into a [GraphStore](store::GraphStore) by the
//! [Importer](osm::Importer), which keeps every routable way as a pair of directed
//! [edges](Edge) carrying distance, travel time and truck-relevant attributes.
//! The [Router] projects the stored graph into memory and answers queries with A*,
//! filtering and weighting edges according to a [Profile](profile::Profile).
//!
//! # Example
//!
//! ```no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use tokio_util::sync::CancellationToken;
//! use truckroute::store::{GraphStore, PostgisStore};
//!
//! let cancel = CancellationToken::new();
//! let store = PostgisStore::connect("postgres://localhost/routing", 8).await?;
//! store.migrate().await?;
//!
//! truckroute::osm::Importer::new(&store, Default::default())
//!     .import_pbf(truckroute::osm::PbfSource::Path("monaco.osm.pbf".into()), &cancel)
//!     .await?;
//!
//! let router = truckroute::Router::new(store, Default::default());
//! let route = router
//!     .route(
//!         &"7.4246,43.7384".parse()?,
//!         &"7.4323,43.7478".parse()?,
//!         &truckroute::profile::Profile::truck(),
//!         &cancel,
//!     )
//!     .await?;
//!
//! println!("Route: {:?}", route.nodes);
//! # Ok(())
//! # }
//! ```

mod astar;
mod distance;
mod graph;
mod kd;
pub mod osm;
pub mod profile;
mod router;
pub mod store;

#[cfg(test)]
mod testing;

pub use astar::{find_route, AStarError, Path, DEFAULT_STEP_LIMIT};
pub use distance::{
    earth_distance, haversine, BoundingBox, Distance, Point, EARTH_RADIUS_KM, EARTH_RADIUS_MI,
};
pub use graph::{Edge, Graph, GraphError, Node};
pub use kd::KDTree;
pub use router::{
    Endpoint, NotFoundReason, RouteError, RouteResult, RouteSummary, Router, RouterConfig,
};
