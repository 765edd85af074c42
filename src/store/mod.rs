// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

//! Persistence of the road network.
//!
//! The [GraphStore] trait is the single seam between the routing core and the database.
//! [PostgisStore] is the production implementation, while [MemoryStore] keeps everything
//! in process memory with the same semantics.
//!
//! Besides the graph, stores keep totals of earlier ZIP-to-ZIP queries ([CachedRoute]).
//! Any write to the graph or to the ZIP mappings must be followed by [invalidate_routes].

use std::future::Future;
use std::time::Duration;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::{BoundingBox, Edge, Graph, Node, Point};

mod memory;
mod postgis;

pub use memory::MemoryStore;
pub use postgis::PostgisStore;

/// Error conditions which may occur when talking to a [GraphStore].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("batch did not complete within {0:?}")]
    Timeout(Duration),

    #[error("constraint violation: {0}")]
    Constraint(String),
}

impl StoreError {
    /// Returns true for failures which may go away when the operation is retried:
    /// I/O errors, pool exhaustion, serialization failures, deadlocks,
    /// connection exceptions and deadline expiry.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Database(sqlx::Error::Io(_)) | Self::Database(sqlx::Error::PoolTimedOut) => true,
            Self::Database(sqlx::Error::Database(e)) => e
                .code()
                .is_some_and(|c| c == "40001" || c == "40P01" || c.starts_with("08")),
            Self::Timeout(_) => true,
            _ => false,
        }
    }

    /// Returns true for failures of the connection itself, after which
    /// no further writes can be expected to succeed.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Database(
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::Protocol(_)
            )
        )
    }
}

/// A row of the ZIP code input, before it's matched with the nearest [Node].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZipRecord {
    pub zip_code: String,
    pub centroid: Point,
    pub state: String,
    pub city: String,
}

/// A ZIP code mapped onto the nearest [Node] of the road network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZipNode {
    pub zip_code: String,
    pub node_id: i64,
    pub centroid: Point,
    pub state: String,
    pub city: String,
}

/// Totals of a route between two ZIP codes, saved for repeated queries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CachedRoute {
    pub distance_meters: f64,
    pub travel_time_seconds: f64,
}

/// Row counts of all tables of a [GraphStore].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreCounts {
    pub nodes: u64,
    pub edges: u64,
    pub zip_nodes: u64,
    pub cached_routes: u64,
}

/// Persistent storage of [Nodes](Node), [Edges](Edge) and [ZipNodes](ZipNode).
///
/// All writes are upserts keyed by the row id, so that an interrupted import can be
/// resumed simply by running it again.
pub trait GraphStore: Send + Sync {
    /// Brings the schema up to date.
    fn migrate(&self) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Inserts or updates a batch of nodes.
    fn write_nodes(&self, nodes: &[Node]) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Inserts or updates a batch of edges. Both endpoints of every edge must already be stored.
    fn write_edges(&self, edges: &[Edge]) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Maps every record onto its nearest stored node and upserts it by `zip_code`.
    /// Returns the number of rows written.
    fn upsert_zip_nodes(
        &self,
        records: &[ZipRecord],
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Creates the indexes used for routing and refreshes planner statistics.
    ///
    /// Each step is best-effort: failures are collected and returned,
    /// without stopping the remaining steps.
    fn create_indexes(&self) -> impl Future<Output = Vec<StoreError>> + Send;

    /// Finds the stored node closest to `p`,
    /// returning its id, location and the distance to it in meters.
    fn nearest_node(
        &self,
        p: Point,
    ) -> impl Future<Output = Result<Option<(i64, Point, f64)>, StoreError>> + Send;

    /// Resolves a ZIP code to the id of its mapped node.
    fn zip_node(&self, zip_code: &str)
        -> impl Future<Output = Result<Option<i64>, StoreError>> + Send;

    /// Loads the stored network (or the part of it inside `region`) into a [Graph].
    /// Edges with an endpoint outside of the region are skipped.
    fn load_graph(
        &self,
        region: Option<BoundingBox>,
    ) -> impl Future<Output = Result<Graph, StoreError>> + Send;

    /// Looks up totals saved by [GraphStore::save_route] for the same ZIP codes and profile key.
    fn cached_route(
        &self,
        origin_zip: &str,
        dest_zip: &str,
        profile: &str,
    ) -> impl Future<Output = Result<Option<CachedRoute>, StoreError>> + Send;

    /// Inserts or replaces the totals of a ZIP-to-ZIP route.
    fn save_route(
        &self,
        origin_zip: &str,
        dest_zip: &str,
        profile: &str,
        route: CachedRoute,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Removes all saved routes, returning their number.
    fn clear_route_cache(&self) -> impl Future<Output = Result<u64, StoreError>> + Send;

    fn counts(&self) -> impl Future<Output = Result<StoreCounts, StoreError>> + Send;
}

/// Drops all saved routes, which may no longer match the stored graph or ZIP mappings.
pub async fn invalidate_routes<S: GraphStore>(
    store: &S,
    policy: &RetryPolicy,
) -> Result<(), StoreError> {
    let clear = move || store.clear_route_cache();
    let removed = with_retry(policy, "clearing route cache", clear).await?;
    if removed > 0 {
        info!("Dropped {removed} cached route(s)");
    }
    Ok(())
}

/// Retry and deadline settings for batched writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Number of retries after the first attempt of a transient failure.
    pub max_retries: u32,

    /// Delay before the first retry, doubled on every following one.
    pub base_delay: Duration,

    /// Deadline of a single attempt.
    pub batch_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
            batch_timeout: Duration::from_secs(30),
        }
    }
}

/// Runs `operation` under the [RetryPolicy], retrying [transient](StoreError::is_transient)
/// failures with exponential backoff.
pub async fn with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    what: &str,
    mut operation: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0;

    loop {
        let result = match tokio::time::timeout(policy.batch_timeout, operation()).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(policy.batch_timeout)),
        };

        match result {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                attempt += 1;
                let delay = policy.base_delay * (1 << (attempt - 1));
                warn!("{what}: {e} (attempt {attempt}), retrying in {delay:?}");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
