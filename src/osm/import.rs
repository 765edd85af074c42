// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{self, BufReader, Seek, SeekFrom};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

use super::reader::model::Feature;
use super::reader::pbf::{self, BlobReader, Block, RawBlock};
use super::reader::PbfSource;
use super::tags::{classify_way, WayClassification};
use crate::store::{invalidate_routes, with_retry, GraphStore, RetryPolicy, StoreError};
use crate::{earth_distance, Edge, Node, Point};

/// Smallest number of rows written to the store at once.
pub const MIN_BATCH_SIZE: usize = 100;

/// Largest number of segments a single way may be split into;
/// the segment index must fit in the 16 bits reserved for it in the edge id.
const MAX_SEGMENTS: usize = 1 << 16;

/// Error conditions which may occur during [Importer::import_pbf] or [import_zips](super::import_zips).
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("pbf: {0}")]
    Parse(pbf::Error),

    #[error("csv: {0}")]
    Csv(#[from] csv::Error),

    #[error("storage: {0}")]
    Storage(#[from] StoreError),

    #[error("import canceled")]
    Canceled,
}

impl From<pbf::Error> for ImportError {
    fn from(e: pbf::Error) -> Self {
        match e {
            pbf::Error::Io(io) => ImportError::Io(io::Error::new(io.kind(), io.to_string())),
            other => ImportError::Parse(other),
        }
    }
}

/// Tuning of [Importer::import_pbf].
#[derive(Debug, Clone, PartialEq)]
pub struct ImportOptions {
    /// Number of rows per write; values below [MIN_BATCH_SIZE] are raised to it.
    pub batch_size: usize,

    /// Number of block decoding threads.
    pub workers: usize,

    /// Capacity of the channels between the pipeline stages.
    pub channel_capacity: usize,

    pub retry: RetryPolicy,

    /// Number of OSM features between progress log lines.
    pub progress_interval: u64,

    /// Build routing indexes and refresh statistics after the load.
    pub create_indexes: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        let workers = num_cpus::get().max(1);
        Self {
            batch_size: 1000,
            workers,
            channel_capacity: 2 * workers,
            retry: RetryPolicy::default(),
            progress_interval: 1_000_000,
            create_indexes: true,
        }
    }
}

/// Summary of a finished [Importer::import_pbf] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportStats {
    pub routable_ways: u64,
    pub referenced_nodes: u64,
    pub nodes_written: u64,
    pub edges_written: u64,

    /// Way segments dropped because one of their nodes was absent from the file.
    pub skipped_segments: u64,

    /// Batches given up on after a non-fatal storage error.
    pub failed_batches: u64,

    pub index_failures: u64,
}

/// Loads OSM PBF files into a [GraphStore].
///
/// The file is read twice. The first pass collects ids of nodes referenced by routable ways,
/// the second one writes those nodes and the edges of all routable ways. Both passes run
/// as a pipeline of a block reader thread, a pool of block decoding threads and
/// a single batching writer.
#[derive(Debug)]
pub struct Importer<'a, S: GraphStore> {
    store: &'a S,
    options: ImportOptions,
}

impl<'a, S: GraphStore> Importer<'a, S> {
    pub fn new(store: &'a S, options: ImportOptions) -> Self {
        Self { store, options }
    }

    pub fn options(&self) -> &ImportOptions {
        &self.options
    }

    /// Performs a full load of an OSM PBF file into the store.
    ///
    /// Writes are upserts with stable ids, so an interrupted or repeated import
    /// converges to the same state. On cancellation, the reader stops at the next block,
    /// already decoded blocks are written and [ImportError::Canceled] is returned.
    /// Saved routes are dropped once the second pass has written anything.
    pub async fn import_pbf(
        &self,
        source: PbfSource,
        cancel: &CancellationToken,
    ) -> Result<ImportStats, ImportError> {
        let started = Instant::now();
        let mut stats = ImportStats::default();

        let file = tokio::task::spawn_blocking(move || source.open())
            .await
            .map_err(io::Error::other)??;

        // Pass 1: ways
        info!("Pass 1/2: collecting nodes of routable ways");
        let referenced = self
            .collect_referenced_nodes(rewound(&file)?, cancel, &mut stats)
            .await?;
        stats.referenced_nodes = referenced.len() as u64;
        info!(
            "Pass 1/2 done: {} routable ways referencing {} nodes ({:?})",
            stats.routable_ways,
            stats.referenced_nodes,
            started.elapsed()
        );
        if cancel.is_cancelled() {
            return Err(ImportError::Canceled);
        }

        // Pass 2: nodes and edges
        info!("Pass 2/2: writing nodes and edges");
        let pass_started = Instant::now();
        self.write_graph(rewound(&file)?, Arc::new(referenced), cancel, &mut stats)
            .await?;
        if stats.nodes_written > 0 || stats.edges_written > 0 {
            invalidate_routes(self.store, &self.options.retry).await?;
        }
        info!(
            "Pass 2/2 done: {} nodes and {} edges written ({:?})",
            stats.nodes_written,
            stats.edges_written,
            pass_started.elapsed()
        );
        if cancel.is_cancelled() {
            return Err(ImportError::Canceled);
        }

        // Finalise
        if self.options.create_indexes {
            info!("Creating routing indexes");
            for e in self.store.create_indexes().await {
                warn!("Index creation step failed: {e}");
                stats.index_failures += 1;
            }
        }

        info!("Import finished in {:?}: {stats:?}", started.elapsed());
        Ok(stats)
    }

    async fn collect_referenced_nodes(
        &self,
        file: File,
        cancel: &CancellationToken,
        stats: &mut ImportStats,
    ) -> Result<HashSet<i64>, ImportError> {
        let pass = self.start_pass(file, cancel, scan_ways);
        let mut progress = Progress::new("Pass 1/2", self.options.progress_interval);
        let mut referenced: HashSet<i64> = HashSet::new();

        while let Ok(result) = pass.results.recv().await {
            let scan = result?;
            progress.advance(scan.ways);
            stats.routable_ways += scan.routable_ways;
            referenced.extend(scan.node_ids);
        }

        pass.finish().await?;
        Ok(referenced)
    }

    async fn write_graph(
        &self,
        file: File,
        referenced: Arc<HashSet<i64>>,
        cancel: &CancellationToken,
        stats: &mut ImportStats,
    ) -> Result<(), ImportError> {
        let pass = self.start_pass(file, cancel, move |block| {
            split_block(block, &referenced)
        });
        let mut progress = Progress::new("Pass 2/2", self.options.progress_interval);
        let mut writer = Writer::new(self.store, &self.options, stats);
        let mut coords: HashMap<i64, Point> = HashMap::new();
        let mut pending: Vec<RoutableWay> = Vec::new();

        while let Ok(result) = pass.results.recv().await {
            let block = result?;
            progress.advance(block.features);

            for n in block.nodes {
                if coords.insert(n.id, n.location).is_none() {
                    writer.push_node(n).await?;
                }
            }

            for way in block.ways {
                match complete_way_edges(&way, &coords) {
                    Some(edges) => writer.push_edges(edges).await?,
                    None => pending.push(way),
                }
            }
        }
        pass.finish().await?;

        // Ways decoded before some of their nodes; anything still missing is absent from the file.
        if !pending.is_empty() {
            debug!("Resolving {} ways decoded ahead of their nodes", pending.len());
        }
        for way in pending {
            let (edges, skipped) = way_edges(&way, |id| coords.get(&id).copied());
            if skipped > 0 {
                warn!(
                    "Way {}: skipped {skipped} segment(s) referencing nodes missing from the file",
                    way.id
                );
                writer.stats.skipped_segments += skipped;
            }
            writer.push_edges(edges).await?;
        }

        writer.flush_edges().await
    }

    fn start_pass<T, F>(&self, file: File, cancel: &CancellationToken, decode: F) -> Pass<T>
    where
        T: Send + 'static,
        F: Fn(Block) -> T + Send + Sync + 'static,
    {
        let workers = self.options.workers.max(1);
        let capacity = self.options.channel_capacity.max(1);
        let stop = cancel.child_token();

        let (raw_tx, raw_rx) = async_channel::bounded::<Result<RawBlock, pbf::Error>>(capacity);
        let (out_tx, out_rx) = async_channel::bounded::<Result<T, pbf::Error>>(capacity);
        let mut tasks = Vec::with_capacity(workers + 1);

        // Stage 1: framing blobs
        let reader_stop = stop.clone();
        tasks.push(tokio::task::spawn_blocking(move || {
            for raw in BlobReader::new(BufReader::new(file)) {
                if reader_stop.is_cancelled() {
                    debug!("PBF reader stopped at a block boundary");
                    break;
                }
                if raw_tx.send_blocking(raw).is_err() {
                    break;
                }
            }
        }));

        // Stage 2: decoding blocks
        let decode = Arc::new(decode);
        for _ in 0..workers {
            let raw_rx = raw_rx.clone();
            let out_tx = out_tx.clone();
            let decode = decode.clone();
            tasks.push(tokio::task::spawn_blocking(move || {
                while let Ok(raw) = raw_rx.recv_blocking() {
                    let result = raw.and_then(RawBlock::decode).map(|block| decode(block));
                    if out_tx.send_blocking(result).is_err() {
                        break;
                    }
                }
            }));
        }

        Pass {
            results: out_rx,
            tasks,
            _stop: stop.drop_guard(),
        }
    }
}

/// Returns a new handle to the same file, positioned at its start.
fn rewound(file: &File) -> io::Result<File> {
    let mut f = file.try_clone()?;
    f.seek(SeekFrom::Start(0))?;
    Ok(f)
}

/// A running pipeline over all blocks of a file. Dropping it stops the reader.
struct Pass<T> {
    results: async_channel::Receiver<Result<T, pbf::Error>>,
    tasks: Vec<JoinHandle<()>>,
    _stop: DropGuard,
}

impl<T> Pass<T> {
    async fn finish(self) -> Result<(), ImportError> {
        for task in self.tasks {
            task.await.map_err(io::Error::other)?;
        }
        Ok(())
    }
}

struct Progress {
    label: &'static str,
    interval: u64,
    seen: u64,
    started: Instant,
}

impl Progress {
    fn new(label: &'static str, interval: u64) -> Self {
        Self {
            label,
            interval: interval.max(1),
            seen: 0,
            started: Instant::now(),
        }
    }

    fn advance(&mut self, n: u64) {
        let before = self.seen / self.interval;
        self.seen += n;
        if self.seen / self.interval > before {
            info!(
                "{}: {} features processed ({:?})",
                self.label,
                self.seen,
                self.started.elapsed()
            );
        }
    }
}

/// Result of scanning the ways of a single block in the first pass.
#[derive(Debug, Default)]
struct WayScan {
    ways: u64,
    routable_ways: u64,
    node_ids: Vec<i64>,
}

fn scan_ways(block: Block) -> WayScan {
    let mut scan = WayScan::default();
    for way in block.ways() {
        scan.ways += 1;
        if way.nodes.len() >= 2 && classify_way(&way.tags).is_some() {
            scan.routable_ways += 1;
            scan.node_ids.extend(way.nodes);
        }
    }
    scan
}

/// A way which passed [classify_way].
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RoutableWay {
    pub id: i64,
    pub nodes: Vec<i64>,
    pub class: WayClassification,
}

/// Routing-relevant contents of a single block in the second pass, in block order.
#[derive(Debug, Default)]
struct BlockFeatures {
    features: u64,
    nodes: Vec<Node>,
    ways: Vec<RoutableWay>,
}

fn split_block(block: Block, referenced: &HashSet<i64>) -> BlockFeatures {
    let mut out = BlockFeatures::default();
    for f in block.features() {
        out.features += 1;
        match f {
            Feature::Node(n) => {
                if referenced.contains(&n.id) && n.location.is_valid() {
                    out.nodes.push(n);
                }
            }

            Feature::Way(w) => {
                if w.nodes.len() < 2 {
                    continue;
                }
                if let Some(class) = classify_way(&w.tags) {
                    out.ways.push(RoutableWay {
                        id: w.id,
                        nodes: w.nodes,
                        class,
                    });
                }
            }
        }
    }
    out
}

/// Stable id of the edge along `segment` of a way: `(way_id << 17) | (segment << 1) | reverse`.
pub(crate) fn edge_id(way_id: i64, segment: usize, reverse: bool) -> i64 {
    (way_id << 17) | ((segment as i64) << 1) | reverse as i64
}

/// Builds edges of a way, if all of its nodes have known positions.
fn complete_way_edges(way: &RoutableWay, coords: &HashMap<i64, Point>) -> Option<Vec<Edge>> {
    if way.nodes.iter().all(|id| coords.contains_key(id)) {
        Some(way_edges(way, |id| coords.get(&id).copied()).0)
    } else {
        None
    }
}

/// Splits a way into directed edges between consecutive nodes.
///
/// Returns the edges, and the number of segments skipped due to unknown node positions.
/// Segments between repeated references of the same node are dropped silently.
pub(crate) fn way_edges<F>(way: &RoutableWay, position: F) -> (Vec<Edge>, u64)
where
    F: Fn(i64) -> Option<Point>,
{
    let meters_per_second = way.class.speed_kmh / 3.6;
    let mut edges = Vec::with_capacity(2 * way.nodes.len());
    let mut skipped = 0;

    for (segment, pair) in way.nodes.windows(2).enumerate() {
        let (a, b) = (pair[0], pair[1]);
        if a == b {
            continue;
        }
        if segment >= MAX_SEGMENTS {
            warn!("Way {}: segments past {MAX_SEGMENTS} are skipped", way.id);
            skipped += (way.nodes.len() - 1 - segment) as u64;
            break;
        }

        let (Some(pa), Some(pb)) = (position(a), position(b)) else {
            skipped += 1;
            continue;
        };

        let distance = earth_distance(pa, pb);
        let travel_time = distance / meters_per_second;
        let edge = |from, to, reverse| Edge {
            id: edge_id(way.id, segment, reverse),
            from,
            to,
            distance,
            travel_time,
            attrs: way.class.attrs,
            way_id: Some(way.id),
        };

        if way.class.direction.forward {
            edges.push(edge(a, b, false));
        }
        if way.class.direction.backward {
            edges.push(edge(b, a, true));
        }
    }

    (edges, skipped)
}

/// Batching writer of the second pass.
///
/// Nodes are always flushed before edges, so that edges never reference unwritten nodes.
struct Writer<'a, 's, S: GraphStore> {
    store: &'a S,
    batch_size: usize,
    retry: RetryPolicy,
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    stats: &'s mut ImportStats,
}

impl<'a, 's, S: GraphStore> Writer<'a, 's, S> {
    fn new(store: &'a S, options: &ImportOptions, stats: &'s mut ImportStats) -> Self {
        let batch_size = options.batch_size.max(MIN_BATCH_SIZE);
        Self {
            store,
            batch_size,
            retry: options.retry,
            nodes: Vec::with_capacity(batch_size),
            edges: Vec::with_capacity(batch_size),
            stats,
        }
    }

    async fn push_node(&mut self, n: Node) -> Result<(), ImportError> {
        self.nodes.push(n);
        if self.nodes.len() >= self.batch_size {
            self.flush_nodes().await?;
        }
        Ok(())
    }

    async fn push_edges(&mut self, edges: Vec<Edge>) -> Result<(), ImportError> {
        for e in edges {
            self.edges.push(e);
            if self.edges.len() >= self.batch_size {
                self.flush_edges().await?;
            }
        }
        Ok(())
    }

    async fn flush_nodes(&mut self) -> Result<(), ImportError> {
        if self.nodes.is_empty() {
            return Ok(());
        }

        let rows = self.nodes.len();
        let store = self.store;
        let batch = &self.nodes[..];
        let result =
            with_retry(&self.retry, "writing nodes", move || store.write_nodes(batch)).await;
        if self.check_batch("nodes", rows, result)? {
            self.stats.nodes_written += rows as u64;
        }
        self.nodes.clear();
        Ok(())
    }

    async fn flush_edges(&mut self) -> Result<(), ImportError> {
        self.flush_nodes().await?;
        if self.edges.is_empty() {
            return Ok(());
        }

        let rows = self.edges.len();
        let store = self.store;
        let batch = &self.edges[..];
        let result =
            with_retry(&self.retry, "writing edges", move || store.write_edges(batch)).await;
        if self.check_batch("edges", rows, result)? {
            self.stats.edges_written += rows as u64;
        }
        self.edges.clear();
        Ok(())
    }

    /// Returns `Ok(true)` if a batch was written, `Ok(false)` if it was skipped,
    /// or an error if the import can't continue.
    fn check_batch(
        &mut self,
        what: &str,
        rows: usize,
        result: Result<(), StoreError>,
    ) -> Result<bool, ImportError> {
        match result {
            Ok(()) => Ok(true),
            Err(e) if e.is_transport() => {
                error!("Writing {rows} {what} failed, aborting: {e}");
                Err(ImportError::Storage(e))
            }
            Err(e) => {
                warn!("Skipping a batch of {rows} {what}: {e}");
                self.stats.failed_batches += 1;
                Ok(false)
            }
        }
    }
}
