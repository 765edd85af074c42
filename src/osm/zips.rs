// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

use std::io::Read;

use log::{debug, error, info, warn};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::import::{ImportError, MIN_BATCH_SIZE};
use crate::store::{invalidate_routes, with_retry, GraphStore, RetryPolicy, ZipRecord};
use crate::Point;

/// Tuning of [import_zips].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ZipImportOptions {
    /// USPS state codes to import, e.g. `["CA", "NV"]`. Empty means all states.
    pub states: Vec<String>,

    /// Number of rows per upsert; values below 100 are raised to it.
    pub batch_size: usize,

    pub retry: RetryPolicy,
}

impl ZipImportOptions {
    fn accepts(&self, state: &str) -> bool {
        self.states.is_empty() || self.states.iter().any(|s| s.eq_ignore_ascii_case(state))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ZipImportStats {
    /// Rows upserted into the store, each mapped to its nearest node.
    pub mapped: u64,

    /// Rows excluded by the state filter.
    pub filtered: u64,

    /// Rows which could not be parsed.
    pub malformed: u64,

    /// Batches given up on after a non-fatal storage error.
    pub failed_batches: u64,
}

/// Checks whether a string is a 5-digit US ZIP code, optionally followed by a ZIP+4 suffix.
pub fn is_valid_zip(code: &str) -> bool {
    let b = code.as_bytes();
    let digits = |s: &[u8]| s.iter().all(u8::is_ascii_digit);
    match b.len() {
        5 => digits(b),
        10 => digits(&b[..5]) && b[5] == b'-' && digits(&b[6..]),
        _ => false,
    }
}

#[derive(Debug, Deserialize)]
struct ZipRow {
    #[serde(rename = "Zip Code")]
    zip_code: String,

    #[serde(rename = "Official USPS city", default)]
    city: String,

    #[serde(rename = "Official USPS State Code")]
    state: String,

    #[serde(rename = "Geo Point")]
    geo_point: String,
}

/// Parses a `"lat, lon"` pair.
fn parse_geo_point(s: &str) -> Option<Point> {
    let (lat, lon) = s.split_once(',')?;
    let p = Point::new(lon.trim().parse().ok()?, lat.trim().parse().ok()?);
    if p.is_valid() {
        Some(p)
    } else {
        None
    }
}

/// Reads a `;`-delimited ZIP code CSV, returning records which pass the state filter.
/// Malformed rows are logged and skipped.
pub fn read_zip_csv<R: Read>(
    reader: R,
    options: &ZipImportOptions,
    stats: &mut ZipImportStats,
) -> Result<Vec<ZipRecord>, ImportError> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b';')
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut records = Vec::new();
    for (i, row) in rdr.deserialize::<ZipRow>().enumerate() {
        // Header is line 1
        let line = i + 2;

        let row = match row {
            Ok(row) => row,
            Err(e) if e.is_io_error() => return Err(e.into()),
            Err(e) => {
                warn!("ZIP CSV line {line}: skipping malformed row: {e}");
                stats.malformed += 1;
                continue;
            }
        };

        if !is_valid_zip(&row.zip_code) {
            warn!("ZIP CSV line {line}: invalid ZIP code {:?}", row.zip_code);
            stats.malformed += 1;
            continue;
        }

        if row.state.is_empty() {
            warn!("ZIP CSV line {line}: missing state code for {}", row.zip_code);
            stats.malformed += 1;
            continue;
        }

        if !options.accepts(&row.state) {
            stats.filtered += 1;
            continue;
        }

        let Some(centroid) = parse_geo_point(&row.geo_point) else {
            warn!(
                "ZIP CSV line {line}: invalid Geo Point {:?} for {}",
                row.geo_point, row.zip_code
            );
            stats.malformed += 1;
            continue;
        };

        records.push(ZipRecord {
            zip_code: row.zip_code,
            centroid,
            state: row.state,
            city: row.city,
        });
    }

    Ok(records)
}

/// Maps every ZIP code from a CSV file to its nearest graph node,
/// upserting the results into the store.
///
/// Should run after the graph import; re-running with the same file leaves the store unchanged.
/// A batch failing with anything but a [transport](crate::store::StoreError::is_transport)
/// error is skipped, and the remaining batches are still written.
/// Saved routes are dropped if any ZIP code was mapped.
pub async fn import_zips<S: GraphStore, R: Read>(
    store: &S,
    reader: R,
    options: &ZipImportOptions,
    cancel: &CancellationToken,
) -> Result<ZipImportStats, ImportError> {
    let mut stats = ZipImportStats::default();
    let records = read_zip_csv(reader, options, &mut stats)?;
    info!(
        "Read {} ZIP codes ({} filtered out, {} malformed)",
        records.len(),
        stats.filtered,
        stats.malformed
    );

    let mut canceled = false;
    for batch in records.chunks(options.batch_size.max(MIN_BATCH_SIZE)) {
        if cancel.is_cancelled() {
            canceled = true;
            break;
        }

        let upsert = move || store.upsert_zip_nodes(batch);
        let result = with_retry(&options.retry, "upserting ZIP nodes", upsert).await;
        match result {
            Ok(mapped) => {
                debug!("Mapped {mapped} of {} ZIP codes in batch", batch.len());
                stats.mapped += mapped;
            }
            Err(e) if e.is_transport() => {
                error!("Upserting {} ZIP codes failed, aborting: {e}", batch.len());
                return Err(e.into());
            }
            Err(e) => {
                warn!("Skipping a batch of {} ZIP codes: {e}", batch.len());
                stats.failed_batches += 1;
            }
        }
    }

    if stats.mapped > 0 {
        invalidate_routes(store, &options.retry).await?;
    }
    if canceled {
        return Err(ImportError::Canceled);
    }

    info!("ZIP import finished: {stats:?}");
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::store::{CachedRoute, StoreError};
    use crate::testing::{self, FaultyStore, LA, SF};

    #[test]
    fn zip_codes() {
        assert!(is_valid_zip("90001"));
        assert!(is_valid_zip("90001-1234"));
        assert!(!is_valid_zip("9000"));
        assert!(!is_valid_zip("90001-12"));
        assert!(!is_valid_zip("9000a"));
        assert!(!is_valid_zip("90001_1234"));
        assert!(!is_valid_zip(""));
    }

    #[test]
    fn geo_points() {
        assert_eq!(parse_geo_point("34.05, -118.24"), Some(Point::new(-118.24, 34.05)));
        assert_eq!(parse_geo_point("34.05"), None);
        assert_eq!(parse_geo_point("134.05, 0"), None);
        assert_eq!(parse_geo_point("north, west"), None);
    }

    #[test]
    fn malformed_rows_are_skipped() {
        let csv = "\
Zip Code;Official USPS city;Official USPS State Code;Geo Point
90001;Los Angeles;CA;34.0500, -118.2400
ABCDE;Nowhere;CA;34.0, -118.0
90002;Los Angeles;CA;not a point
89101;Las Vegas;NV;36.17, -115.14
90003;Los Angeles;;34.0, -118.0
\"94016\";\"San Francisco\";CA;\"37.7700, -122.4300\"
";
        let options = ZipImportOptions {
            states: vec!["ca".to_string()],
            ..Default::default()
        };
        let mut stats = ZipImportStats::default();
        let records = read_zip_csv(csv.as_bytes(), &options, &mut stats).unwrap();

        let codes: Vec<&str> = records.iter().map(|r| r.zip_code.as_str()).collect();
        assert_eq!(codes, vec!["90001", "94016"]);
        assert_eq!(records[1].city, "San Francisco");
        assert_eq!(stats.filtered, 1);
        assert_eq!(stats.malformed, 3);
    }

    #[tokio::test]
    async fn maps_to_nearest_nodes() {
        let store = testing::california_store().await;
        let options = ZipImportOptions::default();
        let cancel = CancellationToken::new();

        let stats = import_zips(&store, testing::ZIP_CSV.as_bytes(), &options, &cancel)
            .await
            .unwrap();
        assert_eq!(stats.mapped, 2);
        assert_eq!(store.zip_node("90001").await.unwrap(), Some(LA));
        assert_eq!(store.zip_node("94016").await.unwrap(), Some(SF));

        let before = store.zip_nodes();
        import_zips(&store, testing::ZIP_CSV.as_bytes(), &options, &cancel)
            .await
            .unwrap();
        assert_eq!(store.zip_nodes(), before);
    }

    #[tokio::test]
    async fn failed_batches_are_skipped() {
        let store = FaultyStore {
            zip_error: Some((0, || StoreError::Constraint("bad batch".into()))),
            ..FaultyStore::new(testing::california_store().await)
        };
        let csv = testing::zip_csv(150);
        let cancel = CancellationToken::new();

        let stats = import_zips(&store, csv.as_bytes(), &Default::default(), &cancel)
            .await
            .unwrap();
        assert_eq!(stats.failed_batches, 1);
        assert_eq!(stats.mapped, 50);
        assert_eq!(store.zip_calls.load(Ordering::SeqCst), 2);

        let zips = store.zip_nodes();
        assert_eq!(zips.len(), 50);
        assert_eq!(zips[0].zip_code, "90100");
        assert!(zips.iter().all(|z| z.node_id == LA));
    }

    #[tokio::test]
    async fn transport_errors_abort() {
        let store = FaultyStore {
            zip_error: Some((0, || StoreError::Database(sqlx::Error::PoolClosed))),
            ..FaultyStore::new(testing::california_store().await)
        };
        let csv = testing::zip_csv(150);
        let cancel = CancellationToken::new();

        let r = import_zips(&store, csv.as_bytes(), &Default::default(), &cancel).await;
        assert!(matches!(r, Err(ImportError::Storage(_))));
        assert_eq!(store.zip_calls.load(Ordering::SeqCst), 1);
        assert!(store.zip_nodes().is_empty());
    }

    #[tokio::test]
    async fn saved_routes_are_dropped() {
        let store = testing::california_store().await;
        let route = CachedRoute {
            distance_meters: 1.0,
            travel_time_seconds: 1.0,
        };
        store.save_route("90001", "94016", "car", route).await.unwrap();

        let csv = testing::ZIP_CSV.as_bytes();
        let cancel = CancellationToken::new();
        import_zips(&store, csv, &Default::default(), &cancel)
            .await
            .unwrap();
        assert_eq!(store.counts().await.unwrap().cached_routes, 0);
    }

    #[tokio::test]
    async fn canceled() {
        let store = testing::california_store().await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let csv = testing::ZIP_CSV.as_bytes();
        let r = import_zips(&store, csv, &Default::default(), &cancel).await;
        assert!(matches!(r, Err(ImportError::Canceled)));
        assert_eq!(store.zip_node("90001").await.unwrap(), None);
    }
}
