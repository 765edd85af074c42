// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

//! Loading [OpenStreetMap](https://www.openstreetmap.org/) data into a [GraphStore](crate::store::GraphStore).

mod import;
pub mod reader;
mod tags;
mod zips;

pub use import::{ImportError, ImportOptions, ImportStats, Importer, MIN_BATCH_SIZE};
pub use reader::PbfSource;
pub use tags::{
    classify_way, parse_height_m, parse_speed_kmh, parse_weight_kg, Direction, EdgeAttrs,
    HighwayClass, SurfaceClass, WayClassification,
};
pub use zips::{import_zips, is_valid_zip, read_zip_csv, ZipImportOptions, ZipImportStats};
