// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

//! Writer of small OSM PBF files, used to generate test inputs in-process.

use std::collections::HashMap;
use std::io::Write;

use protobuf::{Message, MessageField};

use super::{fileformat, osmformat};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Raw,
    Zlib,
    Bzip2,
}

#[derive(Debug, Clone, Copy)]
pub struct FixtureWay<'a> {
    pub id: i64,
    pub refs: &'a [i64],
    pub tags: &'a [(&'a str, &'a str)],
}

pub fn way<'a>(id: i64, refs: &'a [i64], tags: &'a [(&'a str, &'a str)]) -> FixtureWay<'a> {
    FixtureWay { id, refs, tags }
}

/// Builds an OSM PBF file blob-by-blob. Every call to a feature method
/// appends a single `OSMData` blob containing one primitive group.
pub struct PbfBuilder {
    out: Vec<u8>,
}

impl PbfBuilder {
    pub fn new() -> Self {
        Self::with_required_features(&["OsmSchema-V0.6", "DenseNodes"])
    }

    pub fn with_required_features(features: &[&str]) -> Self {
        let mut header = osmformat::HeaderBlock::new();
        header.required_features = features.iter().map(|f| f.to_string()).collect();
        header.writingprogram = Some("truckroute-tests".to_string());

        let mut b = Self { out: Vec::new() };
        b.blob("OSMHeader", &header.write_to_bytes().unwrap(), Compression::Zlib);
        b
    }

    /// Appends a block of dense nodes, given as `(id, lon, lat)`.
    pub fn dense_nodes(mut self, nodes: &[(i64, f64, f64)], compression: Compression) -> Self {
        let mut dense = osmformat::DenseNodes::new();
        let (mut id, mut lat, mut lon) = (0, 0, 0);
        for &(node_id, node_lon, node_lat) in nodes {
            dense.id.push(node_id - id);
            dense.lat.push(to_nano(node_lat) - lat);
            dense.lon.push(to_nano(node_lon) - lon);
            id = node_id;
            lat = to_nano(node_lat);
            lon = to_nano(node_lon);
        }

        let mut group = osmformat::PrimitiveGroup::new();
        group.dense = MessageField::some(dense);
        self.data_block(group, Vec::new(), compression);
        self
    }

    /// Appends a block of plain (non-dense) nodes, given as `(id, lon, lat)`.
    pub fn plain_nodes(mut self, nodes: &[(i64, f64, f64)], compression: Compression) -> Self {
        let mut group = osmformat::PrimitiveGroup::new();
        for &(id, lon, lat) in nodes {
            let mut node = osmformat::Node::new();
            node.id = Some(id);
            node.lat = Some(to_nano(lat));
            node.lon = Some(to_nano(lon));
            group.nodes.push(node);
        }
        self.data_block(group, Vec::new(), compression);
        self
    }

    /// Appends a block of ways, see [way].
    pub fn ways(mut self, ways: &[FixtureWay<'_>], compression: Compression) -> Self {
        let mut strings: Vec<String> = vec![String::new()];
        let mut lookup: HashMap<String, u32> = HashMap::new();
        let mut intern = |s: &str| -> u32 {
            *lookup.entry(s.to_string()).or_insert_with(|| {
                strings.push(s.to_string());
                (strings.len() - 1) as u32
            })
        };

        let mut group = osmformat::PrimitiveGroup::new();
        for w in ways {
            let mut way = osmformat::Way::new();
            way.id = Some(w.id);
            let mut prev = 0;
            for &r in w.refs {
                way.refs.push(r - prev);
                prev = r;
            }
            for &(k, v) in w.tags {
                way.keys.push(intern(k));
                way.vals.push(intern(v));
            }
            group.ways.push(way);
        }

        self.data_block(group, strings, compression);
        self
    }

    /// Appends a blob of a type readers must skip.
    pub fn unknown_blob(mut self) -> Self {
        self.blob("OSMIndex", b"whatever", Compression::Raw);
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.out
    }

    fn data_block(
        &mut self,
        group: osmformat::PrimitiveGroup,
        strings: Vec<String>,
        c: Compression,
    ) {
        let mut table = osmformat::StringTable::new();
        table.s = strings.into_iter().map(String::into_bytes).collect();
        if table.s.is_empty() {
            table.s.push(Vec::new());
        }

        let mut block = osmformat::PrimitiveBlock::new();
        block.stringtable = MessageField::some(table);
        block.primitivegroup.push(group);
        self.blob("OSMData", &block.write_to_bytes().unwrap(), c);
    }

    fn blob(&mut self, kind: &str, payload: &[u8], compression: Compression) {
        let mut blob = fileformat::Blob::new();
        blob.raw_size = Some(payload.len() as i32);
        blob.data = Some(match compression {
            Compression::Raw => fileformat::blob::Data::Raw(payload.to_vec()),
            Compression::Zlib => {
                let mut e =
                    flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
                e.write_all(payload).unwrap();
                fileformat::blob::Data::ZlibData(e.finish().unwrap())
            }
            Compression::Bzip2 => {
                let mut e = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
                e.write_all(payload).unwrap();
                fileformat::blob::Data::OBSOLETEBzip2Data(e.finish().unwrap())
            }
        });
        let blob = blob.write_to_bytes().unwrap();

        let mut header = fileformat::BlobHeader::new();
        header.type_ = Some(kind.to_string());
        header.datasize = Some(blob.len() as i32);
        let header = header.write_to_bytes().unwrap();

        self.out.extend_from_slice(&(header.len() as u32).to_be_bytes());
        self.out.extend_from_slice(&header);
        self.out.extend_from_slice(&blob);
    }
}

/// Converts degrees to the default PBF granularity of 100 nanodegrees.
fn to_nano(deg: f64) -> i64 {
    (deg * 1e7).round() as i64
}
