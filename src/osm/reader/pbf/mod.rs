// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

//! Reader of the [OSM PBF format](https://wiki.openstreetmap.org/wiki/PBF_Format).
//!
//! Reading is split in two, so that both halves may run on different threads:
//! [BlobReader] only frames the file into compressed [RawBlocks](RawBlock),
//! while [RawBlock::decode] decompresses and parses a single block.
//!
//! The `fileformat` and `osmformat` protobuf modules are generated by `build.rs`
//! from `proto/*.proto` into `OUT_DIR/osmpbf`, and included here as-is.

include!(concat!(env!("OUT_DIR"), "/osmpbf/mod.rs"));

#[cfg(test)]
pub(crate) mod fixture;

use super::model::{Feature, Way};
use crate::{Node, Point};

use log::debug;
use protobuf::Message;
use std::collections::HashMap;
use std::io;
use std::io::Read;
use std::rc::Rc;
use std::sync::Arc;

/// Max permitted size for a serialized [blob header](https://wiki.openstreetmap.org/wiki/PBF_Format#File_format) -
/// 64 KiB.
const MAX_BLOB_HEADER_SIZE: u32 = 64 * 1024;

/// Max permitted size for a serialized & decompressed [blob](https://wiki.openstreetmap.org/wiki/PBF_Format#File_format) -
/// 32 MiB.
const MAX_BLOB_SIZE: usize = 32 * 1024 * 1024;

/// All strings used by an [OSM PBF Block](https://wiki.openstreetmap.org/wiki/PBF_Format#Definition_of_OSMData_fileblock),
/// reference-counted as this table is referred to by multiple coexisting iterators and
/// closures without any concrete ownership.
type StringTable = Rc<Vec<String>>;

/// Error which can occur when reading a PBF file.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("protobuf: {0}")]
    Protobuf(#[from] Arc<protobuf::Error>),

    #[error("io: {0}")]
    Io(#[from] Arc<io::Error>),

    #[error("BlobHeader too large: {0} > {MAX_BLOB_HEADER_SIZE}")]
    BlobHeaderTooLarge(u32),

    #[error("Blob too large: {0} > {MAX_BLOB_SIZE}")]
    BlobTooLarge(usize),

    #[error("file ends after {0} of 4 bytes of a BlobHeader size")]
    TruncatedBlobHeaderSize(usize),

    #[error("BlobHeader.datasize is negative")]
    NegativeBlobHeaderSize,

    #[error("Blob has no data")]
    MissingBlobData,

    #[error("unsupported compression: {0} (supported: raw, zlib and bzip2)")]
    UnsupportedCompression(&'static str),

    #[error("file requires unsupported features: {0:?}")]
    UnsupportedFeatures(Vec<String>),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl From<protobuf::Error> for Error {
    fn from(e: protobuf::Error) -> Self {
        Error::Protobuf(Arc::new(e))
    }
}

/// A still-compressed `OSMData` blob.
#[derive(Debug, Clone)]
pub struct RawBlock {
    data: Vec<u8>,
}

impl RawBlock {
    /// Decompresses and parses the blob into a [Block].
    pub fn decode(self) -> Result<Block, Error> {
        let data = decode_blob(&self.data)?;
        let block = osmformat::PrimitiveBlock::parse_from_bytes(&data)?;
        Ok(Block(block))
    }
}

/// Iterator over `OSMData` [RawBlocks](RawBlock) of an OSM PBF file.
///
/// `OSMHeader` blobs are validated in-place, blobs of unknown types are skipped.
/// The iterator stops after the first error.
pub struct BlobReader<R: io::Read> {
    reader: R,
    done: bool,
}

enum Frame {
    Data(RawBlock),
    Other,
}

impl<R: io::Read> BlobReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            done: false,
        }
    }

    /// Reads the next size + [fileformat::BlobHeader] + [fileformat::Blob] sequence.
    ///
    /// Returns `Ok(None)` on EOF.
    fn read_frame(&mut self) -> Result<Option<Frame>, Error> {
        // 1. Read the BlobHeader size
        let blob_header_size = match self.read_blob_header_size()? {
            Some(size) => size,
            None => return Ok(None), // no more blobs
        };

        // 2. Read the BlobHeader
        let blob_header = self.read_blob_header(blob_header_size)?;

        // 3. Read the Blob, dispatching on BlobHeader.type
        let data = self.read_blob(blob_header.datasize())?;
        match blob_header.type_() {
            "OSMData" => Ok(Some(Frame::Data(RawBlock { data }))),

            "OSMHeader" => {
                check_header(&data)?;
                Ok(Some(Frame::Other))
            }

            other => {
                debug!("skipping PBF blob of unknown type {other:?}");
                Ok(Some(Frame::Other))
            }
        }
    }

    /// Reads the next 4 bytes to read the size of the subsequent [fileformat::BlobHeader].
    ///
    /// Returns `Ok(Some(_))` on success, `Ok(None)` on EOF, or an [Error].
    /// EOF after only some of the 4 bytes is [Error::TruncatedBlobHeaderSize].
    fn read_blob_header_size(&mut self) -> Result<Option<u32>, Error> {
        let mut buf = [0u8; 4];
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }

        match filled {
            0 => Ok(None), // no more blobs
            4 => Ok(Some(u32::from_be_bytes(buf))),
            n => Err(Error::TruncatedBlobHeaderSize(n)),
        }
    }

    /// Reads the next [fileformat::BlobHeader] of a given size.
    fn read_blob_header(&mut self, size: u32) -> Result<fileformat::BlobHeader, Error> {
        if size > MAX_BLOB_HEADER_SIZE {
            return Err(Error::BlobHeaderTooLarge(size));
        }
        let mut buf = vec![0u8; size as usize];
        self.reader.read_exact(&mut buf)?;
        let header = fileformat::BlobHeader::parse_from_bytes(&buf)?;
        Ok(header)
    }

    /// Reads the next serialized [fileformat::Blob], without parsing it.
    fn read_blob(&mut self, size: i32) -> Result<Vec<u8>, Error> {
        if size < 0 {
            return Err(Error::NegativeBlobHeaderSize);
        }
        if size as usize > MAX_BLOB_SIZE {
            return Err(Error::BlobTooLarge(size as usize));
        }

        let mut buf = vec![0u8; size as usize];
        self.reader.read_exact(&mut buf)?;
        Ok(buf)
    }
}

impl<R: io::Read> Iterator for BlobReader<R> {
    type Item = Result<RawBlock, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            match self.read_frame() {
                Ok(Some(Frame::Data(block))) => return Some(Ok(block)),
                Ok(Some(Frame::Other)) => {}
                Ok(None) => self.done = true,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}

/// Parses an `OSMHeader` blob and checks that all of its required features are supported.
fn check_header(blob: &[u8]) -> Result<(), Error> {
    let header = osmformat::HeaderBlock::parse_from_bytes(&decode_blob(blob)?)?;

    let unknown_features: Vec<String> = header
        .required_features
        .iter()
        .filter(|f| !matches!(f.as_str(), "OsmSchema-V0.6" | "DenseNodes"))
        .cloned()
        .collect();

    if unknown_features.is_empty() {
        Ok(())
    } else {
        Err(Error::UnsupportedFeatures(unknown_features))
    }
}

/// Parses a serialized [fileformat::Blob] and returns its decompressed contents.
fn decode_blob(buf: &[u8]) -> Result<Vec<u8>, Error> {
    let blob = fileformat::Blob::parse_from_bytes(buf)?;
    let size_hint = (blob.raw_size().max(0) as usize).min(MAX_BLOB_SIZE);

    match blob.data {
        Some(fileformat::blob::Data::Raw(data)) => {
            if data.len() > MAX_BLOB_SIZE {
                Err(Error::BlobTooLarge(data.len()))
            } else {
                Ok(data)
            }
        }

        Some(fileformat::blob::Data::ZlibData(data)) => {
            decompress(flate2::read::ZlibDecoder::new(&data[..]), size_hint)
        }

        Some(fileformat::blob::Data::OBSOLETEBzip2Data(data)) => {
            decompress(bzip2::read::BzDecoder::new(&data[..]), size_hint)
        }

        Some(fileformat::blob::Data::LzmaData(_)) => Err(Error::UnsupportedCompression("lzma")),
        Some(fileformat::blob::Data::Lz4Data(_)) => Err(Error::UnsupportedCompression("lz4")),
        Some(fileformat::blob::Data::ZstdData(_)) => Err(Error::UnsupportedCompression("zstd")),

        None => Err(Error::MissingBlobData),
    }
}

/// Reads a decompressing stream to the end, refusing to produce more than [MAX_BLOB_SIZE] bytes.
/// The declared `raw_size` is only used as a capacity hint.
fn decompress<D: io::Read>(d: D, size_hint: usize) -> Result<Vec<u8>, Error> {
    let mut decompressed = Vec::with_capacity(size_hint);
    d.take(MAX_BLOB_SIZE as u64 + 1)
        .read_to_end(&mut decompressed)?;

    if decompressed.len() > MAX_BLOB_SIZE {
        Err(Error::BlobTooLarge(decompressed.len()))
    } else {
        Ok(decompressed)
    }
}

/// Block abstracts away an [osmformat::PrimitiveBlock] into a friendly interface.
pub struct Block(osmformat::PrimitiveBlock);

impl Block {
    /// Returns an iterator over all [Groups](Group) in this block.
    fn groups(self) -> impl Iterator<Item = Group> {
        let coordinate_converter = self.build_coordinate_converter();
        let string_table = Rc::new(self.build_string_table());
        self.0.primitivegroup.into_iter().map(move |g| Group {
            primitive_group: g,
            coordinate_converter,
            string_table: string_table.clone(),
        })
    }

    /// Returns a flattened iterator over all [Features](Feature) from all [Groups](Group) in this block,
    /// in the order in which they were stored.
    pub fn features(self) -> impl Iterator<Item = Feature> {
        self.groups().flat_map(|g| g.features())
    }

    /// Returns an iterator over all [Ways](Way) in this block. Nodes are not decoded.
    pub fn ways(self) -> impl Iterator<Item = Way> {
        self.groups().flat_map(|g| g.ways())
    }

    /// Converts the [osmformat::StringTable] into a simpler `Vec<String>`.
    fn build_string_table(&self) -> Vec<String> {
        self.0
            .stringtable
            .s
            .iter()
            .map(|bytes| String::from_utf8_lossy(bytes).to_string())
            .collect()
    }

    /// Builds a [CoordinateConverter] for this block.
    fn build_coordinate_converter(&self) -> CoordinateConverter {
        CoordinateConverter {
            lat_offset: self.0.lat_offset(),
            lon_offset: self.0.lon_offset(),
            granularity: self.0.granularity() as i64,
        }
    }
}

/// Group abstracts away an [osmformat::PrimitiveGroup] into a friendly interface.
struct Group {
    primitive_group: osmformat::PrimitiveGroup,
    coordinate_converter: CoordinateConverter,
    string_table: StringTable,
}

impl Group {
    /// Returns a flattened iterator over all [Features](Feature) in this group.
    fn features(self) -> impl Iterator<Item = Feature> {
        let nodes = Self::plain_nodes(self.primitive_group.nodes, self.coordinate_converter)
            .map(Feature::Node);

        let dense_nodes = Self::dense_nodes(
            self.primitive_group.dense.unwrap_or_default(),
            self.coordinate_converter,
        )
        .map(Feature::Node);

        let ways = Self::raw_ways(self.primitive_group.ways, self.string_table).map(Feature::Way);

        nodes.chain(dense_nodes).chain(ways)
    }

    fn ways(self) -> impl Iterator<Item = Way> {
        Self::raw_ways(self.primitive_group.ways, self.string_table)
    }

    /// Returns an iterator over all standard (non-dense-encoded) [nodes](Node) from a moved
    /// vector of [raw nodes](osmformat::Node).
    fn plain_nodes(
        raw_nodes: Vec<osmformat::Node>,
        coordinate_converter: CoordinateConverter,
    ) -> impl Iterator<Item = Node> {
        raw_nodes.into_iter().map(move |node| Node {
            id: node.id(),
            location: coordinate_converter.convert(node.lat(), node.lon()),
        })
    }

    /// Returns an iterator over all dense-encoded [nodes](Node) from a moved [raw dense nodes](osmformat::DenseNodes).
    fn dense_nodes(
        raw_dense_nodes: osmformat::DenseNodes,
        coordinate_converter: CoordinateConverter,
    ) -> impl Iterator<Item = Node> {
        let ids = delta_decode(raw_dense_nodes.id);
        let lats = delta_decode(raw_dense_nodes.lat);
        let lons = delta_decode(raw_dense_nodes.lon);

        ids.zip(lats.zip(lons)).map(move |(id, (lat, lon))| Node {
            id,
            location: coordinate_converter.convert(lat, lon),
        })
    }

    /// Returns an iterator over all [ways](Way) from a moved vector of [raw ways](osmformat::Way).
    fn raw_ways(
        raw_ways: Vec<osmformat::Way>,
        string_table: StringTable,
    ) -> impl Iterator<Item = Way> {
        raw_ways.into_iter().map(move |way| Way {
            id: way.id(),
            nodes: delta_decode(way.refs).collect(),
            tags: collect_tags(&way.keys, &way.vals, &string_table),
        })
    }
}

/// Converts latitudes and longitudes from OSM PBF representation to standard `f64` degrees.
#[derive(Clone, Copy)]
struct CoordinateConverter {
    lat_offset: i64,
    lon_offset: i64,
    granularity: i64,
}

impl CoordinateConverter {
    fn convert(&self, lat: i64, lon: i64) -> Point {
        Point::new(
            (self.lon_offset + self.granularity * lon) as f64 * 1e-9,
            (self.lat_offset + self.granularity * lat) as f64 * 1e-9,
        )
    }
}

fn delta_decode(deltas: Vec<i64>) -> impl Iterator<Item = i64> {
    deltas.into_iter().scan(0, |acc, delta| {
        *acc += delta;
        Some(*acc)
    })
}

fn collect_tags(keys: &[u32], values: &[u32], string_table: &[String]) -> HashMap<String, String> {
    keys.iter()
        .zip(values.iter())
        .map(|(&key_idx, &value_idx)| {
            (
                get_string(string_table, key_idx),
                get_string(string_table, value_idx),
            )
        })
        .collect()
}

#[inline]
fn get_string(table: &[String], idx: u32) -> String {
    table.get(idx as usize).cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::fixture::{way, Compression, PbfBuilder};
    use super::*;

    fn sample() -> Vec<u8> {
        PbfBuilder::new()
            .dense_nodes(
                &[(1, 19.94, 50.06), (2, 19.95, 50.07), (3, 19.96, 50.05)],
                Compression::Zlib,
            )
            .plain_nodes(&[(4, -118.2437, 34.0522)], Compression::Raw)
            .unknown_blob()
            .ways(
                &[way(10, &[1, 2, 3], &[("highway", "primary"), ("name", "Aleje")])],
                Compression::Bzip2,
            )
            .build()
    }

    fn read_features(data: &[u8]) -> Result<Vec<Feature>, Error> {
        let mut features = Vec::new();
        for raw in BlobReader::new(data) {
            features.extend(raw?.decode()?.features());
        }
        Ok(features)
    }

    #[test]
    fn reads_all_features() {
        let features = read_features(&sample()).unwrap();
        assert_eq!(features.len(), 5);

        let nodes: Vec<Node> = features
            .iter()
            .filter_map(|f| match f {
                Feature::Node(n) => Some(*n),
                _ => None,
            })
            .collect();
        assert_eq!(nodes.iter().map(|n| n.id).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        assert!((nodes[1].location.lon - 19.95).abs() < 1e-7);
        assert!((nodes[1].location.lat - 50.07).abs() < 1e-7);
        assert!((nodes[3].location.lon + 118.2437).abs() < 1e-7);

        let Some(Feature::Way(way)) = features.last() else {
            panic!("expected the last feature to be a way");
        };
        assert_eq!(way.id, 10);
        assert_eq!(way.nodes, vec![1, 2, 3]);
        assert_eq!(way.tags.get("highway").map(String::as_str), Some("primary"));
        assert_eq!(way.tags.get("name").map(String::as_str), Some("Aleje"));
    }

    #[test]
    fn blocks_are_decoded_separately() {
        let data = sample();
        let blocks: Vec<RawBlock> = BlobReader::new(&data[..]).collect::<Result<_, _>>().unwrap();
        assert_eq!(blocks.len(), 3);

        let mut blocks = blocks.into_iter();
        assert_eq!(blocks.next().unwrap().decode().unwrap().features().count(), 3);
        assert_eq!(blocks.next().unwrap().decode().unwrap().ways().count(), 0);
        assert_eq!(blocks.next().unwrap().decode().unwrap().ways().count(), 1);
    }

    #[test]
    fn truncated_file_is_an_error() {
        let data = sample();
        let truncated = &data[..data.len() - 10];
        assert!(matches!(read_features(truncated), Err(Error::Io(_))));
    }

    #[test]
    fn truncated_blob_header_size_is_an_error() {
        for extra in 1..4 {
            let mut data = sample();
            data.extend(std::iter::repeat(0).take(extra));

            let mut reader = BlobReader::new(&data[..]);
            for _ in 0..3 {
                assert!(reader.next().unwrap().is_ok());
            }
            assert!(matches!(
                reader.next(),
                Some(Err(Error::TruncatedBlobHeaderSize(n))) if n == extra
            ));
            assert!(reader.next().is_none());
        }
    }

    #[test]
    fn unsupported_features_are_rejected() {
        let data = PbfBuilder::with_required_features(&["OsmSchema-V0.6", "HistoricalInformation"])
            .build();
        let result: Result<Vec<_>, _> = BlobReader::new(&data[..]).collect();
        assert!(
            matches!(
                result,
                Err(Error::UnsupportedFeatures(ref f)) if f == &["HistoricalInformation"]
            )
        );
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let mut data = 4u32.to_be_bytes().to_vec();
        data.extend_from_slice(&[0xff, 0xff, 0xff, 0xff]);
        let result: Result<Vec<_>, _> = BlobReader::new(&data[..]).collect();
        assert!(matches!(result, Err(Error::Protobuf(_))));
    }

    #[test]
    fn empty_file() {
        assert_eq!(BlobReader::new(&[][..]).count(), 0);
    }
}
