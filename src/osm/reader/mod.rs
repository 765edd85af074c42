// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::PathBuf;

use log::info;

pub mod model;
pub mod pbf;

/// First two bytes of every [gzip](https://en.wikipedia.org/wiki/Gzip) member.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Where to read an OSM PBF file from.
///
/// The importer needs to read the file twice, so every source is turned into a
/// seekable [File] first: gzip-compressed input (either declared through `content_encoding`
/// or detected by its magic bytes) is decompressed, and non-seekable streams are
/// spooled into an anonymous temporary file.
pub enum PbfSource {
    Path(PathBuf),
    File(File),
    Stream {
        reader: Box<dyn Read + Send>,

        /// Value of the `Content-Encoding` header of the upstream response, if any.
        content_encoding: Option<String>,
    },
}

impl std::fmt::Debug for PbfSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Path(p) => f.debug_tuple("Path").field(p).finish(),
            Self::File(file) => f.debug_tuple("File").field(file).finish(),
            Self::Stream {
                content_encoding, ..
            } => f
                .debug_struct("Stream")
                .field("content_encoding", content_encoding)
                .finish_non_exhaustive(),
        }
    }
}

impl PbfSource {
    pub fn stream<R: Read + Send + 'static>(reader: R) -> Self {
        Self::Stream {
            reader: Box::new(reader),
            content_encoding: None,
        }
    }

    /// Turns the source into a seekable, uncompressed [File] positioned at its start.
    pub fn open(self) -> io::Result<File> {
        match self {
            Self::Path(path) => open_file(File::open(path)?),
            Self::File(file) => open_file(file),
            Self::Stream {
                reader,
                content_encoding,
            } => {
                let declared_gzip = content_encoding.as_deref().is_some_and(is_gzip_encoding);
                let (magic, reader) = peek_magic(reader)?;

                if declared_gzip || magic == GZIP_MAGIC {
                    info!("Decompressing gzip-encoded input into a temporary file");
                    spool(flate2::read::MultiGzDecoder::new(reader))
                } else {
                    spool(reader)
                }
            }
        }
    }
}

fn open_file(mut file: File) -> io::Result<File> {
    let mut magic = [0u8; 2];
    let n = read_up_to(&mut file, &mut magic)?;
    file.seek(SeekFrom::Start(0))?;

    if n == 2 && magic == GZIP_MAGIC {
        info!("Decompressing gzip-compressed file into a temporary file");
        spool(flate2::read::MultiGzDecoder::new(file))
    } else {
        Ok(file)
    }
}

/// Copies a stream into an anonymous temporary file, returning it rewound.
fn spool<R: Read>(mut reader: R) -> io::Result<File> {
    let mut tmp = tempfile::tempfile()?;
    let written = io::copy(&mut reader, &mut tmp)?;
    tmp.seek(SeekFrom::Start(0))?;
    info!("Spooled {written} bytes of PBF data");
    Ok(tmp)
}

/// Reads the first two bytes of a stream, returning them together with
/// a reader producing the whole, unmodified stream.
fn peek_magic(mut reader: Box<dyn Read + Send>) -> io::Result<([u8; 2], impl Read)> {
    let mut magic = [0u8; 2];
    let n = read_up_to(&mut reader, &mut magic)?;
    let head = io::Cursor::new(magic[..n].to_vec());
    Ok((magic, head.chain(reader)))
}

fn read_up_to<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn is_gzip_encoding(value: &str) -> bool {
    value
        .split(',')
        .any(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "gzip" | "x-gzip"))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut e = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        e.write_all(data).unwrap();
        e.finish().unwrap()
    }

    fn read_all(mut f: File) -> Vec<u8> {
        let mut buf = Vec::new();
        f.read_to_end(&mut buf).unwrap();
        buf
    }

    /// A reader which can't seek and returns data in tiny chunks.
    struct Trickle(io::Cursor<Vec<u8>>);

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(1);
            self.0.read(&mut buf[..n])
        }
    }

    #[test]
    fn plain_stream_is_spooled() {
        let source = PbfSource::stream(Trickle(io::Cursor::new(b"plain pbf bytes".to_vec())));
        assert_eq!(read_all(source.open().unwrap()), b"plain pbf bytes");
    }

    #[test]
    fn declared_gzip_stream() {
        let source = PbfSource::Stream {
            reader: Box::new(io::Cursor::new(gzip(b"compressed"))),
            content_encoding: Some("GZIP".to_string()),
        };
        assert_eq!(read_all(source.open().unwrap()), b"compressed");
    }

    #[test]
    fn sniffed_gzip_stream() {
        let source = PbfSource::stream(Trickle(io::Cursor::new(gzip(b"sniffed"))));
        assert_eq!(read_all(source.open().unwrap()), b"sniffed");
    }

    #[test]
    fn files() {
        let mut plain = tempfile::NamedTempFile::new().unwrap();
        plain.write_all(b"raw").unwrap();
        let opened = PbfSource::Path(plain.path().to_path_buf()).open().unwrap();
        assert_eq!(read_all(opened), b"raw");

        let mut compressed = tempfile::tempfile().unwrap();
        compressed.write_all(&gzip(b"from a gzip file")).unwrap();
        compressed.seek(SeekFrom::Start(0)).unwrap();
        let opened = PbfSource::File(compressed).open().unwrap();
        assert_eq!(read_all(opened), b"from a gzip file");
    }

    #[test]
    fn tiny_inputs() {
        assert_eq!(read_all(PbfSource::stream(io::empty()).open().unwrap()), b"");
        assert_eq!(read_all(PbfSource::stream(&b"x"[..]).open().unwrap()), b"x");
    }

    #[test]
    fn encoding_header() {
        assert!(is_gzip_encoding("gzip"));
        assert!(is_gzip_encoding("identity, x-gzip"));
        assert!(!is_gzip_encoding("br"));
    }
}
