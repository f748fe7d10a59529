//! Clusters: independently compressed runs of blobs.
//!
//! Each cluster starts with a byte naming its compression,
//! followed by a (possibly compressed) stream holding an offset table
//! and then the blobs themselves, back to back:
//!
//! ```text
//! [compression] [offset 0] ... [offset N] [blob 0] ... [blob N-1]
//! ```
//!
//! Offsets are relative to the start of the offset table, so the first one
//! is also the size of the table. Blob `i` spans `offset i..offset i+1`.
//! Offsets are 4 bytes wide, or 8 in "extended" clusters.

use std::io::{self, prelude::*};
use std::num::NonZeroUsize;
use std::sync::Arc;

use log::*;
use lru::LruCache;

use crate::arch::usize;
use crate::result::*;

/// How a cluster's blob stream is compressed
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Compression {
    /// The blobs are stored as-is
    None,
    /// LZMA2, in an XZ container
    Xz,
    /// [Zstandard](https://facebook.github.io/zstd/)
    Zstd,
    /// The cluster uses a yet-unsupported format.
    /// (The u8 indicates the raw compression byte.)
    Unsupported(u8),
}

/// Hands out decompressing readers for cluster streams.
///
/// The archive owns one of these and asks it for a reader each time
/// it decodes a cluster; swap it out to change how (or how often)
/// decompression happens.
pub trait Decompressors {
    fn decoder<'a>(
        &self,
        compression: Compression,
        input: &'a mut dyn BufRead,
    ) -> ZimResult<Box<dyn Read + 'a>>;
}

/// XZ streams written by zimlib use (up to) a 40 MiB dictionary.
///
/// This is the writer's window, not a decoder limit:
/// liblzma needs a bit more than the dictionary size to decode.
pub const XZ_DICTIONARY_WINDOW: u64 = 40 * 1024 * 1024;

/// Default XZ decoder memory limit, in bytes: none at all.
pub const DEFAULT_XZ_MEMORY_LIMIT: u64 = u64::MAX;

/// Decompressors backed by liblzma (via `xz2`) and libzstd (via `zstd`)
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StandardDecompressors {
    /// Memory limit (in bytes) handed to the XZ decoder.
    /// Streams needing more fail to decode with an I/O error.
    pub xz_memory_limit: u64,
}

impl Default for StandardDecompressors {
    fn default() -> Self {
        Self {
            xz_memory_limit: DEFAULT_XZ_MEMORY_LIMIT,
        }
    }
}

impl Decompressors for StandardDecompressors {
    fn decoder<'a>(
        &self,
        compression: Compression,
        input: &'a mut dyn BufRead,
    ) -> ZimResult<Box<dyn Read + 'a>> {
        match compression {
            Compression::None => Ok(Box::new(input)),
            Compression::Xz => {
                let stream = xz2::stream::Stream::new_stream_decoder(self.xz_memory_limit, 0)
                    .map_err(io::Error::from)?;
                Ok(Box::new(xz2::bufread::XzDecoder::new_stream(input, stream)))
            }
            Compression::Zstd => {
                let decoder = zstd::stream::read::Decoder::with_buffer(input)?.single_frame();
                Ok(Box::new(decoder))
            }
            Compression::Unsupported(code) => Err(ZimError::UnsupportedArchive(format!(
                "Cluster compression {} not supported",
                code
            ))),
        }
    }
}

/// A decoded cluster and all its blobs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    number: u32,
    compression: Compression,
    extended: bool,
    blobs: Vec<Vec<u8>>,
}

impl Cluster {
    /// Decodes a whole cluster, starting at its compression byte.
    pub fn read<D: Decompressors + ?Sized>(
        number: u32,
        input: &mut dyn BufRead,
        decompressors: &D,
    ) -> ZimResult<Self> {
        let mut code = [0; 1];
        input.read_exact(&mut code)?;
        let (compression, extended) = Compression::from_u8(code[0]);
        debug!(
            "Decoding cluster {} ({:?}, extended: {})",
            number, compression, extended
        );

        let mut stream = decompressors.decoder(compression, input)?;
        let offsets = read_offsets(&mut stream, extended)?;
        trace!("Cluster {} offsets: {:?}", number, offsets);

        let mut blobs = Vec::with_capacity(offsets.len() - 1);
        for span in offsets.windows(2) {
            let len = span[1] - span[0];
            let mut blob = Vec::with_capacity(usize(len.min(1 << 20))?);
            stream.by_ref().take(len).read_to_end(&mut blob)?;
            if (blob.len() as u64) < len {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "Truncated blob").into());
            }
            blobs.push(blob);
        }

        Ok(Self {
            number,
            compression,
            extended,
            blobs,
        })
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// True if the cluster's offset table used 8-byte entries
    pub fn is_extended(&self) -> bool {
        self.extended
    }

    /// The number of blobs in the cluster
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    /// Returns the given blob, which may be empty.
    pub fn blob(&self, blob: u32) -> ZimResult<&[u8]> {
        self.blobs
            .get(usize(blob)?)
            .map(Vec::as_slice)
            .ok_or_else(|| ZimError::out_of_range("Blob", blob, self.blobs.len() as u64))
    }

    pub fn blobs(&self) -> impl Iterator<Item = &[u8]> {
        self.blobs.iter().map(Vec::as_slice)
    }
}

fn read_offset(stream: &mut dyn Read, extended: bool) -> io::Result<u64> {
    if extended {
        let mut buf = [0; 8];
        stream.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    } else {
        let mut buf = [0; 4];
        stream.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf) as u64)
    }
}

/// Reads the offset table: `blob count + 1` non-decreasing offsets.
fn read_offsets(stream: &mut dyn Read, extended: bool) -> ZimResult<Vec<u64>> {
    let width = if extended { 8 } else { 4 };

    // The first offset points just past the table,
    // so it also tells us how many entries the table has.
    let first = read_offset(stream, extended)?;
    if first == 0 || first % width != 0 {
        return Err(ZimError::InvalidArchive(
            "Cluster offset table size isn't a multiple of its entry size",
        ));
    }
    let offset_count = first / width;

    // Don't trust the count for preallocation; the table might be garbage.
    let mut offsets = Vec::with_capacity(usize(offset_count.min(4096))?);
    offsets.push(first);
    for _ in 1..offset_count {
        let offset = read_offset(stream, extended)?;
        if offset < *offsets.last().expect("at least the first offset") {
            return Err(ZimError::InvalidArchive("Cluster offsets decrease"));
        }
        offsets.push(offset);
    }
    Ok(offsets)
}

/// A bounded cache of decoded clusters.
///
/// Evicts the least recently used cluster once full.
pub struct ClusterCache {
    clusters: LruCache<u32, Arc<Cluster>>,
}

/// How many decoded clusters an archive keeps around by default
pub const DEFAULT_CLUSTER_CACHE_SIZE: usize = 100;

impl ClusterCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            clusters: LruCache::new(capacity),
        }
    }

    pub fn get(&mut self, number: u32) -> Option<Arc<Cluster>> {
        self.clusters.get(&number).cloned()
    }

    pub fn insert(&mut self, cluster: Arc<Cluster>) {
        if let Some((evicted, _)) = self.clusters.push(cluster.number(), cluster) {
            trace!("Evicted cluster {} from the cache", evicted);
        }
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    pub fn clear(&mut self) {
        self.clusters.clear()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Builds a cluster stream (offset table + blobs) without the compression byte.
    fn blob_stream(blobs: &[&[u8]], extended: bool) -> Vec<u8> {
        let width = if extended { 8 } else { 4 };
        let mut offset = (blobs.len() as u64 + 1) * width;
        let mut stream = Vec::new();
        let push = |stream: &mut Vec<u8>, o: u64| {
            if extended {
                stream.extend_from_slice(&o.to_le_bytes());
            } else {
                stream.extend_from_slice(&(o as u32).to_le_bytes());
            }
        };
        push(&mut stream, offset);
        for blob in blobs {
            offset += blob.len() as u64;
            push(&mut stream, offset);
        }
        for blob in blobs {
            stream.extend_from_slice(blob);
        }
        stream
    }

    fn decode(code: u8, stream: &[u8]) -> ZimResult<Cluster> {
        let mut bytes = vec![code];
        bytes.extend_from_slice(stream);
        Cluster::read(0, &mut bytes.as_slice(), &StandardDecompressors::default())
    }

    #[test]
    fn zero_length_blobs() {
        let stream = blob_stream(&[b"hello", b"", b"world!!"], false);
        // 4 entries of 4 bytes each, then 5, 0, and 7 bytes of blobs
        let offsets: Vec<u32> = stream[..16]
            .chunks(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(offsets, [16, 21, 21, 28]);

        let cluster = decode(1, &stream).unwrap();
        assert!(!cluster.is_extended());
        assert_eq!(cluster.compression(), Compression::None);
        assert_eq!(cluster.len(), 3);
        assert_eq!(cluster.blob(0).unwrap(), b"hello");
        assert_eq!(cluster.blob(1).unwrap(), b"");
        assert_eq!(cluster.blob(2).unwrap(), b"world!!");
        assert!(matches!(
            cluster.blob(5),
            Err(ZimError::OutOfRange { index: 5, count: 3, .. })
        ));
    }

    #[test]
    fn extended_offsets() {
        let stream = blob_stream(&[b"one", b"two"], true);
        for code in [8, 9, 0x11] {
            let cluster = decode(code, &stream).unwrap();
            assert!(cluster.is_extended());
            assert_eq!(cluster.blobs().collect::<Vec<_>>(), [b"one", b"two"]);
        }
    }

    #[test]
    fn xz_cluster() {
        let stream = blob_stream(&[b"compressed", b"", b"with xz"], false);
        let mut compressed = Vec::new();
        let mut encoder = xz2::write::XzEncoder::new(&mut compressed, 6);
        encoder.write_all(&stream).unwrap();
        encoder.finish().unwrap();

        let cluster = decode(4, &compressed).unwrap();
        assert_eq!(cluster.compression(), Compression::Xz);
        assert_eq!(cluster.blob(2).unwrap(), b"with xz");
        assert_eq!(cluster.blob(1).unwrap(), b"");
    }

    fn xz_with_dictionary(stream: &[u8], dict_size: u32) -> Vec<u8> {
        let mut options = xz2::stream::LzmaOptions::new_preset(6).unwrap();
        options.dict_size(dict_size);
        let mut filters = xz2::stream::Filters::new();
        filters.lzma2(&options);
        let encoder_stream =
            xz2::stream::Stream::new_stream_encoder(&filters, xz2::stream::Check::Crc64).unwrap();

        let mut compressed = Vec::new();
        let mut encoder = xz2::write::XzEncoder::new_stream(&mut compressed, encoder_stream);
        encoder.write_all(stream).unwrap();
        encoder.finish().unwrap();
        compressed
    }

    #[test]
    fn xz_with_large_dictionaries() {
        let stream = blob_stream(&[b"hello"], false);

        // zimlib's own window
        let compressed = xz_with_dictionary(&stream, XZ_DICTIONARY_WINDOW as u32);
        let cluster = decode(4, &compressed).unwrap();
        assert_eq!(cluster.blob(0).unwrap(), b"hello");

        // xz -9 uses a 64 MiB dictionary.
        let mut preset_9 = Vec::new();
        let mut encoder = xz2::write::XzEncoder::new(&mut preset_9, 9);
        encoder.write_all(&stream).unwrap();
        encoder.finish().unwrap();
        let cluster = decode(4, &preset_9).unwrap();
        assert_eq!(cluster.blob(0).unwrap(), b"hello");

        // An explicit limit still applies.
        let mut bytes = vec![4];
        bytes.extend_from_slice(&preset_9);
        let stingy = StandardDecompressors {
            xz_memory_limit: 1024 * 1024,
        };
        assert!(matches!(
            Cluster::read(0, &mut bytes.as_slice(), &stingy),
            Err(ZimError::Io(_))
        ));
    }

    #[test]
    fn zstd_cluster() {
        let stream = blob_stream(&[b"compressed", b"with zstd"], true);
        let compressed = zstd::encode_all(stream.as_slice(), 3).unwrap();

        let cluster = decode(13, &compressed).unwrap();
        assert_eq!(cluster.compression(), Compression::Zstd);
        assert!(cluster.is_extended());
        assert_eq!(cluster.blob(0).unwrap(), b"compressed");
        assert_eq!(cluster.blob(1).unwrap(), b"with zstd");
    }

    #[test]
    fn unsupported_compression() {
        let stream = blob_stream(&[b"whatever"], false);
        match decode(99, &stream) {
            Err(ZimError::UnsupportedArchive(msg)) => assert!(msg.contains("99")),
            other => panic!("Expected unsupported compression, got {:?}", other),
        }
    }

    #[test]
    fn bad_offset_tables() {
        // First offset isn't a multiple of 4
        assert!(matches!(
            decode(1, &[6, 0, 0, 0, 0, 0]),
            Err(ZimError::InvalidArchive(_))
        ));
        // Offsets go backwards
        let mut stream = Vec::new();
        for o in [12u32, 14, 13] {
            stream.extend_from_slice(&o.to_le_bytes());
        }
        stream.extend_from_slice(b"xx");
        assert!(matches!(decode(1, &stream), Err(ZimError::InvalidArchive(_))));
    }

    #[test]
    fn truncated_blob() {
        let mut stream = blob_stream(&[b"abcdef"], false);
        stream.truncate(stream.len() - 2);
        assert!(matches!(decode(0, &stream), Err(ZimError::Io(_))));
    }

    #[test]
    fn cache_evicts_least_recently_used() {
        let cluster = |number| {
            Arc::new(Cluster {
                number,
                compression: Compression::None,
                extended: false,
                blobs: vec![],
            })
        };
        let mut cache = ClusterCache::new(NonZeroUsize::new(2).unwrap());
        cache.insert(cluster(0));
        cache.insert(cluster(1));
        assert!(cache.get(0).is_some());
        cache.insert(cluster(2));
        assert_eq!(cache.len(), 2);
        assert!(cache.get(1).is_none());
        assert!(cache.get(0).is_some());
        assert!(cache.get(2).is_some());
    }
}
