//! The three pointer tables every lookup starts from.
//!
//! They're read into memory once when the archive is opened,
//! so finding an entry or cluster never costs an extra seek.

use std::convert::TryInto;
use std::io::prelude::*;
use std::sync::OnceLock;

use log::*;

use crate::arch::usize;
use crate::format::Header;
use crate::result::*;
use crate::source::ByteSource;

/// URL, title, and cluster pointer lists, as raw little-endian bytes
#[derive(Debug)]
pub struct IndexTables {
    /// `entry_count` u64s: URL index -> directory entry offset
    url_pointers: Vec<u8>,
    /// `entry_count` u32s: title ordinal -> URL index
    title_pointers: Vec<u8>,
    /// `cluster_count` u64s: cluster number -> cluster offset
    cluster_pointers: Vec<u8>,
    entry_count: u32,
    cluster_count: u32,
    /// URL index -> title ordinal, built the first time someone asks.
    title_ordinals: OnceLock<Vec<u32>>,
}

impl IndexTables {
    pub fn load<R: Read + Seek>(source: &mut ByteSource<R>, header: &Header) -> ZimResult<Self> {
        let entries = header.entry_count as u64;
        let clusters = header.cluster_count as u64;

        source.seek(header.url_ptr_pos)?;
        let url_pointers = source.read_bytes(entries * 8)?;
        source.seek(header.title_ptr_pos)?;
        let title_pointers = source.read_bytes(entries * 4)?;
        source.seek(header.cluster_ptr_pos)?;
        let cluster_pointers = source.read_bytes(clusters * 8)?;

        debug!(
            "Loaded pointers for {} entries and {} clusters",
            entries, clusters
        );

        Ok(Self {
            url_pointers,
            title_pointers,
            cluster_pointers,
            entry_count: header.entry_count,
            cluster_count: header.cluster_count,
            title_ordinals: OnceLock::new(),
        })
    }

    pub fn entry_count(&self) -> u32 {
        self.entry_count
    }

    pub fn cluster_count(&self) -> u32 {
        self.cluster_count
    }

    /// Offset of the directory entry at the given URL index
    pub fn url_pointer(&self, url_index: u32) -> ZimResult<u64> {
        if url_index >= self.entry_count {
            return Err(ZimError::out_of_range(
                "URL index",
                url_index,
                self.entry_count,
            ));
        }
        let at = usize(url_index)? * 8;
        Ok(u64::from_le_bytes(
            self.url_pointers[at..at + 8].try_into().expect("u64 slice"),
        ))
    }

    /// URL index of the entry at the given title ordinal
    pub fn title_pointer(&self, ordinal: u32) -> ZimResult<u32> {
        if ordinal >= self.entry_count {
            return Err(ZimError::out_of_range(
                "Title ordinal",
                ordinal,
                self.entry_count,
            ));
        }
        let at = usize(ordinal)? * 4;
        let url_index = u32::from_le_bytes(
            self.title_pointers[at..at + 4].try_into().expect("u32 slice"),
        );
        if url_index >= self.entry_count {
            return Err(ZimError::InvalidArchive(
                "Title pointer list points past the last entry",
            ));
        }
        Ok(url_index)
    }

    /// Offset of the given cluster
    pub fn cluster_pointer(&self, cluster: u32) -> ZimResult<u64> {
        if cluster >= self.cluster_count {
            return Err(ZimError::out_of_range(
                "Cluster",
                cluster,
                self.cluster_count,
            ));
        }
        let at = usize(cluster)? * 8;
        Ok(u64::from_le_bytes(
            self.cluster_pointers[at..at + 8]
                .try_into()
                .expect("u64 slice"),
        ))
    }

    /// Title ordinal of the entry at the given URL index:
    /// the inverse of [`title_pointer()`](#method.title_pointer).
    pub fn title_ordinal(&self, url_index: u32) -> ZimResult<u32> {
        if url_index >= self.entry_count {
            return Err(ZimError::out_of_range(
                "URL index",
                url_index,
                self.entry_count,
            ));
        }
        if self.title_ordinals.get().is_none() {
            let inverse = self.invert_title_pointers()?;
            // Someone else may have won the race; their table is the same.
            let _ = self.title_ordinals.set(inverse);
        }
        let ordinals = self.title_ordinals.get().expect("just initialized");
        Ok(ordinals[usize(url_index)?])
    }

    fn invert_title_pointers(&self) -> ZimResult<Vec<u32>> {
        trace!("Inverting {} title pointers", self.entry_count);
        let mut inverse = vec![u32::MAX; usize(self.entry_count)?];
        for ordinal in 0..self.entry_count {
            let slot = &mut inverse[usize(self.title_pointer(ordinal)?)?];
            if *slot != u32::MAX {
                return Err(ZimError::InvalidArchive(
                    "Title pointer list isn't a permutation",
                ));
            }
            *slot = ordinal;
        }
        Ok(inverse)
    }
}
