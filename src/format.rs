//! Code specific to the ZIM file format.
//!
//! We try to keep the nitty gritty here,
//! and higher-level stuff in the [`read`] module.
//!
//! Layout comments follow the openZIM wiki's
//! [ZIM file format](https://wiki.openzim.org/wiki/ZIM_file_format) page.
//!
//! [`read`]: ../read/index.html

use std::convert::TryInto;
use std::io::prelude::*;

use log::*;

use crate::cluster::Compression;
use crate::read::{ArticleEntry, DirectoryEntry, RedirectEntry};
use crate::result::*;
use crate::source::ByteSource;

/// "ZIM\x04", read little-endian
pub const ZIM_MAGIC: u32 = 0x044D_495A;

/// Size of the fixed header at the front of every archive
pub const HEADER_SIZE: usize = 80;

/// Main page and layout page value meaning "there isn't one"
pub const NO_PAGE: u32 = u32::MAX;

/// Directory entry type code marking a redirect
pub const REDIRECT_MIME: u16 = 0xFFFF;

/// Offset of the URL within a redirect entry
const REDIRECT_URL_OFFSET: u64 = 12;
/// Offset of the URL within an article entry
const ARTICLE_URL_OFFSET: u64 = 16;

impl Compression {
    /// Decodes a cluster's leading byte into its compression and whether
    /// its offset table uses 8-byte ("extended") entries.
    ///
    /// Older readers fold the extended flag into bit 3 (8, 9, 12, 13);
    /// libzim writes it as bit 4 (0x10, 0x11, 0x14, 0x15). Both show up.
    pub(crate) fn from_u8(code: u8) -> (Self, bool) {
        match code {
            0 | 1 => (Compression::None, false),
            8 | 9 | 0x10 | 0x11 => (Compression::None, true),
            4 => (Compression::Xz, false),
            12 | 0x14 => (Compression::Xz, true),
            5 => (Compression::Zstd, false),
            13 | 0x15 => (Compression::Zstd, true),
            // 2 and 3 were zlib and bzip2, long since removed from the format.
            other => (Compression::Unsupported(other), false),
        }
    }
}

// Straight from the Rust docs:

/// Reads a little-endian u64 from the front of the provided slice, shrinking it.
fn read_u64(input: &mut &[u8]) -> u64 {
    let (int_bytes, rest) = input.split_at(std::mem::size_of::<u64>());
    *input = rest;
    u64::from_le_bytes(int_bytes.try_into().expect("less than eight bytes for u64"))
}

/// Reads a little-endian u32 from the front of the provided slice, shrinking it.
fn read_u32(input: &mut &[u8]) -> u32 {
    let (int_bytes, rest) = input.split_at(std::mem::size_of::<u32>());
    *input = rest;
    u32::from_le_bytes(int_bytes.try_into().expect("less than four bytes for u32"))
}

/// Reads a little-endian u16 from the front of the provided slice, shrinking it.
fn read_u16(input: &mut &[u8]) -> u16 {
    let (int_bytes, rest) = input.split_at(std::mem::size_of::<u16>());
    *input = rest;
    u16::from_le_bytes(int_bytes.try_into().expect("less than two bytes for u16"))
}

/// The fixed header at the front of a ZIM archive
///
/// Tells us how many entries and clusters there are,
/// and where to find the tables that locate them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub magic: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub uuid: [u8; 16],
    pub entry_count: u32,
    pub cluster_count: u32,
    pub url_ptr_pos: u64,
    pub title_ptr_pos: u64,
    pub cluster_ptr_pos: u64,
    pub mime_list_pos: u64,
    pub main_page: u32,
    pub layout_page: u32,
    pub checksum_pos: u64,
}

impl Header {
    pub fn parse(header: &[u8; HEADER_SIZE]) -> ZimResult<Self> {
        // Offset  Len  Field
        //  0       4   magicNumber     (72173914)
        //  4       2   majorVersion
        //  6       2   minorVersion
        //  8      16   uuid
        // 24       4   entryCount
        // 28       4   clusterCount
        // 32       8   pathPtrPos      (URL pointer list)
        // 40       8   titlePtrPos
        // 48       8   clusterPtrPos
        // 56       8   mimeListPos
        // 64       4   mainPage        (0xffffffff if none)
        // 68       4   layoutPage      (0xffffffff if none)
        // 72       8   checksumPos
        let mut header: &[u8] = header;
        let magic = read_u32(&mut header);
        if magic != ZIM_MAGIC {
            if cfg!(feature = "check-magic") {
                return Err(ZimError::InvalidArchive("Bad magic number"));
            }
            warn!("Bad magic number {:#010x}, reading anyways", magic);
        }
        let major_version = read_u16(&mut header);
        let minor_version = read_u16(&mut header);
        let (uuid, rest) = header.split_at(16);
        header = rest;
        let uuid = uuid.try_into().expect("less than sixteen bytes for uuid");
        let entry_count = read_u32(&mut header);
        let cluster_count = read_u32(&mut header);
        let url_ptr_pos = read_u64(&mut header);
        let title_ptr_pos = read_u64(&mut header);
        let cluster_ptr_pos = read_u64(&mut header);
        let mime_list_pos = read_u64(&mut header);
        let main_page = read_u32(&mut header);
        let layout_page = read_u32(&mut header);
        let checksum_pos = read_u64(&mut header);

        Ok(Self {
            magic,
            major_version,
            minor_version,
            uuid,
            entry_count,
            cluster_count,
            url_ptr_pos,
            title_ptr_pos,
            cluster_ptr_pos,
            mime_list_pos,
            main_page,
            layout_page,
            checksum_pos,
        })
    }

    /// The URL index of the main page, if the archive declares one
    pub fn main_page(&self) -> Option<u32> {
        (self.main_page != NO_PAGE).then_some(self.main_page)
    }

    /// The URL index of the layout page, if the archive declares one
    pub fn layout_page(&self) -> Option<u32> {
        (self.layout_page != NO_PAGE).then_some(self.layout_page)
    }

    /// Makes sure each table the header points to fits in an archive
    /// of the given length.
    pub fn check_bounds(&self, archive_len: u64) -> ZimResult<()> {
        let fits = |pos: u64, count: u32, width: u64| {
            (count as u64)
                .checked_mul(width)
                .and_then(|size| pos.checked_add(size))
                .map_or(false, |end| end <= archive_len)
        };
        if !fits(self.url_ptr_pos, self.entry_count, 8) {
            return Err(ZimError::InvalidArchive("URL pointer list past end of file"));
        }
        if !fits(self.title_ptr_pos, self.entry_count, 4) {
            return Err(ZimError::InvalidArchive(
                "Title pointer list past end of file",
            ));
        }
        if !fits(self.cluster_ptr_pos, self.cluster_count, 8) {
            return Err(ZimError::InvalidArchive(
                "Cluster pointer list past end of file",
            ));
        }
        if self.mime_list_pos >= archive_len {
            return Err(ZimError::InvalidArchive("MIME type list past end of file"));
        }
        Ok(())
    }
}

/// Reads the MIME type list: NUL-terminated strings, ending with an empty one.
pub fn read_mime_types<R: Read + Seek>(
    source: &mut ByteSource<R>,
    mime_list_pos: u64,
) -> ZimResult<Vec<String>> {
    source.seek(mime_list_pos)?;
    let mut mime_types = Vec::new();
    loop {
        let mime_type = source.read_zero_terminated_string()?;
        if mime_type.is_empty() {
            break;
        }
        mime_types.push(mime_type);
    }
    trace!("MIME types: {:?}", mime_types);
    Ok(mime_types)
}

impl DirectoryEntry {
    /// Parses the directory entry at the source's current position.
    ///
    /// `ordinal` is its position in title order, `url_index` in URL order;
    /// neither is stored in the entry itself.
    pub(crate) fn parse<R: Read + Seek>(
        source: &mut ByteSource<R>,
        ordinal: u32,
        url_index: u32,
    ) -> ZimResult<Self> {
        // Content entry:
        //
        //   mimetype        2 bytes   (0xffff for redirects)
        //   parameter len   1 byte    (unused)
        //   namespace       1 byte
        //   revision        4 bytes   (unused)
        //
        // then for articles:
        //   cluster number  4 bytes
        //   blob number     4 bytes
        // or for redirects:
        //   redirect index  4 bytes
        //
        //   url             zero terminated
        //   title           zero terminated (empty means "same as url")
        let mime_type = source.read_u16()?;
        let _parameter_len = source.read_u8()?;
        let namespace = source.read_u8()? as char;
        let _revision = source.read_u32()?;

        if mime_type == REDIRECT_MIME {
            let target = source.read_u32()?;
            let (url, title) = read_url_and_title(source)?;
            Ok(DirectoryEntry::Redirect(RedirectEntry {
                ordinal,
                url_index,
                namespace,
                url,
                title,
                target,
            }))
        } else {
            let cluster = source.read_u32()?;
            let blob = source.read_u32()?;
            let (url, title) = read_url_and_title(source)?;
            Ok(DirectoryEntry::Article(ArticleEntry {
                ordinal,
                url_index,
                mime_type,
                namespace,
                url,
                title,
                cluster,
                blob,
            }))
        }
    }
}

fn read_url_and_title<R: Read + Seek>(source: &mut ByteSource<R>) -> ZimResult<(String, String)> {
    let url = source.read_zero_terminated_string()?;
    let title = source.read_zero_terminated_string()?;
    let title = if title.is_empty() { url.clone() } else { title };
    Ok((url, title))
}

/// Reads only the URL of the directory entry at `entry_pos`,
/// skipping the rest of the fixed fields.
pub fn read_entry_url<R: Read + Seek>(
    source: &mut ByteSource<R>,
    entry_pos: u64,
) -> ZimResult<String> {
    source.seek(entry_pos)?;
    let mime_type = source.read_u16()?;
    let url_offset = if mime_type == REDIRECT_MIME {
        REDIRECT_URL_OFFSET
    } else {
        ARTICLE_URL_OFFSET
    };
    source.seek(entry_pos + url_offset)?;
    source.read_zero_terminated_string()
}
