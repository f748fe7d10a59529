//! zimr reads [ZIM](https://wiki.openzim.org/wiki/ZIM_file_format) archives,
//! the offline Wikipedia (and friends) format, using a simple API:
//!
//! ```no_run
//! # use zimr::*;
//! let mut archive = ZimArchive::open("wikipedia_en_all.zim")?;
//!
//! // Look things up by namespace and title (or URL)...
//! if let Some(entry) = archive.entry_by_key('A', "Rust_(programming_language)")? {
//!     // Redirects point at other entries; follow them to the article.
//!     let article = archive.resolve(entry)?;
//!     let html = archive.blob(article.cluster, article.blob)?;
//!     # let _ = html;
//! }
//!
//! // ...read the archive's metadata...
//! let title = archive.metadata("Title")?;
//! # let _ = title;
//!
//! // ...or read out everything, as fast as the clusters decompress.
//! for entry in archive.articles()? {
//!     let entry = entry?;
//!     println!("{}: {} bytes", entry.article.url, entry.blob.len());
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! A ZIM archive is a header, a few pointer tables, a list of directory
//! entries sorted by URL, and a list of _clusters_. Each cluster is
//! compressed on its own (XZ or Zstandard, usually) and holds many _blobs_:
//! the actual pages, images, and metadata values.
//! Pointer tables are loaded when the archive is opened, so finding an entry
//! is a binary search in memory plus one seek per probe.
//! Decoded clusters are cached, since neighboring pages tend to share them.
//!
//! Readers hold a seek position, so they're used from one thread at a time.
//! [`ZimArchive::fork()`] makes more of them over the same file,
//! sharing everything read at open time.
//!
//! [`ZimArchive::fork()`]: read/struct.ZimArchive.html#method.fork

pub mod cluster;
pub mod index;
pub mod read;
pub mod result;
pub mod source;

pub use cluster::{Cluster, Compression, Decompressors, StandardDecompressors};
pub use format::Header;
pub use read::{
    ArchiveOptions, ArticleBlobEntry, ArticleEntry, DirectoryEntry, RedirectEntry, ZimArchive,
};
pub use result::{ZimError, ZimResult};

mod arch;
mod format;
