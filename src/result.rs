//! Error types and the related `Result<T>`

use thiserror::Error;

pub type ZimResult<T> = Result<T, ZimError>;

#[derive(Debug, Error)]
pub enum ZimError {
    /// An error from underlying I/O, including truncated reads
    /// and seeks past the end of the archive
    #[error("I/O Error")]
    Io(#[from] std::io::Error),

    /// The ZIM archive contained invalid data per the format.
    #[error("Invalid ZIM archive: {0}")]
    InvalidArchive(&'static str),

    /// Decoding a UTF-8 URL, title, or metadata value failed
    #[error("Invalid UTF-8")]
    Encoding(#[from] std::str::Utf8Error),

    /// The ZIM archive uses an unsupported feature,
    /// like an unknown cluster compression.
    #[error("Unsupported ZIM archive: {0}")]
    UnsupportedArchive(String),

    /// An ordinal, cluster number, or blob number was past the end of its table.
    #[error("{what} {index} out of range (count is {count})")]
    OutOfRange {
        what: &'static str,
        index: u64,
        count: u64,
    },

    /// Following redirects from the given entry didn't reach an article.
    #[error("Redirect chain from URL index {url_index} exceeded {hops} hops")]
    RedirectLoop { url_index: u32, hops: usize },

    /// The archive declares no main page and none could be found.
    #[error("No main entry in the archive")]
    NoMainEntry,

    /// An entry's URL can't be turned into a relative path.
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// A cast from a 64-bit int to a usize failed,
    /// probably on a 32-bit system.
    #[error("ZIM archive too large for address space")]
    InsufficientAddressSpace,
}

impl ZimError {
    pub(crate) fn out_of_range<I: Into<u64>, C: Into<u64>>(
        what: &'static str,
        index: I,
        count: C,
    ) -> Self {
        ZimError::OutOfRange {
            what,
            index: index.into(),
            count: count.into(),
        }
    }
}
