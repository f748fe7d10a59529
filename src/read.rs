//! Tools for reading a ZIM archive.
//!
//! To start reading an archive, first create a [`ZimArchive`] from the file.
//!
//! Entries can be found two ways: by _ordinal_, their position in the
//! title-sorted index, or by _URL index_, their position in the URL-sorted one.
//! Redirects and the header's main page use URL indexes.
//!
//! [`ZimArchive`]: struct.ZimArchive.html

use std::collections::BTreeMap;
use std::fs::File;
use std::io::prelude::*;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;

use camino::{Utf8Component, Utf8PathBuf};
use chrono::NaiveDate;
use log::*;

use crate::cluster::*;
use crate::format::{self, Header, HEADER_SIZE, REDIRECT_MIME};
use crate::index::IndexTables;
use crate::result::*;
use crate::source::ByteSource;

/// Metadata keys defined for the `M` namespace
pub const METADATA_KEYS: &[&str] = &[
    "Name",
    "Title",
    "Creator",
    "Publisher",
    "Date",
    "Description",
    "LongDescription",
    "Language",
    "License",
    "Tags",
    "Relation",
    "Flavour",
    "Source",
    "Counter",
    "Scraper",
];

/// How many redirects we follow before deciding we're going in circles
pub const MAX_REDIRECT_HOPS: usize = 10;

/// A directory entry pointing at a blob of content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArticleEntry {
    /// Position in title order
    pub ordinal: u32,
    /// Position in URL order
    pub url_index: u32,
    /// Index into the archive's MIME type list
    pub mime_type: u16,
    pub namespace: char,
    pub url: String,
    /// The entry's title, or its URL if it has none
    pub title: String,
    /// The cluster holding the content
    pub cluster: u32,
    /// The content's blob within that cluster
    pub blob: u32,
}

/// A directory entry pointing at another entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectEntry {
    /// Position in title order
    pub ordinal: u32,
    /// Position in URL order
    pub url_index: u32,
    pub namespace: char,
    pub url: String,
    /// The entry's title, or its URL if it has none
    pub title: String,
    /// URL index of the entry redirected to
    pub target: u32,
}

/// An article or a redirect
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryEntry {
    Article(ArticleEntry),
    Redirect(RedirectEntry),
}

impl DirectoryEntry {
    pub fn ordinal(&self) -> u32 {
        match self {
            DirectoryEntry::Article(a) => a.ordinal,
            DirectoryEntry::Redirect(r) => r.ordinal,
        }
    }

    pub fn url_index(&self) -> u32 {
        match self {
            DirectoryEntry::Article(a) => a.url_index,
            DirectoryEntry::Redirect(r) => r.url_index,
        }
    }

    pub fn namespace(&self) -> char {
        match self {
            DirectoryEntry::Article(a) => a.namespace,
            DirectoryEntry::Redirect(r) => r.namespace,
        }
    }

    pub fn url(&self) -> &str {
        match self {
            DirectoryEntry::Article(a) => &a.url,
            DirectoryEntry::Redirect(r) => &r.url,
        }
    }

    pub fn title(&self) -> &str {
        match self {
            DirectoryEntry::Article(a) => &a.title,
            DirectoryEntry::Redirect(r) => &r.title,
        }
    }

    /// The raw MIME type code: an index into the MIME type list for articles,
    /// 0xffff for redirects.
    pub fn mime_type(&self) -> u16 {
        match self {
            DirectoryEntry::Article(a) => a.mime_type,
            DirectoryEntry::Redirect(_) => REDIRECT_MIME,
        }
    }

    /// `"{namespace}/{title}"`, the key the title index is sorted by
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace(), self.title())
    }

    pub fn as_article(&self) -> Option<&ArticleEntry> {
        match self {
            DirectoryEntry::Article(a) => Some(a),
            DirectoryEntry::Redirect(_) => None,
        }
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self, DirectoryEntry::Redirect(_))
    }
}

impl ArticleEntry {
    /// A relative path for extracting the article: `{namespace}/{url}`.
    ///
    /// URLs come from the archive, so revolt over anything that would
    /// escape the directory we're extracting into.
    pub fn relative_path(&self) -> ZimResult<Utf8PathBuf> {
        let path = Utf8PathBuf::from(format!("{}/{}", self.namespace, self.url));
        for component in path.components() {
            match component {
                Utf8Component::Normal(_) => {}
                Utf8Component::CurDir => {
                    warn!("Current dir (.) found in path {path}");
                    // Huh. Keep going.
                }
                Utf8Component::Prefix(prefix) => {
                    return Err(ZimError::InvalidPath(format!(
                        "Prefix {} found in path {path}",
                        prefix.as_str()
                    )));
                }
                Utf8Component::RootDir => {
                    return Err(ZimError::InvalidPath(format!(
                        "Root directory found in path {path}"
                    )));
                }
                Utf8Component::ParentDir => {
                    return Err(ZimError::InvalidPath(format!(
                        "Parent dir (..) found in path {path}"
                    )));
                }
            }
        }
        Ok(path)
    }
}

/// An article and its content, as produced by [`ZimArchive::articles()`]
///
/// [`ZimArchive::articles()`]: struct.ZimArchive.html#method.articles
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArticleBlobEntry {
    pub article: ArticleEntry,
    pub blob: Vec<u8>,
}

/// Knobs for a [`ZimArchive`](struct.ZimArchive.html)
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ArchiveOptions {
    /// How many decoded clusters to keep around
    pub cluster_cache_size: NonZeroUsize,
    /// Memory limit for the XZ decoder in bytes (used by `StandardDecompressors`).
    /// Unlimited by default; decoding a dictionary of N bytes needs a bit more than N.
    pub xz_memory_limit: u64,
    /// How many redirects to follow before giving up
    pub max_redirect_hops: usize,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            cluster_cache_size: NonZeroUsize::new(DEFAULT_CLUSTER_CACHE_SIZE)
                .expect("nonzero cache size"),
            xz_memory_limit: DEFAULT_XZ_MEMORY_LIMIT,
            max_redirect_hops: MAX_REDIRECT_HOPS,
        }
    }
}

/// A ZIM archive to be read
///
/// Every lookup seeks the underlying source, so reads take `&mut self`.
/// To read from several threads, [`fork()`](#method.fork) a reader per thread;
/// they share the (immutable) header and index tables.
pub struct ZimArchive<R, D = StandardDecompressors> {
    source: ByteSource<R>,
    header: Arc<Header>,
    mime_types: Arc<[String]>,
    index: Arc<IndexTables>,
    cache: ClusterCache,
    decompressors: D,
    options: ArchiveOptions,
    /// Every article, sorted by (cluster, blob), once someone iterates.
    articles: Option<Arc<[ArticleEntry]>>,
}

impl ZimArchive<File> {
    /// Opens the ZIM archive at the given path.
    ///
    /// ```no_run
    /// # use zimr::*;
    /// let mut archive = ZimArchive::open("wikipedia_en_all.zim")?;
    /// let main = archive.main_entry()?;
    /// let html = archive.article_data(&main)?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn open<P: AsRef<Path>>(path: P) -> ZimResult<Self> {
        Self::open_with(path, ArchiveOptions::default())
    }

    pub fn open_with<P: AsRef<Path>>(path: P, options: ArchiveOptions) -> ZimResult<Self> {
        let file = File::open(path)?;
        Self::with_options(file, options)
    }
}

impl<R: Read + Seek> ZimArchive<R> {
    /// Reads a ZIM archive from any seekable source.
    /// Smaller archives can be read into a buffer,
    /// larger ones memory mapped!
    ///
    /// ```no_run
    /// # use std::fs::File;
    /// # use std::io::Cursor;
    /// # use memmap2::Mmap;
    /// # use zimr::*;
    /// let zim_file = File::open("foo.zim")?;
    /// let mapping = unsafe { Mmap::map(&zim_file)? };
    /// let archive = ZimArchive::new(Cursor::new(mapping))?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn new(source: R) -> ZimResult<Self> {
        Self::with_options(source, ArchiveOptions::default())
    }

    pub fn with_options(source: R, options: ArchiveOptions) -> ZimResult<Self> {
        let decompressors = StandardDecompressors {
            xz_memory_limit: options.xz_memory_limit,
        };
        Self::with_decompressors(source, options, decompressors)
    }
}

impl<R: Read + Seek, D: Decompressors> ZimArchive<R, D> {
    /// Reads a ZIM archive, decompressing clusters with the given `Decompressors`.
    pub fn with_decompressors(
        source: R,
        options: ArchiveOptions,
        decompressors: D,
    ) -> ZimResult<Self> {
        let mut source = ByteSource::new(source)?;
        if source.len() < HEADER_SIZE as u64 {
            return Err(ZimError::InvalidArchive("Too small for a ZIM header"));
        }

        let mut header_bytes = [0; HEADER_SIZE];
        source.seek(0)?;
        Read::read_exact(&mut source, &mut header_bytes)?;
        let header = Header::parse(&header_bytes)?;
        trace!("{:?}", header);
        header.check_bounds(source.len())?;

        let mime_types = format::read_mime_types(&mut source, header.mime_list_pos)?;
        let index = IndexTables::load(&mut source, &header)?;
        info!(
            "Opened ZIM v{}.{} with {} entries in {} clusters",
            header.major_version, header.minor_version, header.entry_count, header.cluster_count
        );

        Ok(Self {
            source,
            header: Arc::new(header),
            mime_types: mime_types.into(),
            index: Arc::new(index),
            cache: ClusterCache::new(options.cluster_cache_size),
            decompressors,
            options,
            articles: None,
        })
    }

    /// Makes another reader over a second handle to the same archive,
    /// sharing this one's header and index tables but with its own cache.
    ///
    /// ```no_run
    /// # use std::fs::File;
    /// # use zimr::*;
    /// let archive = ZimArchive::open("foo.zim")?;
    /// let mut other = archive.fork(File::open("foo.zim")?)?;
    /// std::thread::spawn(move || other.main_entry());
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn fork<S: Read + Seek>(&self, source: S) -> ZimResult<ZimArchive<S, D>>
    where
        D: Clone,
    {
        let source = ByteSource::new(source)?;
        if source.len() != self.source.len() {
            return Err(ZimError::InvalidArchive(
                "Forked source isn't the same size as the archive",
            ));
        }
        Ok(ZimArchive {
            source,
            header: self.header.clone(),
            mime_types: self.mime_types.clone(),
            index: self.index.clone(),
            cache: ClusterCache::new(self.options.cluster_cache_size),
            decompressors: self.decompressors.clone(),
            options: self.options,
            articles: self.articles.clone(),
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn options(&self) -> &ArchiveOptions {
        &self.options
    }

    pub fn entry_count(&self) -> u32 {
        self.index.entry_count()
    }

    pub fn cluster_count(&self) -> u32 {
        self.index.cluster_count()
    }

    /// Size of the archive in bytes
    pub fn file_size(&self) -> u64 {
        self.source.len()
    }

    pub fn mime_types(&self) -> &[String] {
        &self.mime_types
    }

    /// Looks up an article's MIME type code.
    pub fn mime_type(&self, code: u16) -> Option<&str> {
        self.mime_types.get(code as usize).map(String::as_str)
    }

    /// Returns the entry at the given position in title order.
    pub fn entry_at(&mut self, ordinal: u32) -> ZimResult<DirectoryEntry> {
        let url_index = self.index.title_pointer(ordinal)?;
        self.read_entry(ordinal, url_index)
    }

    /// Returns the entry at the given position in URL order.
    pub fn entry_at_url_index(&mut self, url_index: u32) -> ZimResult<DirectoryEntry> {
        let ordinal = self.index.title_ordinal(url_index)?;
        self.read_entry(ordinal, url_index)
    }

    fn read_entry(&mut self, ordinal: u32, url_index: u32) -> ZimResult<DirectoryEntry> {
        let entry_pos = self.index.url_pointer(url_index)?;
        self.source.seek(entry_pos)?;
        let entry = DirectoryEntry::parse(&mut self.source, ordinal, url_index)?;
        trace!("{:?}", entry);
        Ok(entry)
    }

    /// Finds an entry by namespace and title.
    ///
    /// If no title matches, falls back to [`entry_by_url()`](#method.entry_by_url),
    /// so pages can be found by path too.
    pub fn entry_by_key(
        &mut self,
        namespace: char,
        name: &str,
    ) -> ZimResult<Option<DirectoryEntry>> {
        if let Some(entry) = self.search(namespace, name, SortOrder::Title)? {
            return Ok(Some(entry));
        }
        self.entry_by_url(namespace, name)
    }

    /// Finds an entry by namespace and URL.
    pub fn entry_by_url(&mut self, namespace: char, url: &str) -> ZimResult<Option<DirectoryEntry>> {
        self.search(namespace, url, SortOrder::Url)
    }

    /// Binary search through one of the indexes for an exact match.
    fn search(
        &mut self,
        namespace: char,
        name: &str,
        order: SortOrder,
    ) -> ZimResult<Option<DirectoryEntry>> {
        // The index is sorted by "{namespace}/{title or url}", byte-wise.
        // Since namespace is a single character, comparing tuples is the same thing.
        let wanted = (namespace, name);
        let mut beg = 0u32;
        let mut end = self.entry_count();
        while beg < end {
            let mid = beg + (end - beg) / 2;
            let entry = match order {
                SortOrder::Title => self.entry_at(mid)?,
                SortOrder::Url => self.entry_at_url_index(mid)?,
            };
            let found = match order {
                SortOrder::Title => (entry.namespace(), entry.title()),
                SortOrder::Url => (entry.namespace(), entry.url()),
            };
            match found.cmp(&wanted) {
                std::cmp::Ordering::Less => beg = mid + 1,
                std::cmp::Ordering::Greater => end = mid,
                std::cmp::Ordering::Equal => return Ok(Some(entry)),
            }
        }
        Ok(None)
    }

    /// Follows redirects until we land on an article.
    pub fn resolve(&mut self, entry: DirectoryEntry) -> ZimResult<ArticleEntry> {
        let start = entry.url_index();
        let mut entry = entry;
        let mut hops = 0;
        loop {
            match entry {
                DirectoryEntry::Article(article) => return Ok(article),
                DirectoryEntry::Redirect(redirect) => {
                    if hops == self.options.max_redirect_hops {
                        return Err(ZimError::RedirectLoop {
                            url_index: start,
                            hops,
                        });
                    }
                    hops += 1;
                    debug!("Following redirect {} -> {}", redirect.url, redirect.target);
                    entry = self.entry_at_url_index(redirect.target)?;
                }
            }
        }
    }

    /// Returns the archive's main page.
    ///
    /// Many archives declare a main page that isn't HTML (or none at all).
    /// Since we'd like something worth showing, fall back to the first
    /// HTML article in the `A` or `C` namespace that doesn't look like an error page.
    pub fn main_entry(&mut self) -> ZimResult<DirectoryEntry> {
        let declared = match self.header.main_page() {
            Some(url_index) => {
                let entry = self.entry_at_url_index(url_index)?;
                Some(self.resolve(entry)?)
            }
            None => None,
        };
        if let Some(main) = &declared {
            if self.mime_type(main.mime_type) == Some("text/html") {
                return Ok(DirectoryEntry::Article(main.clone()));
            }
            debug!("Main page {} isn't HTML, looking for one that is", main.url);
        }

        for ordinal in 0..self.entry_count() {
            if let DirectoryEntry::Article(article) = self.entry_at(ordinal)? {
                if self.mime_type(article.mime_type) == Some("text/html")
                    && looks_like_main_page(&article)
                {
                    return Ok(DirectoryEntry::Article(article));
                }
            }
        }
        declared
            .map(DirectoryEntry::Article)
            .ok_or(ZimError::NoMainEntry)
    }

    /// Looks up a metadata value (`M` namespace), like "Title" or "Language".
    ///
    /// Returns `None` if the key isn't present. An empty value is `Some("")`.
    pub fn metadata(&mut self, key: &str) -> ZimResult<Option<String>> {
        match self.entry_by_key('M', key)? {
            None => Ok(None),
            Some(DirectoryEntry::Redirect(_)) => {
                Err(ZimError::InvalidArchive("Metadata entry is a redirect"))
            }
            Some(DirectoryEntry::Article(article)) => {
                let value = self.blob(article.cluster, article.blob)?;
                Ok(Some(std::str::from_utf8(&value)?.to_owned()))
            }
        }
    }

    /// All the [`METADATA_KEYS`](constant.METADATA_KEYS.html) present in the archive
    pub fn all_metadata(&mut self) -> ZimResult<BTreeMap<&'static str, String>> {
        let mut all = BTreeMap::new();
        for key in METADATA_KEYS {
            if let Some(value) = self.metadata(key)? {
                all.insert(*key, value);
            }
        }
        Ok(all)
    }

    /// The archive's creation date, from the `Date` metadata (`YYYY-MM-DD`)
    pub fn date(&mut self) -> ZimResult<Option<NaiveDate>> {
        Ok(self.metadata("Date")?.and_then(|date| {
            NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d")
                .map_err(|e| warn!("Couldn't parse Date metadata {:?}: {}", date, e))
                .ok()
        }))
    }

    /// Reads just the URL of the entry at the given URL index.
    pub fn url_at_url_index(&mut self, url_index: u32) -> ZimResult<String> {
        let entry_pos = self.index.url_pointer(url_index)?;
        format::read_entry_url(&mut self.source, entry_pos)
    }

    /// Reads just the URL of the entry at the given title ordinal.
    pub fn url_at(&mut self, ordinal: u32) -> ZimResult<String> {
        let url_index = self.index.title_pointer(ordinal)?;
        self.url_at_url_index(url_index)
    }

    /// Returns the given cluster, decoding it if it isn't cached.
    pub fn cluster(&mut self, number: u32) -> ZimResult<Arc<Cluster>> {
        if let Some(cluster) = self.cache.get(number) {
            debug!("Cluster {} cache hit", number);
            return Ok(cluster);
        }
        let cluster = Arc::new(self.decode_cluster(number)?);
        self.cache.insert(cluster.clone());
        Ok(cluster)
    }

    fn decode_cluster(&mut self, number: u32) -> ZimResult<Cluster> {
        let cluster_pos = self.index.cluster_pointer(number)?;
        self.source.seek(cluster_pos)?;
        Cluster::read(number, &mut self.source, &self.decompressors)
    }

    /// Returns a copy of the given blob.
    pub fn blob(&mut self, cluster: u32, blob: u32) -> ZimResult<Vec<u8>> {
        Ok(self.cluster(cluster)?.blob(blob)?.to_vec())
    }

    /// Reads an article's content. Redirects have none, and give `None`.
    pub fn article_data(&mut self, entry: &DirectoryEntry) -> ZimResult<Option<Vec<u8>>> {
        match entry {
            DirectoryEntry::Article(article) => self.blob(article.cluster, article.blob).map(Some),
            DirectoryEntry::Redirect(_) => Ok(None),
        }
    }

    /// Iterates over every article and its content, in cluster order.
    ///
    /// Reading articles one by one decompresses a cluster for each of them
    /// (cache permitting). Walking clusters in order instead decompresses
    /// each exactly once, which is the fastest way through a whole archive.
    /// The first call reads every directory entry to build the walk;
    /// later calls reuse it.
    pub fn articles(&mut self) -> ZimResult<ClusterOrderArticles<'_, R, D>> {
        let articles = match &self.articles {
            Some(articles) => articles.clone(),
            None => {
                let mut articles = Vec::new();
                for ordinal in 0..self.entry_count() {
                    if let DirectoryEntry::Article(article) = self.entry_at(ordinal)? {
                        articles.push(article);
                    }
                }
                // Stable, so articles sharing a blob stay in title order.
                articles.sort_by_key(|a| (a.cluster, a.blob));
                debug!("Indexed {} articles by cluster", articles.len());
                let articles: Arc<[ArticleEntry]> = articles.into();
                self.articles = Some(articles.clone());
                articles
            }
        };
        Ok(ClusterOrderArticles {
            archive: self,
            articles,
            next: 0,
            current: None,
        })
    }

    /// How many decoded clusters are cached
    pub fn cached_clusters(&self) -> usize {
        self.cache.len()
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear()
    }

    /// Closes the archive, giving back its source.
    pub fn into_inner(self) -> R {
        self.source.into_inner()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum SortOrder {
    Title,
    Url,
}

/// Filters out the 404 and redirect pages some scrapers leave behind.
fn looks_like_main_page(article: &ArticleEntry) -> bool {
    (article.namespace == 'A' || article.namespace == 'C')
        && !article.url.contains("404")
        && !article.title.contains("404")
        && !article.title.contains("301")
}

/// Iterates over all articles in cluster order.
/// See [`ZimArchive::articles()`](struct.ZimArchive.html#method.articles)
pub struct ClusterOrderArticles<'a, R, D> {
    archive: &'a mut ZimArchive<R, D>,
    articles: Arc<[ArticleEntry]>,
    next: usize,
    /// The cluster we're walking through; dropped once we move past it.
    current: Option<Cluster>,
}

impl<R: Read + Seek, D: Decompressors> Iterator for ClusterOrderArticles<'_, R, D> {
    type Item = ZimResult<ArticleBlobEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        let article = self.articles.get(self.next)?.clone();
        self.next += 1;

        if self.current.as_ref().map(Cluster::number) != Some(article.cluster) {
            self.current = None;
            match self.archive.decode_cluster(article.cluster) {
                Ok(cluster) => self.current = Some(cluster),
                Err(e) => {
                    // Don't retry the same broken cluster for each of its articles.
                    while self
                        .articles
                        .get(self.next)
                        .map_or(false, |a| a.cluster == article.cluster)
                    {
                        self.next += 1;
                    }
                    return Some(Err(e));
                }
            }
        }

        let cluster = self.current.as_ref().expect("cluster was just decoded");
        Some(cluster.blob(article.blob).map(|blob| ArticleBlobEntry {
            blob: blob.to_vec(),
            article,
        }))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.articles.len() - self.next;
        (remaining.min(1), Some(remaining))
    }
}
