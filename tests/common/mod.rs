//! Builds small ZIM archives in memory for the integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use zimr::*;

const MAGIC: u32 = 0x044D_495A;
const NO_PAGE: u32 = u32::MAX;

enum Target {
    Blob { cluster: u32, blob: u32 },
    Redirect { namespace: char, url: String },
}

struct Entry {
    namespace: char,
    url: String,
    title: String,
    mime_type: u16,
    target: Target,
}

impl Entry {
    fn url_key(&self) -> (char, &str) {
        (self.namespace, self.url.as_str())
    }

    fn title_key(&self) -> (char, &str) {
        let title = if self.title.is_empty() {
            self.url.as_str()
        } else {
            self.title.as_str()
        };
        (self.namespace, title)
    }
}

#[derive(Default)]
pub struct ArchiveBuilder {
    mime_types: Vec<String>,
    entries: Vec<Entry>,
    clusters: Vec<Vec<u8>>,
    main_page: Option<(char, String)>,
}

impl ArchiveBuilder {
    pub fn new() -> Self {
        Self {
            mime_types: vec!["text/html".to_owned(), "text/plain".to_owned()],
            ..Default::default()
        }
    }

    pub fn mime_types(mut self, mime_types: &[&str]) -> Self {
        self.mime_types = mime_types.iter().map(|m| m.to_string()).collect();
        self
    }

    /// Adds a cluster with the given compression byte, returning its number.
    pub fn cluster(&mut self, code: u8, blobs: &[&[u8]]) -> u32 {
        self.clusters.push(encode_cluster(code, blobs));
        self.clusters.len() as u32 - 1
    }

    pub fn article(
        &mut self,
        namespace: char,
        url: &str,
        title: &str,
        mime_type: u16,
        cluster: u32,
        blob: u32,
    ) -> &mut Self {
        self.entries.push(Entry {
            namespace,
            url: url.to_owned(),
            title: title.to_owned(),
            mime_type,
            target: Target::Blob { cluster, blob },
        });
        self
    }

    pub fn redirect(
        &mut self,
        namespace: char,
        url: &str,
        title: &str,
        target_namespace: char,
        target_url: &str,
    ) -> &mut Self {
        self.entries.push(Entry {
            namespace,
            url: url.to_owned(),
            title: title.to_owned(),
            mime_type: 0xffff,
            target: Target::Redirect {
                namespace: target_namespace,
                url: target_url.to_owned(),
            },
        });
        self
    }

    pub fn main_page(&mut self, namespace: char, url: &str) -> &mut Self {
        self.main_page = Some((namespace, url.to_owned()));
        self
    }

    pub fn build(&mut self) -> Vec<u8> {
        self.entries.sort_by(|a, b| a.url_key().cmp(&b.url_key()));
        let url_indexes: BTreeMap<(char, String), u32> = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| ((e.namespace, e.url.clone()), i as u32))
            .collect();
        let url_index = |namespace: char, url: &str| -> u32 {
            *url_indexes
                .get(&(namespace, url.to_owned()))
                .unwrap_or_else(|| panic!("No entry {}/{}", namespace, url))
        };

        let mut title_order: Vec<u32> = (0..self.entries.len() as u32).collect();
        title_order.sort_by(|&a, &b| {
            self.entries[a as usize]
                .title_key()
                .cmp(&self.entries[b as usize].title_key())
        });

        let mut mime_list = Vec::new();
        for mime_type in &self.mime_types {
            mime_list.extend_from_slice(mime_type.as_bytes());
            mime_list.push(0);
        }
        mime_list.push(0);

        let dirents: Vec<Vec<u8>> = self
            .entries
            .iter()
            .map(|e| {
                let mut d = Vec::new();
                d.extend_from_slice(&e.mime_type.to_le_bytes());
                d.push(0); // parameter length
                d.push(e.namespace as u8);
                d.extend_from_slice(&0u32.to_le_bytes()); // revision
                match &e.target {
                    Target::Blob { cluster, blob } => {
                        d.extend_from_slice(&cluster.to_le_bytes());
                        d.extend_from_slice(&blob.to_le_bytes());
                    }
                    Target::Redirect { namespace, url } => {
                        d.extend_from_slice(&url_index(*namespace, url).to_le_bytes());
                    }
                }
                d.extend_from_slice(e.url.as_bytes());
                d.push(0);
                d.extend_from_slice(e.title.as_bytes());
                d.push(0);
                d
            })
            .collect();

        let entry_count = self.entries.len() as u64;
        let cluster_count = self.clusters.len() as u64;
        let mime_list_pos = 80u64;
        let url_ptr_pos = mime_list_pos + mime_list.len() as u64;
        let title_ptr_pos = url_ptr_pos + entry_count * 8;
        let cluster_ptr_pos = title_ptr_pos + entry_count * 4;
        let dirents_pos = cluster_ptr_pos + cluster_count * 8;
        let clusters_pos = dirents_pos + dirents.iter().map(|d| d.len() as u64).sum::<u64>();
        let checksum_pos =
            clusters_pos + self.clusters.iter().map(|c| c.len() as u64).sum::<u64>();

        let main_page = self
            .main_page
            .as_ref()
            .map_or(NO_PAGE, |(ns, url)| url_index(*ns, url));

        let mut zim = Vec::new();
        zim.extend_from_slice(&MAGIC.to_le_bytes());
        zim.extend_from_slice(&6u16.to_le_bytes());
        zim.extend_from_slice(&1u16.to_le_bytes());
        zim.extend_from_slice(&[0x5a; 16]);
        zim.extend_from_slice(&(entry_count as u32).to_le_bytes());
        zim.extend_from_slice(&(cluster_count as u32).to_le_bytes());
        zim.extend_from_slice(&url_ptr_pos.to_le_bytes());
        zim.extend_from_slice(&title_ptr_pos.to_le_bytes());
        zim.extend_from_slice(&cluster_ptr_pos.to_le_bytes());
        zim.extend_from_slice(&mime_list_pos.to_le_bytes());
        zim.extend_from_slice(&main_page.to_le_bytes());
        zim.extend_from_slice(&NO_PAGE.to_le_bytes());
        zim.extend_from_slice(&checksum_pos.to_le_bytes());
        assert_eq!(zim.len(), 80);

        zim.extend_from_slice(&mime_list);

        let mut pos = dirents_pos;
        for d in &dirents {
            zim.extend_from_slice(&pos.to_le_bytes());
            pos += d.len() as u64;
        }
        for i in &title_order {
            zim.extend_from_slice(&i.to_le_bytes());
        }
        let mut pos = clusters_pos;
        for c in &self.clusters {
            zim.extend_from_slice(&pos.to_le_bytes());
            pos += c.len() as u64;
        }
        for d in &dirents {
            zim.extend_from_slice(d);
        }
        for c in &self.clusters {
            zim.extend_from_slice(c);
        }
        assert_eq!(zim.len() as u64, checksum_pos);
        // We don't check it, but real archives end with an MD5.
        zim.extend_from_slice(&[0; 16]);
        zim
    }
}

/// Encodes a cluster: compression byte, then the (maybe compressed) offsets and blobs.
pub fn encode_cluster(code: u8, blobs: &[&[u8]]) -> Vec<u8> {
    let extended = matches!(code, 8 | 9 | 12 | 13 | 0x10 | 0x11 | 0x14 | 0x15);
    let width = if extended { 8 } else { 4 };

    let mut stream = Vec::new();
    let mut offset = (blobs.len() as u64 + 1) * width;
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

    let mut cluster = vec![code];
    match code {
        4 | 12 | 0x14 => {
            let mut encoder = xz2::write::XzEncoder::new(&mut cluster, 6);
            encoder.write_all(&stream).unwrap();
            encoder.finish().unwrap();
        }
        5 | 13 | 0x15 => {
            cluster.extend_from_slice(&zstd::encode_all(stream.as_slice(), 3).unwrap());
        }
        _ => cluster.extend_from_slice(&stream),
    }
    cluster
}

/// The archive from the reader's basic scenario:
/// one article, one redirect to it, one cluster.
pub fn hello_archive() -> Vec<u8> {
    let mut builder = ArchiveBuilder::new();
    let cluster = builder.cluster(1, &[b"<h1>Hello!</h1>"]);
    builder
        .article('A', "hello", "Hello", 0, cluster, 0)
        .redirect('A', "alias", "", 'A', "hello");
    builder.build()
}

/// Counts how many times a cluster gets decompressed.
#[derive(Clone, Default)]
pub struct CountingDecompressors {
    inner: StandardDecompressors,
    pub calls: Arc<AtomicUsize>,
}

impl CountingDecompressors {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Decompressors for CountingDecompressors {
    fn decoder<'a>(
        &self,
        compression: Compression,
        input: &'a mut dyn BufRead,
    ) -> ZimResult<Box<dyn Read + 'a>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.decoder(compression, input)
    }
}
