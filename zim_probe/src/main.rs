use std::fs::{self, File};
use std::io::{self, prelude::*, Cursor};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use log::*;
use memmap2::Mmap;
use structopt::*;

use zimr::read::ZimArchive;
use zimr::DirectoryEntry;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "zim_probe",
    about = "Examines a .zim file: its header, metadata, and contents"
)]
struct Opt {
    /// Pass multiple times for additional verbosity (info, debug, trace)
    #[structopt(short, long, parse(from_occurrences))]
    verbosity: usize,

    /// Memory map the archive instead of reading it through a file handle
    #[structopt(short, long)]
    mmap: bool,

    /// List every entry in title order
    #[structopt(short, long)]
    list: bool,

    /// Dump an entry's content (following redirects) to stdout, e.g. A/Main_Page
    #[structopt(short, long, value_name = "NS/NAME")]
    entry: Option<String>,

    /// Extract every article into the given directory, in cluster order
    #[structopt(short = "x", long, value_name = "DIR")]
    extract: Option<PathBuf>,

    #[structopt(name("ZIM file"))]
    zim_path: PathBuf,
}

fn main() -> Result<()> {
    let args = Opt::from_args();

    let mut errlog = stderrlog::new();
    errlog.verbosity(args.verbosity + 1);
    errlog.init()?;

    if args.mmap {
        info!("Memory mapping {:#?}", args.zim_path);
        let zim_file = File::open(&args.zim_path).context("Couldn't open zim file")?;
        let mapping = unsafe { Mmap::map(&zim_file).context("Couldn't mmap zim file")? };
        let archive = ZimArchive::new(Cursor::new(mapping)).context("Couldn't load archive")?;
        probe(archive, &args)
    } else {
        info!("Opening {:#?}", args.zim_path);
        let archive = ZimArchive::open(&args.zim_path).context("Couldn't load archive")?;
        probe(archive, &args)
    }
}

fn probe<R: Read + Seek>(mut archive: ZimArchive<R>, args: &Opt) -> Result<()> {
    if let Some(key) = &args.entry {
        return dump_entry(&mut archive, key);
    }

    print_summary(&mut archive)?;
    if args.list {
        list_entries(&mut archive)?;
    }
    if let Some(dir) = &args.extract {
        extract(&mut archive, dir)?;
    }
    Ok(())
}

fn print_summary<R: Read + Seek>(archive: &mut ZimArchive<R>) -> Result<()> {
    let header = archive.header().clone();
    println!(
        "ZIM v{}.{}, {} bytes",
        header.major_version,
        header.minor_version,
        archive.file_size()
    );
    let uuid: String = header.uuid.iter().map(|b| format!("{:02x}", b)).collect();
    println!("UUID: {}", uuid);
    println!(
        "{} entries in {} clusters",
        header.entry_count, header.cluster_count
    );
    println!("MIME types: {}", archive.mime_types().join(", "));

    for (key, value) in archive.all_metadata()? {
        println!("{}: {}", key, value);
    }

    match archive.main_entry() {
        Ok(main) => println!("Main page: {}", main.key()),
        Err(zimr::ZimError::NoMainEntry) => println!("Main page: none"),
        Err(e) => return Err(e).context("Couldn't find main page"),
    }
    Ok(())
}

fn list_entries<R: Read + Seek>(archive: &mut ZimArchive<R>) -> Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for ordinal in 0..archive.entry_count() {
        let entry = archive
            .entry_at(ordinal)
            .with_context(|| format!("Couldn't read entry {}", ordinal))?;
        match &entry {
            DirectoryEntry::Article(article) => writeln!(
                out,
                "{}/{}\t{}\t{}",
                article.namespace,
                article.url,
                article.title,
                archive.mime_type(article.mime_type).unwrap_or("?")
            )?,
            DirectoryEntry::Redirect(redirect) => writeln!(
                out,
                "{}/{}\t{}\t-> {}",
                redirect.namespace,
                redirect.url,
                redirect.title,
                archive.url_at_url_index(redirect.target)?
            )?,
        }
    }
    Ok(())
}

fn dump_entry<R: Read + Seek>(archive: &mut ZimArchive<R>, key: &str) -> Result<()> {
    let (namespace, name) = parse_key(key)?;
    let entry = archive
        .entry_by_key(namespace, name)?
        .ok_or_else(|| anyhow!("No entry {}", key))?;
    let article = archive
        .resolve(entry)
        .with_context(|| format!("Couldn't resolve {}", key))?;
    let content = archive.blob(article.cluster, article.blob)?;
    io::stdout().write_all(&content)?;
    Ok(())
}

/// Splits "A/Some_Page" into its namespace and name.
fn parse_key(key: &str) -> Result<(char, &str)> {
    let mut chars = key.chars();
    match (chars.next(), chars.next()) {
        (Some(namespace), Some('/')) => Ok((namespace, chars.as_str())),
        _ => bail!("Expected NS/NAME, got {:?}", key),
    }
}

fn extract<R: Read + Seek>(archive: &mut ZimArchive<R>, dir: &Path) -> Result<()> {
    let mut written = 0;
    for entry in archive.articles()? {
        let entry = entry?;
        let path = dir.join(entry.article.relative_path()?);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Couldn't create directory {}", parent.display()))?;
        }
        fs::write(&path, &entry.blob)
            .with_context(|| format!("Couldn't create file {}", path.display()))?;
        written += 1;
    }
    info!("Extracted {} articles to {}", written, dir.display());
    Ok(())
}
