use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::clock::as_millis;
use crate::key::EndpointKey;

use super::CacheEntry;
use super::cache_error::{CacheError, catch_not_found};

/// The on-disk layout version, part of every entry path.
///
/// Bumping this orphans all existing entries; `cleanup` removes them eventually.
pub const DISK_FORMAT_VERSION: u32 = 1;

/// Upper bound for the header line of a cache file.
const MAX_HEADER_SIZE: u64 = 64 * 1024;

/// The first line of every cache file.
#[derive(Debug, Serialize, Deserialize)]
struct EntryHeader {
    /// Metadata of the [`EndpointKey`] this entry belongs to.
    key: String,
    /// Creation time in milliseconds.
    created_at: u64,
    /// Maximum age in milliseconds.
    max_age: u64,
}

impl EntryHeader {
    fn is_fresh(&self, now: u64) -> bool {
        now.saturating_sub(self.created_at) <= self.max_age
    }
}

/// Bookkeeping of all files in the disk tier.
#[derive(Debug, Default)]
struct DiskIndex {
    /// Relative path to `(created_at, size)`.
    entries: HashMap<PathBuf, (u64, u64)>,
    /// All entries ordered oldest first.
    by_age: BTreeSet<(u64, PathBuf)>,
    total_size: u64,
}

impl DiskIndex {
    fn insert(&mut self, path: PathBuf, created_at: u64, size: u64) {
        self.remove(&path);
        self.by_age.insert((created_at, path.clone()));
        self.entries.insert(path, (created_at, size));
        self.total_size += size;
    }

    fn remove(&mut self, path: &Path) -> bool {
        match self.entries.remove(path) {
            Some((created_at, size)) => {
                self.by_age.remove(&(created_at, path.to_owned()));
                self.total_size -= size;
                true
            }
            None => false,
        }
    }

    /// Drops the oldest entries until the total fits into `capacity`.
    ///
    /// `keep` is never chosen as a victim. Returns the evicted paths.
    fn evict_to(&mut self, capacity: u64, keep: Option<&Path>) -> Vec<PathBuf> {
        let mut victims = Vec::new();
        let mut size = self.total_size;
        for (_, path) in &self.by_age {
            if size <= capacity {
                break;
            }
            if Some(path.as_path()) == keep {
                continue;
            }
            size -= self.entries.get(path).map_or(0, |(_, size)| *size);
            victims.push(path.clone());
        }
        for path in &victims {
            self.remove(path);
        }
        victims
    }
}

/// Statistics of a single cleanup run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupStats {
    pub removed_dirs: usize,
    pub removed_files: usize,
    pub removed_bytes: u64,

    pub retained_dirs: usize,
    pub retained_files: usize,
    pub retained_bytes: u64,
}

/// The persistent tier: one file per key, bounded by total size.
///
/// When full, entries with the oldest creation time are evicted first. All file system access
/// in here is blocking.
#[derive(Debug)]
pub struct DiskTier {
    root: PathBuf,
    tmp_dir: PathBuf,
    capacity: u64,
    index: Mutex<DiskIndex>,
}

impl DiskTier {
    /// Opens the tier inside `cache_dir`, indexing all entries left by a previous run.
    ///
    /// Temporary files of interrupted writes are removed, as are files that are not valid
    /// entries.
    pub fn open(cache_dir: &Path, capacity: u64) -> io::Result<Self> {
        let root = cache_dir.join("responses");
        let tmp_dir = cache_dir.join("tmp");

        if tmp_dir.exists() {
            fs::remove_dir_all(&tmp_dir)?;
        }
        fs::create_dir_all(&tmp_dir)?;
        fs::create_dir_all(&root)?;

        let tier = Self {
            root,
            tmp_dir,
            capacity,
            index: Mutex::default(),
        };

        let mut index = DiskIndex::default();
        tier.scan_directory(&tier.root, &mut index)?;
        let evicted = index.evict_to(capacity, None);
        tracing::debug!(
            entries = index.entries.len(),
            bytes = index.total_size,
            "Opened disk cache at `{}`",
            tier.root.display()
        );
        *tier.index.lock().unwrap_or_else(PoisonError::into_inner) = index;
        tier.remove_files(&evicted);

        Ok(tier)
    }

    fn scan_directory(&self, directory: &Path, index: &mut DiskIndex) -> io::Result<()> {
        let Some(entries) = catch_not_found(|| fs::read_dir(directory))? else {
            return Ok(());
        };
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                self.scan_directory(&path, index)?;
                continue;
            }

            let size = match catch_not_found(|| path.metadata())? {
                Some(metadata) => metadata.len(),
                None => continue,
            };
            match read_header(&path) {
                Ok(header) => {
                    if let Ok(relative) = path.strip_prefix(&self.root) {
                        index.insert(relative.to_owned(), header.created_at, size);
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        error = &e as &dyn std::error::Error,
                        path = %path.display(),
                        "Removing unreadable cache file"
                    );
                    catch_not_found(|| fs::remove_file(&path))?;
                }
            }
        }
        Ok(())
    }

    /// Total bytes currently accounted to this tier.
    pub fn size(&self) -> u64 {
        self.lock_index().total_size
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Reads the entry for `key` regardless of its freshness.
    ///
    /// Files that cannot be read as an entry for `key` are removed.
    pub fn load(&self, key: &EndpointKey) -> Result<Option<CacheEntry>, CacheError> {
        let relative = PathBuf::from(key.cache_path(DISK_FORMAT_VERSION));
        let path = self.root.join(&relative);

        let Some(contents) = catch_not_found(|| fs::read(&path))? else {
            self.lock_index().remove(&relative);
            return Ok(None);
        };

        match parse_entry(key, contents) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                self.remove(key)?;
                Err(e)
            }
        }
    }

    /// Writes `entry`, replacing any previous entry of the same key.
    ///
    /// Entries larger than the whole tier are not written. Older entries are evicted to stay
    /// within capacity.
    pub fn store(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        let header = serde_json::to_vec(&EntryHeader {
            key: entry.key.metadata().to_owned(),
            created_at: entry.created_at,
            max_age: as_millis(entry.max_age),
        })?;
        let size = (header.len() + 1 + entry.value.len()) as u64;

        if size > self.capacity {
            tracing::debug!(
                key = %entry.key,
                size,
                capacity = self.capacity,
                "Not persisting entry larger than disk cache"
            );
            self.remove(&entry.key)?;
            return Ok(());
        }

        let mut temp_file = self.tempfile()?;
        temp_file.write_all(&header)?;
        temp_file.write_all(b"\n")?;
        temp_file.write_all(&entry.value)?;
        temp_file.flush()?;

        let relative = PathBuf::from(entry.key.cache_path(DISK_FORMAT_VERSION));

        // Files only appear or disappear together with their index entry.
        let mut index = self.lock_index();
        persist_tempfile(temp_file, &self.root.join(&relative))?;
        index.insert(relative.clone(), entry.created_at, size);
        let evicted = index.evict_to(self.capacity, Some(&relative));
        self.remove_files(&evicted);
        drop(index);

        if !evicted.is_empty() {
            tracing::debug!(count = evicted.len(), "Evicted oldest disk cache entries");
            metric!(counter("caches.disk.evicted") += evicted.len() as i64);
        }

        Ok(())
    }

    /// Removes the entry for `key`, returning whether one existed.
    pub fn remove(&self, key: &EndpointKey) -> Result<bool, CacheError> {
        let relative = PathBuf::from(key.cache_path(DISK_FORMAT_VERSION));
        let mut index = self.lock_index();
        index.remove(&relative);
        let removed = catch_not_found(|| fs::remove_file(self.root.join(&relative)))?;
        Ok(removed.is_some())
    }

    /// Removes all stale and unreadable entries, as well as empty directories.
    ///
    /// If `dry_run` is `true`, no files will actually be deleted.
    pub fn cleanup(&self, now: u64, dry_run: bool) -> anyhow::Result<CleanupStats> {
        tracing::info!("Cleaning up disk cache at `{}`", self.root.display());

        let mut stats = CleanupStats::default();
        self.cleanup_directory_recursive(&self.root, now, &mut stats, dry_run)?;

        tracing::info!(
            "Retained {} directories and {} files, totaling {} bytes",
            stats.retained_dirs,
            stats.retained_files,
            stats.retained_bytes,
        );
        tracing::info!(
            "Removed {} directories and {} files, totaling {} bytes",
            stats.removed_dirs,
            stats.removed_files,
            stats.removed_bytes
        );

        metric!(gauge("caches.size.files") = stats.retained_files as u64);
        metric!(gauge("caches.size.bytes") = stats.retained_bytes);
        metric!(counter("caches.size.files_removed") += stats.removed_files as i64);
        metric!(counter("caches.size.bytes_removed") += stats.removed_bytes as i64);

        Ok(stats)
    }

    /// Cleans up the directory recursively, returning `true` if the directory is left empty after cleanup.
    fn cleanup_directory_recursive(
        &self,
        directory: &Path,
        now: u64,
        stats: &mut CleanupStats,
        dry_run: bool,
    ) -> anyhow::Result<bool> {
        let entries = match catch_not_found(|| fs::read_dir(directory))? {
            Some(x) => x,
            None => {
                tracing::warn!("Directory not found: `{}`", directory.display());
                return Ok(true);
            }
        };
        tracing::debug!("Cleaning directory `{}`", directory.display());

        let mut is_empty = true;
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                let mut dir_is_empty =
                    self.cleanup_directory_recursive(&path, now, stats, dry_run)?;
                if dir_is_empty {
                    tracing::debug!("Removing directory `{}`", path.display());
                    if !dry_run {
                        if let Err(e) = fs::remove_dir(&path) {
                            tracing::error!(
                                error = &e as &dyn std::error::Error,
                                path = %path.display(),
                                "Failed to clean cache directory"
                            );
                            dir_is_empty = false;
                        }
                    }
                }
                if dir_is_empty {
                    stats.removed_dirs += 1;
                } else {
                    stats.retained_dirs += 1;
                }
                is_empty &= dir_is_empty;
            } else {
                match self.try_cleanup_path(&path, now, stats, dry_run) {
                    Err(e) => {
                        tracing::error!(
                            error = &*e as &dyn std::error::Error,
                            path = %path.display(),
                            "Failed to clean cache file"
                        );
                        is_empty = false;
                    }
                    Ok(file_removed) => is_empty &= file_removed,
                }
            }
        }

        Ok(is_empty)
    }

    /// Tries to clean up the file at `path`, returning `true` if it was removed.
    fn try_cleanup_path(
        &self,
        path: &Path,
        now: u64,
        stats: &mut CleanupStats,
        dry_run: bool,
    ) -> anyhow::Result<bool> {
        tracing::trace!("Checking file `{}`", path.display());
        let Some(metadata) = catch_not_found(|| path.metadata())? else {
            return Ok(true);
        };
        anyhow::ensure!(metadata.is_file(), "not a file");
        let size = metadata.len();

        let Some(stale) = is_stale(path, now) else {
            return Ok(true);
        };

        if stale {
            tracing::debug!("Removing file `{}`", path.display());
            if !dry_run {
                let mut index = self.lock_index();
                // a concurrent write may have replaced the file since it was checked
                match is_stale(path, now) {
                    None => return Ok(true),
                    Some(false) => {
                        stats.retained_bytes += size;
                        stats.retained_files += 1;
                        return Ok(false);
                    }
                    Some(true) => {}
                }
                catch_not_found(|| fs::remove_file(path))?;
                if let Ok(relative) = path.strip_prefix(&self.root) {
                    index.remove(relative);
                }
            }

            stats.removed_bytes += size;
            stats.removed_files += 1;

            return Ok(true);
        }
        stats.retained_bytes += size;
        stats.retained_files += 1;

        Ok(false)
    }

    /// Create a new temporary file to use in the cache.
    fn tempfile(&self) -> io::Result<NamedTempFile> {
        // `cleanup` could potentially remove the directory, so retry once after recreating it.
        match tempfile::Builder::new()
            .prefix("tmp")
            .tempfile_in(&self.tmp_dir)
        {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::create_dir_all(&self.tmp_dir)?;
                tempfile::Builder::new()
                    .prefix("tmp")
                    .tempfile_in(&self.tmp_dir)
            }
            Err(e) => Err(e),
        }
    }

    fn remove_files(&self, relative_paths: &[PathBuf]) {
        for relative in relative_paths {
            let path = self.root.join(relative);
            if let Err(e) = catch_not_found(|| fs::remove_file(&path)) {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    path = %path.display(),
                    "Failed to remove evicted cache file"
                );
            }
        }
    }

    fn lock_index(&self) -> std::sync::MutexGuard<'_, DiskIndex> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Whether the file at `path` is stale or unreadable, `None` if it is gone.
fn is_stale(path: &Path, now: u64) -> Option<bool> {
    match read_header(path) {
        Ok(header) => Some(!header.is_fresh(now)),
        Err(CacheError::Io(e)) if e.kind() == io::ErrorKind::NotFound => None,
        Err(_) => Some(true),
    }
}

fn read_header(path: &Path) -> Result<EntryHeader, CacheError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file).take(MAX_HEADER_SIZE);
    let mut line = Vec::new();
    reader.read_until(b'\n', &mut line)?;
    if line.pop() != Some(b'\n') {
        return Err(CacheError::Malformed("missing header line".into()));
    }
    Ok(serde_json::from_slice(&line)?)
}

fn parse_entry(key: &EndpointKey, contents: Vec<u8>) -> Result<CacheEntry, CacheError> {
    let contents = Bytes::from(contents);
    let newline = contents
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| CacheError::Malformed("missing header line".into()))?;
    let header: EntryHeader = serde_json::from_slice(&contents[..newline])?;

    let mut builder = EndpointKey::builder();
    builder
        .write_str(&header.key)
        .map_err(|_| CacheError::Malformed("invalid key metadata".into()))?;
    let stored_key = builder.build();
    if stored_key != *key {
        return Err(CacheError::Malformed(format!(
            "entry belongs to key {stored_key}, expected {key}"
        )));
    }

    Ok(CacheEntry {
        key: stored_key,
        value: contents.slice(newline + 1..),
        created_at: header.created_at,
        max_age: Duration::from_millis(header.max_age),
    })
}

fn persist_tempfile(mut temp_file: NamedTempFile, cache_path: &Path) -> io::Result<File> {
    let parent = cache_path
        .parent()
        .ok_or_else(|| io::Error::other("no parent directory to persist item"))?;

    // `cleanup` could remove the parent directories we are operating in, so retry.
    const MAX_RETRIES: usize = 2;
    let mut retries = 0;
    loop {
        retries += 1;

        if let Err(e) = fs::create_dir_all(parent) {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                path = %parent.display(),
                "Failed to create cache directory"
            );
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match temp_file.persist(cache_path) {
            Ok(file) => return Ok(file),
            Err(e) => {
                temp_file = e.file;
                let err = e.error;
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    path = %cache_path.display(),
                    "Failed to create cache file"
                );
                if retries > MAX_RETRIES {
                    return Err(err);
                }
            }
        }
    }
}
