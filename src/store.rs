//! Digest → path index backed by an append-only JSON-lines log.
//!
//! The log under `<root>/.smart-save/index.jsonl` is the durable record; the
//! in-memory map is rebuilt from it at open and reconciled against the files
//! actually present in the tree.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::allocator::ResolvedPath;
use crate::codec::{ImageFormat, SIDECAR_SUFFIX};
use crate::digest::{ContentDigest, DigestAlgorithm};
use crate::error::{SaveError, SaveResult};
use crate::writer::{is_temp_name, Durability};

pub const INDEX_DIR: &str = ".smart-save";
pub const INDEX_FILE: &str = "index.jsonl";

/// One line of the index log. Unknown fields are ignored when reading, so
/// newer writers can add fields without breaking older readers.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexRecord {
    digest: ContentDigest,
    /// Relative to the root, `/`-separated.
    path: String,
    size: u64,
    ts: DateTime<Utc>,
    /// The name was requested but the content was not written there.
    #[serde(default, skip_serializing_if = "is_false")]
    alias: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedPath {
    /// Relative to the store root.
    pub path: PathBuf,
    pub size: u64,
    /// A name that resolves to the content without a file of its own.
    pub alias: bool,
}

/// All the names a piece of content has been saved under.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub digest: ContentDigest,
    pub paths: Vec<IndexedPath>,
    /// When the digest was first recorded.
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct IndexState {
    entries: HashMap<ContentDigest, IndexEntry>,
    by_path: HashMap<PathBuf, ContentDigest>,
}

impl IndexState {
    fn insert(&mut self, digest: ContentDigest, path: PathBuf, size: u64, alias: bool, ts: DateTime<Utc>) {
        // A name belongs to exactly one digest; a newer record for the same
        // name supersedes the old one.
        if let Some(previous) = self.by_path.insert(path.clone(), digest.clone()) {
            if let Some(entry) = self.entries.get_mut(&previous) {
                entry.paths.retain(|p| p.path != path);
            }
        }
        let entry = self.entries.entry(digest.clone()).or_insert_with(|| IndexEntry {
            digest,
            paths: Vec::new(),
            created_at: ts,
        });
        entry.paths.push(IndexedPath { path, size, alias });
    }
}

#[derive(Debug)]
pub struct ContentStore {
    root: PathBuf,
    algorithm: DigestAlgorithm,
    durability: Durability,
    log_path: PathBuf,
    log: Mutex<File>,
    state: RwLock<IndexState>,
}

impl ContentStore {
    /// Opens (or creates) the index of `root` and replays its log. With
    /// `rescan`, files missing from the log or changed since are hashed and
    /// appended.
    pub fn open(
        root: &Path,
        algorithm: DigestAlgorithm,
        durability: Durability,
        rescan: bool,
    ) -> SaveResult<Self> {
        let index_dir = root.join(INDEX_DIR);
        fs::create_dir_all(&index_dir).map_err(|e| SaveError::write(&index_dir, e))?;
        let log_path = index_dir.join(INDEX_FILE);

        let state = replay(&log_path)?;
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| SaveError::write(&log_path, e))?;

        let store = Self {
            root: root.to_path_buf(),
            algorithm,
            durability,
            log_path,
            log: Mutex::new(log),
            state: RwLock::new(state),
        };
        info!(
            root = %store.root.display(),
            digests = store.len(),
            "opened content index"
        );

        if rescan {
            store.reconcile()?;
        }
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn digest(&self, bytes: &[u8]) -> ContentDigest {
        self.algorithm.digest(bytes)
    }

    /// First live file holding `digest`. Aliases are never returned here.
    pub fn lookup(&self, digest: &ContentDigest) -> Option<ResolvedPath> {
        self.lookup_all(digest).into_iter().next()
    }

    /// Every name holding `digest`: live files first, then aliases. Aliases
    /// are only reported while at least one file still holds the content.
    /// Files that have disappeared are dropped from memory here; the log
    /// keeps them.
    pub fn lookup_all(&self, digest: &ContentDigest) -> Vec<ResolvedPath> {
        let candidates: Vec<IndexedPath> = match self.state.read().entries.get(digest) {
            Some(entry) => entry.paths.clone(),
            None => return Vec::new(),
        };

        let (aliases, files): (Vec<IndexedPath>, Vec<IndexedPath>) =
            candidates.into_iter().partition(|p| p.alias);
        let (mut live, gone): (Vec<IndexedPath>, Vec<IndexedPath>) = files
            .into_iter()
            .partition(|p| self.root.join(&p.path).is_file());

        if !gone.is_empty() {
            let mut state = self.state.write();
            for missing in &gone {
                debug!(path = %missing.path.display(), digest = %digest, "indexed file is gone");
                if state.by_path.get(&missing.path) == Some(digest) {
                    state.by_path.remove(&missing.path);
                }
                if let Some(entry) = state.entries.get_mut(digest) {
                    entry.paths.retain(|p| p.path != missing.path);
                }
            }
        }

        if !live.is_empty() {
            live.extend(aliases);
        }
        live.iter()
            .filter_map(|p| ResolvedPath::from_path(&self.root.join(&p.path)))
            .collect()
    }

    /// Appends `digest → path` to the log, then to the in-memory index.
    pub fn record(&self, digest: &ContentDigest, path: &ResolvedPath, size: u64) -> SaveResult<()> {
        let relative = self.relative(path)?;
        self.append(digest, &relative, size, false, Utc::now())
    }

    /// Records `path` as another name for `digest` without a file behind it.
    /// Used when a duplicate is skipped instead of written.
    pub fn record_alias(&self, digest: &ContentDigest, path: &ResolvedPath, size: u64) -> SaveResult<()> {
        let relative = self.relative(path)?;
        self.append(digest, &relative, size, true, Utc::now())
    }

    fn relative(&self, path: &ResolvedPath) -> SaveResult<PathBuf> {
        let full = path.full_path();
        let relative = full.strip_prefix(&self.root).map_err(|_| {
            SaveError::write(
                &full,
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "path is outside of the store root",
                ),
            )
        })?;
        Ok(relative.to_path_buf())
    }

    fn append(
        &self,
        digest: &ContentDigest,
        relative: &Path,
        size: u64,
        alias: bool,
        ts: DateTime<Utc>,
    ) -> SaveResult<()> {
        let record = IndexRecord {
            digest: digest.clone(),
            path: relative_to_string(relative),
            size,
            ts,
            alias,
        };
        let mut line = serde_json::to_string(&record).map_err(|e| {
            SaveError::write(&self.log_path, std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;
        line.push('\n');

        {
            let mut log = self.log.lock();
            log.write_all(line.as_bytes())
                .and_then(|_| log.flush())
                .map_err(|e| SaveError::write(&self.log_path, e))?;
            let synced = match self.durability {
                Durability::Buffer => Ok(()),
                Durability::Fsync => log.sync_all(),
                Durability::Fdatasync => log.sync_data(),
            };
            synced.map_err(|e| SaveError::write(&self.log_path, e))?;

            self.state
                .write()
                .insert(digest.clone(), relative.to_path_buf(), size, alias, ts);
        }
        debug!(digest = %digest, path = %relative.display(), alias, "recorded index entry");
        Ok(())
    }

    /// Brings the index up to date with the files in the tree: hashes every
    /// image the log does not know about (or knows with another size or
    /// digest algorithm) and removes temp files abandoned by crashed writes.
    /// Returns the number of records appended.
    pub fn reconcile(&self) -> SaveResult<usize> {
        let files = scan_tree(&self.root)?;

        let mut appended = 0;
        for (relative, size) in files {
            let known = {
                let state = self.state.read();
                state.by_path.get(&relative).and_then(|digest| {
                    let entry = state.entries.get(digest)?;
                    entry
                        .paths
                        .iter()
                        .find(|p| p.path == relative)
                        .map(|p| !p.alias && digest.algorithm() == self.algorithm && p.size == size)
                })
            };
            if known == Some(true) {
                continue;
            }

            let full = self.root.join(&relative);
            let file = File::open(&full).map_err(|e| SaveError::read(&full, e))?;
            let digest = self
                .algorithm
                .digest_reader(file)
                .map_err(|e| SaveError::read(&full, e))?;
            self.append(&digest, &relative, size, false, Utc::now())?;
            appended += 1;
        }

        if appended > 0 {
            info!(root = %self.root.display(), appended, "reconciled index with files on disk");
        }
        Ok(appended)
    }

    /// Snapshot of every entry, including ones whose files are gone.
    pub fn entries(&self) -> Vec<IndexEntry> {
        self.state.read().entries.values().cloned().collect()
    }

    /// Number of distinct digests.
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn relative_to_string(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn replay(log_path: &Path) -> SaveResult<IndexState> {
    let mut state = IndexState::default();
    let file = match File::open(log_path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(state),
        Err(e) => return Err(SaveError::read(log_path, e)),
    };

    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| SaveError::read(log_path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<IndexRecord>(&line) {
            Ok(record) => {
                let path = PathBuf::from(&record.path);
                state.insert(record.digest, path, record.size, record.alias, record.ts);
            }
            // A torn last line after a crash, or a record we cannot read.
            Err(e) => warn!(line = lineno + 1, error = %e, "skipping unreadable index record"),
        }
    }
    Ok(state)
}

/// Image files under `root` with their sizes, relative to `root`. Temp
/// files left by interrupted writes are removed on the way.
fn scan_tree(root: &Path) -> SaveResult<Vec<(PathBuf, u64)>> {
    let mut out = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !(e.depth() == 1 && e.file_name() == INDEX_DIR));

    for entry in walker {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(root).to_path_buf();
            SaveError::read(path, e.into())
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let name = entry.file_name().to_string_lossy();

        if is_temp_name(&name) {
            match fs::remove_file(path) {
                Ok(()) => info!(path = %path.display(), "removed abandoned temp file"),
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove temp file"),
            }
            continue;
        }
        if name.ends_with(SIDECAR_SUFFIX) || ImageFormat::from_path(path).is_none() {
            continue;
        }

        let size = entry
            .metadata()
            .map_err(|e| SaveError::read(path, e.into()))?
            .len();
        if let Ok(relative) = path.strip_prefix(root) {
            out.push((relative.to_path_buf(), size));
        }
    }
    Ok(out)
}
