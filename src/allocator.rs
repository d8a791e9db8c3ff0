use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::codec::{sidecar_path, ImageFormat};
use crate::error::{SaveError, SaveResult};
use crate::template::{ResolveContext, Template, MAX_COMPONENT_LEN};

pub const DEFAULT_MAX_PROBES: u32 = 10_000;
pub const DEFAULT_COUNTER_START: u32 = 1;

/// Counter hints kept per directory before the map is reset.
const MAX_HINTS: usize = 1024;
/// Idle directory states kept before unused ones are dropped.
const MAX_DIRECTORIES: usize = 256;

/// A concrete, absolute destination for one file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolvedPath {
    pub directory: PathBuf,
    pub base_name: String,
    pub extension: String,
}

impl ResolvedPath {
    pub fn file_name(&self) -> String {
        if self.extension.is_empty() {
            self.base_name.clone()
        } else {
            format!("{}.{}", self.base_name, self.extension)
        }
    }

    pub fn full_path(&self) -> PathBuf {
        self.directory.join(self.file_name())
    }

    /// Splits an absolute file path back into its parts.
    pub fn from_path(path: &Path) -> Option<Self> {
        let directory = path.parent()?.to_path_buf();
        let name = path.file_name()?.to_str()?;
        let (base_name, extension) = match name.rsplit_once('.') {
            Some((base, ext)) if !base.is_empty() => (base.to_string(), ext.to_string()),
            _ => (name.to_string(), String::new()),
        };
        Some(Self {
            directory,
            base_name,
            extension,
        })
    }
}

/// Per-directory allocation state: names handed out but not yet written, and
/// where the last probe for each name pattern stopped.
#[derive(Debug, Default)]
struct DirectoryState {
    claimed: HashSet<String>,
    next_counter: HashMap<String, u32>,
}

/// Hands out file names that are unique among the files in a directory and
/// the names other in-flight requests are about to write.
///
/// Probe and claim happen under a per-directory lock; the lock is released
/// before the caller starts writing. Claims are purely in memory and released
/// when the [`Reservation`] is dropped, so an abandoned request leaves nothing
/// behind on disk.
#[derive(Debug)]
pub struct PathAllocator {
    directories: Mutex<HashMap<PathBuf, Arc<Mutex<DirectoryState>>>>,
    counter_start: u32,
    max_probes: u32,
}

impl Default for PathAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_COUNTER_START, DEFAULT_MAX_PROBES)
    }
}

impl PathAllocator {
    pub fn new(counter_start: u32, max_probes: u32) -> Self {
        Self {
            directories: Mutex::new(HashMap::new()),
            counter_start,
            max_probes: max_probes.max(1),
        }
    }

    fn directory_state(&self, directory: &Path) -> Arc<Mutex<DirectoryState>> {
        let mut directories = self.directories.lock();
        if directories.len() >= MAX_DIRECTORIES && !directories.contains_key(directory) {
            // Only the map holds a reference to an idle state, so nothing is
            // claimed in it; dropping it forgets counter hints and nothing else.
            directories.retain(|_, state| Arc::strong_count(state) > 1);
        }
        Arc::clone(directories.entry(directory.to_path_buf()).or_default())
    }

    /// Resolves `template` under `root` and claims the first free name.
    ///
    /// Templates with `%counter%` are re-resolved with increasing counters.
    /// Templates without one first try the bare name, then append
    /// `_<counter>`. For formats that keep provenance in a sidecar, a name
    /// whose sidecar already exists counts as taken.
    pub fn allocate(
        &self,
        root: &Path,
        template: &Template,
        ctx: &ResolveContext<'_>,
        format: ImageFormat,
    ) -> SaveResult<Reservation> {
        let first = template.resolve(ctx, self.counter_start)?;
        let (relative_dir, _) = split_relative(&first);
        let directory = match relative_dir {
            Some(dir) => root.join(dir),
            None => root.to_path_buf(),
        };

        // Resolving with counter 0 gives a stable key for "this template with
        // these values", independent of which counter ends up free.
        let pattern = format!("{}.{}", template.resolve(ctx, 0)?, format.extension());
        let has_counter = template.has_counter();

        let owner = self.directory_state(&directory);
        let mut state = owner.lock();

        let hint = state.next_counter.get(&pattern).copied();
        let mut counter = hint.unwrap_or(self.counter_start).max(self.counter_start);
        let mut bare = !has_counter && hint.is_none();
        let bare_base = if has_counter {
            String::new()
        } else {
            strip_extension(split_relative(&first).1, format).to_string()
        };

        for attempt in 1..=self.max_probes {
            let base_name = if has_counter {
                let resolved = template.resolve(ctx, counter)?;
                strip_extension(split_relative(&resolved).1, format).to_string()
            } else if bare {
                bare_base.clone()
            } else {
                format!("{}_{:0width$}", bare_base, counter, width = ctx.counter_width)
            };
            let candidate = ResolvedPath {
                directory: directory.clone(),
                base_name,
                extension: format.extension().to_string(),
            };
            let file_name = candidate.file_name();
            if file_name.len() > MAX_COMPONENT_LEN {
                return Err(SaveError::invalid_template(
                    template.source(),
                    format!(
                        "file name {:?} is longer than {} bytes",
                        file_name, MAX_COMPONENT_LEN
                    ),
                ));
            }

            let full_path = candidate.full_path();
            let taken = state.claimed.contains(&file_name)
                || full_path.symlink_metadata().is_ok()
                || (!format.embeds_natively() && sidecar_path(&full_path).symlink_metadata().is_ok());
            if !taken {
                state.claimed.insert(file_name.clone());
                let next = if bare { self.counter_start } else { counter.saturating_add(1) };
                if state.next_counter.len() >= MAX_HINTS && !state.next_counter.contains_key(&pattern) {
                    state.next_counter.clear();
                }
                state.next_counter.insert(pattern, next);
                debug!(
                    path = %full_path.display(),
                    probes = attempt,
                    "allocated file name"
                );
                return Ok(Reservation {
                    path: candidate,
                    claim: file_name,
                    state: Arc::clone(&owner),
                    probes: attempt,
                });
            }

            trace!(name = %file_name, "name taken");
            if bare {
                bare = false;
            } else {
                counter = match counter.checked_add(1) {
                    Some(c) => c,
                    None => break,
                };
            }
        }

        Err(SaveError::PathCollisionExhausted {
            directory,
            template: template.source().to_string(),
            attempts: self.max_probes,
        })
    }

    /// Number of names currently claimed in `directory`.
    pub fn claimed_in(&self, directory: &Path) -> usize {
        let state = self.directory_state(directory);
        let guard = state.lock();
        guard.claimed.len()
    }

    #[cfg(test)]
    fn hints_in(&self, directory: &Path) -> usize {
        let state = self.directory_state(directory);
        let guard = state.lock();
        guard.next_counter.len()
    }

    #[cfg(test)]
    fn tracked_directories(&self) -> usize {
        self.directories.lock().len()
    }
}

/// A claimed name. The claim is dropped with the reservation, which should
/// happen after the file has been committed (or abandoned).
#[derive(Debug)]
pub struct Reservation {
    path: ResolvedPath,
    claim: String,
    state: Arc<Mutex<DirectoryState>>,
    probes: u32,
}

impl Reservation {
    pub fn path(&self) -> &ResolvedPath {
        &self.path
    }

    /// How many candidates were probed, including the one that was free.
    pub fn probes(&self) -> u32 {
        self.probes
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.state.lock().claimed.remove(&self.claim);
    }
}

fn split_relative(resolved: &str) -> (Option<&str>, &str) {
    match resolved.rsplit_once('/') {
        Some((dir, file)) => (Some(dir), file),
        None => (None, resolved),
    }
}

/// Drops a trailing extension that already names `format`, so `out.png`
/// and `out` both end up as `out.png`.
fn strip_extension(file_name: &str, format: ImageFormat) -> &str {
    match file_name.rsplit_once('.') {
        Some((base, ext))
            if !base.is_empty()
                && format
                    .extensions()
                    .iter()
                    .any(|e| e.eq_ignore_ascii_case(ext)) =>
        {
            base
        }
        _ => file_name,
    }
}
