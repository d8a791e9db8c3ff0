use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::allocator::PathAllocator;
use crate::config::SaveConfig;
use crate::error::{SaveError, SaveResult};
use crate::metrics::SharedMetrics;
use crate::provenance::ProvenanceRecord;
use crate::saver::{ImageSink, SaveOutcome, SaveRequest, SmartSaver};

/// Overrides every requested root when set to a non-empty value.
pub const OUTPUT_DIR_ENV: &str = "SMART_SAVE_OUTPUT_DIR";

/// Picks the destination root: the environment override, then the requested
/// root, then the configured default.
pub fn pick_root(env: Option<OsString>, requested: Option<&Path>, default: &Path) -> PathBuf {
    match env {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => requested.unwrap_or(default).to_path_buf(),
    }
}

/// Routes requests to one [`SmartSaver`] per destination root, opening
/// savers on first use. All savers claim names through one allocator, so
/// nested roots that reach the same directory never pick the same name.
pub struct SaverRouter {
    savers: RwLock<HashMap<PathBuf, Arc<SmartSaver>>>,
    allocator: Arc<PathAllocator>,
    config: SaveConfig,
    metrics: SharedMetrics,
}

impl SaverRouter {
    pub fn new(config: SaveConfig, metrics: SharedMetrics) -> Self {
        Self {
            savers: RwLock::new(HashMap::new()),
            allocator: Arc::new(PathAllocator::new(config.counter_start, config.max_probes)),
            config,
            metrics,
        }
    }

    /// Root a request would be written under.
    pub fn root_for(&self, requested: Option<&Path>) -> PathBuf {
        pick_root(std::env::var_os(OUTPUT_DIR_ENV), requested, &self.config.output_dir)
    }

    /// Saver for `root`, opened on first use. Different spellings of the same
    /// directory share one saver.
    pub fn get_saver(&self, root: &Path) -> SaveResult<Arc<SmartSaver>> {
        std::fs::create_dir_all(root).map_err(|e| SaveError::write(root, e))?;
        let root = root.canonicalize().map_err(|e| SaveError::read(root, e))?;

        {
            let savers = self.savers.read();
            if let Some(saver) = savers.get(&root) {
                return Ok(Arc::clone(saver));
            }
        }

        let mut savers = self.savers.write();
        // Another thread may have opened it while we waited for the lock.
        if let Some(saver) = savers.get(&root) {
            return Ok(Arc::clone(saver));
        }
        debug!(root = %root.display(), "opening saver for new root");
        let saver = Arc::new(SmartSaver::with_allocator(
            root.clone(),
            self.config.clone(),
            self.metrics.clone(),
            Arc::clone(&self.allocator),
        )?);
        savers.insert(root, Arc::clone(&saver));
        Ok(saver)
    }

    pub fn config(&self) -> &SaveConfig {
        &self.config
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }
}

impl ImageSink for SaverRouter {
    fn save(&self, request: SaveRequest) -> SaveResult<SaveOutcome> {
        let root = self.root_for(request.root.as_deref());
        self.get_saver(&root)?.save(request)
    }

    /// Served by the saver whose root contains `path`, so the codec settings
    /// match the ones the file was written with.
    fn provenance(&self, path: &Path) -> SaveResult<Option<ProvenanceRecord>> {
        let saver = {
            let savers = self.savers.read();
            savers
                .iter()
                .find(|(root, _)| path.starts_with(root))
                .map(|(_, saver)| Arc::clone(saver))
        };
        match saver {
            Some(saver) => saver.provenance(path),
            None => crate::codec::MetadataCodec::new(self.config.embed_parameters_text).read_provenance(path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_root() {
        let default = Path::new("output");
        let requested = Path::new("/srv/renders");
        assert_eq!(pick_root(None, None, default), PathBuf::from("output"));
        assert_eq!(pick_root(None, Some(requested), default), PathBuf::from("/srv/renders"));
        assert_eq!(
            pick_root(Some(OsString::from("/env")), Some(requested), default),
            PathBuf::from("/env")
        );
        assert_eq!(
            pick_root(Some(OsString::new()), Some(requested), default),
            PathBuf::from("/srv/renders")
        );
    }

    #[test]
    fn test_same_root_shares_a_saver() {
        let tmp = tempfile::tempdir().unwrap();
        let router = SaverRouter::new(SaveConfig::default(), SharedMetrics::default());
        let a = router.get_saver(tmp.path()).unwrap();
        let b = router.get_saver(&tmp.path().join("sub/..")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let other = router.get_saver(&tmp.path().join("other")).unwrap();
        assert!(!Arc::ptr_eq(&a, &other));
    }
}
