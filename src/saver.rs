//! The save pipeline: name, embed, dedupe, commit, index.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{Local, NaiveDateTime};
use tracing::{debug, info, warn};

use crate::allocator::{PathAllocator, Reservation, ResolvedPath};
use crate::codec::{sidecar_path, ImageFormat, MetadataCodec, MetadataPlacement};
use crate::config::{DedupMode, SaveConfig};
use crate::digest::ContentDigest;
use crate::error::{SaveError, SaveResult};
use crate::metrics::SharedMetrics;
use crate::provenance::{ProvenanceContext, ProvenanceRecord, WORKFLOW_KEY};
use crate::store::ContentStore;
use crate::template::{ResolveContext, Template};
use crate::writer::{remove_if_exists, AtomicWriter};

/// How many names a save tries when its chosen name keeps getting taken by
/// writers outside this process.
const COMMIT_ATTEMPTS: u32 = 8;

/// One image to save.
#[derive(Debug, Clone)]
pub struct SaveRequest {
    pub bytes: Bytes,
    pub format: ImageFormat,
    pub template: String,
    /// Requested destination root. Only consulted by [`crate::router::SaverRouter`];
    /// a [`SmartSaver`] always writes under its own root.
    pub root: Option<PathBuf>,
    pub provenance: ProvenanceContext,
    /// Taken once when the request is created, so resolving the template
    /// never reads the clock.
    pub timestamp: NaiveDateTime,
}

impl SaveRequest {
    pub fn new(bytes: impl Into<Bytes>, format: ImageFormat, template: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            format,
            template: template.into(),
            root: None,
            provenance: ProvenanceContext::new(),
            timestamp: Local::now().naive_local(),
        }
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn with_provenance(mut self, provenance: ProvenanceContext) -> Self {
        self.provenance = provenance;
        self
    }

    pub fn with_timestamp(mut self, timestamp: NaiveDateTime) -> Self {
        self.timestamp = timestamp;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveOutcome {
    /// Where the image can be found. For a skipped duplicate this is the
    /// existing file.
    pub path: PathBuf,
    pub digest: ContentDigest,
    /// The content was already stored under another name.
    pub deduplicated: bool,
    pub placement: MetadataPlacement,
    /// Bytes newly written for the image itself; zero for links and skips.
    pub bytes_written: u64,
}

/// The interface host adapters save through.
pub trait ImageSink: Send + Sync {
    fn save(&self, request: SaveRequest) -> SaveResult<SaveOutcome>;

    /// Provenance record stored with a saved image, if any.
    fn provenance(&self, path: &Path) -> SaveResult<Option<ProvenanceRecord>>;
}

/// Saves images under one root directory.
#[derive(Debug)]
pub struct SmartSaver {
    root: PathBuf,
    config: SaveConfig,
    allocator: Arc<PathAllocator>,
    store: ContentStore,
    codec: MetadataCodec,
    writer: AtomicWriter,
    metrics: SharedMetrics,
    #[cfg(test)]
    armed: parking_lot::Mutex<Option<FailPoint>>,
}

impl SmartSaver {
    /// Creates `root` if needed and opens its content index.
    pub fn open(root: impl Into<PathBuf>, config: SaveConfig, metrics: SharedMetrics) -> SaveResult<Self> {
        let allocator = Arc::new(PathAllocator::new(config.counter_start, config.max_probes));
        Self::with_allocator(root, config, metrics, allocator)
    }

    /// Like [`SmartSaver::open`], but claims names through a shared
    /// allocator. Savers whose roots overlap must share one so they never
    /// hand out the same name twice.
    pub fn with_allocator(
        root: impl Into<PathBuf>,
        config: SaveConfig,
        metrics: SharedMetrics,
        allocator: Arc<PathAllocator>,
    ) -> SaveResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| SaveError::write(&root, e))?;
        let store = ContentStore::open(&root, config.digest, config.durability, config.rescan_on_open)?;

        info!(
            root = %root.display(),
            dedup = ?config.dedup,
            digest = %config.digest,
            "smart saver ready"
        );
        Ok(Self {
            allocator,
            codec: MetadataCodec::new(config.embed_parameters_text),
            writer: AtomicWriter::new(config.durability),
            root,
            config,
            store,
            metrics,
            #[cfg(test)]
            armed: parking_lot::Mutex::new(None),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &SaveConfig {
        &self.config
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    pub fn save(&self, request: SaveRequest) -> SaveResult<SaveOutcome> {
        match self.save_inner(&request) {
            Ok(outcome) => {
                if outcome.deduplicated {
                    self.metrics.dedup_hit();
                }
                self.metrics.save_committed(outcome.bytes_written);
                Ok(outcome)
            }
            Err(e) => {
                warn!(template = %request.template, format = %request.format, error = %e, "save failed");
                self.metrics.save_failed(e.kind());
                Err(e)
            }
        }
    }

    pub fn provenance(&self, path: &Path) -> SaveResult<Option<ProvenanceRecord>> {
        self.codec.read_provenance(path)
    }

    fn save_inner(&self, request: &SaveRequest) -> SaveResult<SaveOutcome> {
        let format = request.format;
        let template = Template::parse(&request.template)?;
        let ctx = ResolveContext {
            provenance: &request.provenance,
            timestamp: request.timestamp,
            counter_width: self.config.counter_width,
            prompt_hash_len: self.config.prompt_hash_len,
        };
        // Surface template errors before anything is read, hashed or written.
        template.resolve(&ctx, self.config.counter_start)?;

        if request.bytes.is_empty() {
            return Err(SaveError::codec(format, "image is empty"));
        }

        let record = self.record_for(&request.provenance, format)?;
        let embedded = self.codec.embed(&request.bytes, format, &record)?;
        if embedded.placement == MetadataPlacement::Sidecar {
            if !self.config.allow_sidecar {
                return Err(SaveError::codec(
                    format,
                    "format cannot embed provenance and sidecars are disabled",
                ));
            }
            warn!(format = %format, "provenance goes to a sidecar file");
        }

        let digest = self.store.digest(&embedded.bytes);
        let size = embedded.bytes.len() as u64;
        let existing = match self.config.dedup {
            DedupMode::Disabled => None,
            _ => self.store.lookup(&digest),
        };

        if let (DedupMode::Skip, Some(existing)) = (self.config.dedup, &existing) {
            // The requested name is remembered as an alias so the index still
            // answers for it, but nothing is written there.
            let reservation = self.allocator.allocate(&self.root, &template, &ctx, format)?;
            self.metrics.names_probed(reservation.probes());
            self.store.record_alias(&digest, reservation.path(), size)?;
            debug!(
                digest = %digest,
                path = %existing.full_path().display(),
                alias = %reservation.path().full_path().display(),
                "content already stored, skipping write"
            );
            return Ok(SaveOutcome {
                path: existing.full_path(),
                digest,
                deduplicated: true,
                placement: embedded.placement,
                bytes_written: 0,
            });
        }

        // Another process can create the chosen name after it was allocated.
        // Commits never replace a file, so that shows up as AlreadyExists and
        // a fresh name is allocated.
        let mut attempt = 1;
        let (reservation, sidecar, bytes_written) = loop {
            let reservation = self.allocator.allocate(&self.root, &template, &ctx, format)?;
            self.metrics.names_probed(reservation.probes());
            match self.commit(&reservation, &embedded.bytes, embedded.placement, &record, existing.as_ref()) {
                Ok((sidecar, written)) => break (reservation, sidecar, written),
                Err(e) if e.is_already_exists() && attempt < COMMIT_ATTEMPTS => {
                    debug!(
                        path = %reservation.path().full_path().display(),
                        attempt,
                        "name taken before commit, allocating again"
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };
        let target = reservation.path().full_path();

        #[cfg(test)]
        self.fail_point(FailPoint::CorruptBeforeVerify, &target)?;
        if self.config.verify_after_write {
            if let Err(e) = self.verify(&target, &digest) {
                self.revert(Some(&target), sidecar.as_deref());
                return Err(e);
            }
        }

        if let Err(e) = self.record_index(&digest, &reservation, size) {
            self.revert(Some(&target), sidecar.as_deref());
            return Err(e);
        }

        info!(
            path = %target.display(),
            digest = %digest,
            deduplicated = existing.is_some(),
            bytes = bytes_written,
            "saved image"
        );
        drop(reservation);

        Ok(SaveOutcome {
            path: target,
            digest,
            deduplicated: existing.is_some(),
            placement: embedded.placement,
            bytes_written,
        })
    }

    /// Writes the sidecar (if any) and the image under the reserved name.
    /// On failure nothing this call created is left behind.
    fn commit(
        &self,
        reservation: &Reservation,
        bytes: &[u8],
        placement: MetadataPlacement,
        record: &ProvenanceRecord,
        existing: Option<&ResolvedPath>,
    ) -> SaveResult<(Option<PathBuf>, u64)> {
        let target = reservation.path().full_path();

        let sidecar = match placement {
            MetadataPlacement::Sidecar => {
                let sidecar = sidecar_path(&target);
                self.writer.commit(&sidecar, record.as_bytes())?;
                Some(sidecar)
            }
            MetadataPlacement::Embedded => None,
        };

        let written = self.write_image(&target, bytes, existing);
        match written {
            Ok(n) => Ok((sidecar, n)),
            Err(e) => {
                self.revert(None, sidecar.as_deref());
                Err(e)
            }
        }
    }

    fn record_index(&self, digest: &ContentDigest, reservation: &Reservation, size: u64) -> SaveResult<()> {
        #[cfg(test)]
        self.fail_point(FailPoint::IndexRecord, self.store.log_path())?;
        self.store.record(digest, reservation.path(), size)
    }

    fn write_image(&self, target: &Path, bytes: &[u8], existing: Option<&ResolvedPath>) -> SaveResult<u64> {
        #[cfg(test)]
        self.fail_point(FailPoint::ImageCommit, target)?;
        #[cfg(test)]
        self.fail_point(FailPoint::OccupyTarget, target)?;

        match (existing, self.config.dedup) {
            (Some(source), DedupMode::Link) => {
                let source = source.full_path();
                match self.writer.link(&source, target) {
                    Ok(()) => {
                        debug!(source = %source.display(), path = %target.display(), "linked duplicate");
                        Ok(0)
                    }
                    Err(e) if e.is_already_exists() => Err(e),
                    Err(e) => {
                        warn!(source = %source.display(), error = %e, "hard link failed, writing a copy");
                        self.writer.commit(target, bytes)
                    }
                }
            }
            _ => self.writer.commit(target, bytes),
        }
    }

    fn record_for(&self, provenance: &ProvenanceContext, format: ImageFormat) -> SaveResult<ProvenanceRecord> {
        let result = if self.config.embed_workflow || !provenance.contains_key(WORKFLOW_KEY) {
            ProvenanceRecord::from_context(provenance)
        } else {
            let mut trimmed = provenance.clone();
            trimmed.remove(WORKFLOW_KEY);
            ProvenanceRecord::from_context(&trimmed)
        };
        result.map_err(|e| SaveError::codec(format, format!("cannot serialize provenance: {}", e)))
    }

    fn verify(&self, path: &Path, expected: &ContentDigest) -> SaveResult<()> {
        let file = std::fs::File::open(path).map_err(|e| SaveError::read(path, e))?;
        let actual = expected
            .algorithm()
            .digest_reader(file)
            .map_err(|e| SaveError::read(path, e))?;
        if &actual != expected {
            return Err(SaveError::DigestMismatch {
                path: path.to_path_buf(),
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }

    /// Best-effort removal of files a failed save already made visible.
    fn revert(&self, target: Option<&Path>, sidecar: Option<&Path>) {
        for path in target.into_iter().chain(sidecar) {
            if let Err(e) = remove_if_exists(path) {
                warn!(path = %path.display(), error = %e, "failed to clean up after failed save");
            }
        }
    }
}

/// Failures tests can inject at fixed points of the pipeline.
#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailPoint {
    /// The image write fails after the sidecar is committed.
    ImageCommit,
    /// Another writer creates the target just before the image commit.
    OccupyTarget,
    /// The committed image is overwritten before it is verified.
    CorruptBeforeVerify,
    /// Appending the index record fails.
    IndexRecord,
}

#[cfg(test)]
impl SmartSaver {
    fn arm(&self, point: FailPoint) {
        *self.armed.lock() = Some(point);
    }

    /// Fires `point` once if it is armed.
    fn fail_point(&self, point: FailPoint, path: &Path) -> SaveResult<()> {
        {
            let mut armed = self.armed.lock();
            if *armed != Some(point) {
                return Ok(());
            }
            *armed = None;
        }
        let injected = || std::io::Error::new(std::io::ErrorKind::Other, "injected failure");
        match point {
            FailPoint::ImageCommit => Err(SaveError::write(path, injected())),
            FailPoint::IndexRecord => Err(SaveError::write(path, injected())),
            FailPoint::OccupyTarget => std::fs::write(path, b"foreign").map_err(|e| SaveError::write(path, e)),
            FailPoint::CorruptBeforeVerify => {
                std::fs::write(path, b"corrupted").map_err(|e| SaveError::write(path, e))
            }
        }
    }
}

impl ImageSink for SmartSaver {
    fn save(&self, request: SaveRequest) -> SaveResult<SaveOutcome> {
        SmartSaver::save(self, request)
    }

    fn provenance(&self, path: &Path) -> SaveResult<Option<ProvenanceRecord>> {
        SmartSaver::provenance(self, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn saver(root: &Path, config: SaveConfig) -> SmartSaver {
        SmartSaver::open(root, config, SharedMetrics::default()).unwrap()
    }

    fn config() -> SaveConfig {
        SaveConfig {
            durability: crate::writer::Durability::Buffer,
            ..SaveConfig::default()
        }
    }

    fn bmp() -> Vec<u8> {
        let mut bytes = b"BM".to_vec();
        bytes.extend_from_slice(&[0u8; 60]);
        bytes
    }

    /// Names in `root`, leaving out the index directory.
    fn listing(root: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(root)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name != crate::store::INDEX_DIR)
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_template_errors_come_first() {
        let tmp = tempfile::tempdir().unwrap();
        let saver = saver(tmp.path(), config());
        let err = saver
            .save(SaveRequest::new(Vec::new(), ImageFormat::Png, "../escape"))
            .unwrap_err();
        assert!(matches!(err, SaveError::InvalidTemplate { .. }));

        let err = saver
            .save(SaveRequest::new(Vec::new(), ImageFormat::Png, "ok"))
            .unwrap_err();
        assert!(matches!(err, SaveError::CodecError { .. }));
    }

    #[test]
    fn test_sidecar_written_next_to_image() {
        let tmp = tempfile::tempdir().unwrap();
        let saver = saver(tmp.path(), config());
        let provenance = ProvenanceContext::new().with("prompt", "a cat").with("seed", 42);
        let ts = NaiveDate::from_ymd_opt(2024, 5, 6).unwrap().and_hms_opt(7, 8, 9).unwrap();

        let outcome = saver
            .save(
                SaveRequest::new(bmp(), ImageFormat::Bmp, "%date%/%seed%")
                    .with_provenance(provenance.clone())
                    .with_timestamp(ts),
            )
            .unwrap();
        assert_eq!(outcome.path, tmp.path().join("2024-05-06/42.bmp"));
        assert_eq!(outcome.placement, MetadataPlacement::Sidecar);
        assert_eq!(std::fs::read(&outcome.path).unwrap(), bmp());

        let record = saver.provenance(&outcome.path).unwrap().unwrap();
        assert_eq!(record.to_context().unwrap(), provenance);
    }

    #[test]
    fn test_sidecar_can_be_disabled() {
        let tmp = tempfile::tempdir().unwrap();
        let saver = saver(
            tmp.path(),
            SaveConfig {
                allow_sidecar: false,
                ..config()
            },
        );
        let err = saver
            .save(SaveRequest::new(bmp(), ImageFormat::Bmp, "x"))
            .unwrap_err();
        assert!(matches!(err, SaveError::CodecError { .. }));
        assert!(!tmp.path().join("x.bmp").exists());
    }

    #[test]
    fn test_workflow_can_be_left_out() {
        let tmp = tempfile::tempdir().unwrap();
        let saver = saver(
            tmp.path(),
            SaveConfig {
                embed_workflow: false,
                ..config()
            },
        );
        let provenance = ProvenanceContext::new()
            .with("prompt", "a cat")
            .with(WORKFLOW_KEY, serde_json::json!({"nodes": []}));
        let outcome = saver
            .save(SaveRequest::new(bmp(), ImageFormat::Bmp, "wf").with_provenance(provenance))
            .unwrap();
        let context = saver.provenance(&outcome.path).unwrap().unwrap().to_context().unwrap();
        assert_eq!(context.prompt(), Some("a cat"));
        assert!(!context.contains_key(WORKFLOW_KEY));
    }

    #[test]
    fn test_failed_image_write_removes_sidecar() {
        let tmp = tempfile::tempdir().unwrap();
        let saver = saver(tmp.path(), config());
        saver.arm(FailPoint::ImageCommit);

        let err = saver
            .save(SaveRequest::new(bmp(), ImageFormat::Bmp, "x"))
            .unwrap_err();
        assert!(matches!(err, SaveError::WriteFailure { .. }));
        assert!(listing(tmp.path()).is_empty());
        assert!(saver.store().is_empty());
    }

    #[test]
    fn test_digest_mismatch_removes_written_files() {
        let tmp = tempfile::tempdir().unwrap();
        let saver = saver(
            tmp.path(),
            SaveConfig {
                verify_after_write: true,
                ..config()
            },
        );
        saver.arm(FailPoint::CorruptBeforeVerify);

        let err = saver
            .save(SaveRequest::new(bmp(), ImageFormat::Bmp, "x"))
            .unwrap_err();
        assert!(matches!(err, SaveError::DigestMismatch { .. }), "{err}");
        assert!(listing(tmp.path()).is_empty());
        assert!(saver.store().is_empty());
    }

    #[test]
    fn test_index_failure_removes_written_files() {
        let tmp = tempfile::tempdir().unwrap();
        let saver = saver(tmp.path(), config());
        saver.arm(FailPoint::IndexRecord);

        let err = saver
            .save(SaveRequest::new(bmp(), ImageFormat::Bmp, "x"))
            .unwrap_err();
        assert!(matches!(err, SaveError::WriteFailure { .. }));
        assert!(listing(tmp.path()).is_empty());
        assert!(saver.store().is_empty());

        // the next save is unaffected
        let outcome = saver.save(SaveRequest::new(bmp(), ImageFormat::Bmp, "x")).unwrap();
        assert!(outcome.path.is_file());
        assert_eq!(saver.store().len(), 1);
    }

    #[test]
    fn test_name_taken_before_commit_is_allocated_again() {
        let tmp = tempfile::tempdir().unwrap();
        let saver = saver(tmp.path(), config());
        saver.arm(FailPoint::OccupyTarget);

        let outcome = saver.save(SaveRequest::new(bmp(), ImageFormat::Bmp, "x")).unwrap();
        assert_eq!(outcome.path, tmp.path().join("x_0001.bmp"));
        assert_eq!(std::fs::read(tmp.path().join("x.bmp")).unwrap(), b"foreign");
        assert_eq!(std::fs::read(&outcome.path).unwrap(), bmp());
        assert_eq!(
            listing(tmp.path()),
            vec!["x.bmp", "x_0001.bmp", "x_0001.bmp.provenance.json"]
        );
    }

    #[test]
    fn test_stale_sidecar_is_never_overwritten() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("x.bmp.provenance.json"), b"stale").unwrap();
        let saver = saver(tmp.path(), config());

        let outcome = saver.save(SaveRequest::new(bmp(), ImageFormat::Bmp, "x")).unwrap();
        assert_eq!(outcome.path, tmp.path().join("x_0001.bmp"));
        assert_eq!(
            std::fs::read(tmp.path().join("x.bmp.provenance.json")).unwrap(),
            b"stale"
        );
    }

    #[test]
    fn test_savers_sharing_an_allocator_never_collide() {
        let tmp = tempfile::tempdir().unwrap();
        let allocator = Arc::new(PathAllocator::default());
        let outer = SmartSaver::with_allocator(
            tmp.path(),
            config(),
            SharedMetrics::default(),
            Arc::clone(&allocator),
        )
        .unwrap();
        let inner = SmartSaver::with_allocator(
            tmp.path().join("a"),
            config(),
            SharedMetrics::default(),
            allocator,
        )
        .unwrap();

        let paths: Vec<PathBuf> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16u8)
                .map(|i| {
                    // both savers write into `<root>/a`
                    let (saver, template) = if i % 2 == 0 {
                        (&outer, "a/img_%counter%")
                    } else {
                        (&inner, "img_%counter%")
                    };
                    scope.spawn(move || {
                        let mut bytes = bmp();
                        bytes.push(i);
                        saver
                            .save(SaveRequest::new(bytes, ImageFormat::Bmp, template))
                            .unwrap()
                            .path
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let distinct: std::collections::HashSet<_> = paths.iter().collect();
        assert_eq!(distinct.len(), paths.len());
        for (i, path) in paths.iter().enumerate() {
            let mut expected = bmp();
            expected.push(i as u8);
            assert_eq!(std::fs::read(path).unwrap(), expected);
        }
    }
}
