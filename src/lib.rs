pub mod allocator;
pub mod check;
pub mod codec;
pub mod config;
pub mod digest;
pub mod error;
pub mod inspect;
pub mod metrics;
pub mod provenance;
pub mod router;
pub mod saver;
pub mod store;
pub mod template;
pub mod writer;

pub use codec::{ImageFormat, MetadataCodec, MetadataPlacement};
pub use config::{DedupMode, SaveConfig};
pub use digest::{ContentDigest, DigestAlgorithm};
pub use error::{SaveError, SaveResult};
pub use provenance::{ProvenanceContext, ProvenanceRecord};
pub use router::SaverRouter;
pub use saver::{ImageSink, SaveOutcome, SaveRequest, SmartSaver};
pub use writer::{AtomicWriter, Durability};
