use std::fs::File;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::{debug, warn};

use crate::config::SaveConfig;
use crate::digest::DigestAlgorithm;
use crate::store::ContentStore;
use crate::writer::Durability;

#[derive(Parser, Debug)]
pub struct CheckConfig {
    #[arg(long, default_value = "output", help = "Root directory of the saved images")]
    pub root: PathBuf,

    #[arg(long, help = "Digest algorithm (sha256, md5); defaults to the config value")]
    pub digest: Option<DigestAlgorithm>,

    #[arg(long, help = "Only report, do not fail on problems")]
    pub report_only: bool,
}

/// A file whose bytes no longer hash to the digest it is indexed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Corrupted {
    pub path: PathBuf,
    pub expected: String,
    pub actual: String,
}

#[derive(Debug, Default, Clone)]
pub struct CheckReport {
    pub checked: usize,
    pub missing: Vec<PathBuf>,
    pub corrupted: Vec<Corrupted>,
}

impl CheckReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.corrupted.is_empty()
    }
}

/// Re-hashes every indexed file and compares it with its index entry.
pub fn check_store(store: &ContentStore) -> Result<CheckReport> {
    let mut report = CheckReport::default();
    let mut entries = store.entries();
    entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));

    for entry in entries {
        for indexed in entry.paths.iter().filter(|p| !p.alias) {
            let full = store.root().join(&indexed.path);
            let file = match File::open(&full) {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(path = %full.display(), "indexed file is missing");
                    report.missing.push(full);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            report.checked += 1;

            let actual = entry.digest.algorithm().digest_reader(file)?;
            if actual != entry.digest {
                warn!(path = %full.display(), expected = %entry.digest, actual = %actual, "content changed on disk");
                report.corrupted.push(Corrupted {
                    path: full,
                    expected: entry.digest.to_string(),
                    actual: actual.to_string(),
                });
            }
        }
    }
    Ok(report)
}

pub fn check_integrity(args: CheckConfig, config: &SaveConfig) -> Result<()> {
    let algorithm = args.digest.unwrap_or(config.digest);
    let store = ContentStore::open(&args.root, algorithm, Durability::Buffer, false)?;
    let report = check_store(&store)?;

    println!("Checked files: {}", report.checked);
    for path in &report.missing {
        println!("MISSING   {}", path.display());
    }
    for corrupted in &report.corrupted {
        println!(
            "CORRUPTED {} (expected {}, found {})",
            corrupted.path.display(),
            corrupted.expected,
            corrupted.actual
        );
    }

    if report.is_clean() {
        println!("All indexed files are intact");
    } else if !args.report_only {
        anyhow::bail!(
            "{} missing and {} corrupted file(s)",
            report.missing.len(),
            report.corrupted.len()
        );
    }
    Ok(())
}
