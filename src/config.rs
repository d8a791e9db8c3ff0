use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::allocator::{DEFAULT_COUNTER_START, DEFAULT_MAX_PROBES};
use crate::digest::DigestAlgorithm;
use crate::template::{DEFAULT_COUNTER_WIDTH, DEFAULT_PROMPT_HASH_LEN, MAX_COUNTER_WIDTH};
use crate::writer::Durability;

/// What to do when the bytes being saved are already on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DedupMode {
    /// Always write a new file and do not consult the index.
    Disabled,
    /// Write nothing and return the existing path.
    Skip,
    /// Hard-link the new name to the existing file.
    #[default]
    Link,
    /// Write an independent copy under the new name.
    Copy,
}

impl FromStr for DedupMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "disabled" | "off" => Ok(DedupMode::Disabled),
            "skip" => Ok(DedupMode::Skip),
            "link" => Ok(DedupMode::Link),
            "copy" => Ok(DedupMode::Copy),
            _ => Err(format!("Unknown dedup mode: {}", s)),
        }
    }
}

/// Saver settings, usually read from a `smart-save.toml`. Every field has a
/// default, so an empty file is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SaveConfig {
    /// Root used when a request names none and the environment does not
    /// override it.
    pub output_dir: PathBuf,
    pub counter_start: u32,
    pub counter_width: usize,
    pub max_probes: u32,
    pub prompt_hash_len: usize,
    pub dedup: DedupMode,
    pub digest: DigestAlgorithm,
    pub durability: Durability,
    /// Re-read and hash every committed file before reporting success.
    pub verify_after_write: bool,
    /// Also embed the human-readable `parameters` text in PNGs.
    pub embed_parameters_text: bool,
    /// Keep the full workflow graph in the embedded record.
    pub embed_workflow: bool,
    /// Write a `.provenance.json` next to formats that cannot carry it.
    pub allow_sidecar: bool,
    pub rescan_on_open: bool,
}

impl Default for SaveConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            counter_start: DEFAULT_COUNTER_START,
            counter_width: DEFAULT_COUNTER_WIDTH,
            max_probes: DEFAULT_MAX_PROBES,
            prompt_hash_len: DEFAULT_PROMPT_HASH_LEN,
            dedup: DedupMode::default(),
            digest: DigestAlgorithm::default(),
            durability: Durability::default(),
            verify_after_write: false,
            embed_parameters_text: true,
            embed_workflow: true,
            allow_sidecar: true,
            rescan_on_open: true,
        }
    }
}

impl SaveConfig {
    pub fn load_from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: SaveConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.counter_width == 0 || self.counter_width > MAX_COUNTER_WIDTH {
            bail!(
                "counter_width must be between 1 and {}, got {}",
                MAX_COUNTER_WIDTH,
                self.counter_width
            );
        }
        if self.max_probes == 0 {
            bail!("max_probes must be at least 1");
        }
        if self.prompt_hash_len == 0 || self.prompt_hash_len > 64 {
            bail!("prompt_hash_len must be between 1 and 64, got {}", self.prompt_hash_len);
        }
        if self.output_dir.as_os_str().is_empty() {
            bail!("output_dir must not be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config: SaveConfig = toml::from_str("").unwrap();
        assert_eq!(config, SaveConfig::default());
        assert_eq!(config.dedup, DedupMode::Link);
        assert_eq!(config.counter_start, 1);
        config.validate().unwrap();
    }

    #[test]
    fn test_load_from_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("smart-save.toml");
        fs::write(
            &path,
            r#"
output_dir = "/data/renders"
dedup = "skip"
digest = "md5"
durability = "buffer"
counter_width = 6
verify_after_write = true
"#,
        )
        .unwrap();

        let config = SaveConfig::load_from_file(&path).unwrap();
        assert_eq!(config.output_dir, PathBuf::from("/data/renders"));
        assert_eq!(config.dedup, DedupMode::Skip);
        assert_eq!(config.digest, DigestAlgorithm::Md5);
        assert_eq!(config.durability, Durability::Buffer);
        assert_eq!(config.counter_width, 6);
        assert!(config.verify_after_write);
        assert!(config.embed_workflow);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bad.toml");
        fs::write(&path, "counter_width = 0\n").unwrap();
        assert!(SaveConfig::load_from_file(&path).is_err());

        fs::write(&path, "dedup = \"sometimes\"\n").unwrap();
        assert!(SaveConfig::load_from_file(&path).is_err());

        assert!(SaveConfig::load_from_file(tmp.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_dedup_mode_from_str() {
        assert_eq!("LINK".parse::<DedupMode>().unwrap(), DedupMode::Link);
        assert_eq!("off".parse::<DedupMode>().unwrap(), DedupMode::Disabled);
        assert!("maybe".parse::<DedupMode>().is_err());
    }
}
