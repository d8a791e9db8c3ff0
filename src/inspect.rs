use std::collections::HashSet;
use std::path::Path;

use anyhow::Result;

use crate::digest::DigestAlgorithm;
use crate::store::{ContentStore, IndexEntry};
use crate::writer::Durability;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IndexStats {
    /// Distinct digests in the index.
    pub digests: usize,
    /// Names recorded across all digests.
    pub paths: usize,
    /// Size of every name added up.
    pub total_bytes: u64,
    /// Size counting each digest once.
    pub unique_bytes: u64,
    pub log_bytes: u64,
}

impl IndexStats {
    /// Bytes the index would need without deduplication, over bytes stored.
    pub fn dedup_ratio(&self) -> f64 {
        if self.unique_bytes == 0 {
            return 1.0;
        }
        self.total_bytes as f64 / self.unique_bytes as f64
    }
}

/// Opens the index of `root` read-mostly: no rescan, no syncing.
pub fn open_index(root: &Path, algorithm: DigestAlgorithm) -> Result<ContentStore> {
    Ok(ContentStore::open(root, algorithm, Durability::Buffer, false)?)
}

pub fn index_stats(store: &ContentStore) -> Result<IndexStats> {
    let mut stats = IndexStats::default();
    let mut seen = HashSet::new();

    for entry in store.entries() {
        stats.digests += 1;
        for indexed in &entry.paths {
            stats.paths += 1;
            stats.total_bytes += indexed.size;
            if seen.insert(entry.digest.clone()) {
                stats.unique_bytes += indexed.size;
            }
        }
    }
    stats.log_bytes = std::fs::metadata(store.log_path())?.len();
    Ok(stats)
}

/// Entries ordered by first save, oldest first.
pub fn list_entries(store: &ContentStore) -> Vec<IndexEntry> {
    let mut entries = store.entries();
    entries.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.digest.to_hex().cmp(&b.digest.to_hex()))
    });
    entries
}

pub fn print_stats(store: &ContentStore) -> Result<()> {
    let stats = index_stats(store)?;
    println!("Root: {}", store.root().display());
    println!("Digests: {}", stats.digests);
    println!("Paths: {}", stats.paths);
    println!("Total size: {} ({} bytes)", format_bytes(stats.total_bytes), stats.total_bytes);
    println!("Unique size: {} ({} bytes)", format_bytes(stats.unique_bytes), stats.unique_bytes);
    println!("Deduplication ratio: {:.2}x", stats.dedup_ratio());
    println!("Index log: {}", format_bytes(stats.log_bytes));
    Ok(())
}

pub fn print_entries(store: &ContentStore, limit: Option<usize>) {
    let entries = list_entries(store);
    if entries.is_empty() {
        println!("No entries found");
        return;
    }

    println!("{:<20} {:<72} {:<10}", "Created At", "Digest", "Paths");
    println!("{:-<104}", "");
    let shown = limit.unwrap_or(entries.len());
    for entry in entries.iter().take(shown) {
        println!(
            "{:<20} {:<72} {:<10}",
            entry.created_at.format("%Y-%m-%d %H:%M:%S"),
            entry.digest,
            entry.paths.len()
        );
        for indexed in &entry.paths {
            let note = if indexed.alias { " alias" } else { "" };
            println!("    {} ({}){}", indexed.path.display(), format_bytes(indexed.size), note);
        }
    }
    if entries.len() > shown {
        println!("... ({} more)", entries.len() - shown);
    }
}

/// Format bytes in human-readable format
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];

    if bytes == 0 {
        return "0 B".to_string();
    }

    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::ResolvedPath;

    #[test]
    fn test_stats_count_duplicates_once() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_index(tmp.path(), DigestAlgorithm::Sha256).unwrap();
        for (name, bytes) in [("a.png", &b"1234"[..]), ("b.png", &b"1234"[..]), ("c.png", &b"56"[..])] {
            let full = tmp.path().join(name);
            std::fs::write(&full, bytes).unwrap();
            store
                .record(&store.digest(bytes), &ResolvedPath::from_path(&full).unwrap(), bytes.len() as u64)
                .unwrap();
        }

        let stats = index_stats(&store).unwrap();
        assert_eq!(stats.digests, 2);
        assert_eq!(stats.paths, 3);
        assert_eq!(stats.total_bytes, 10);
        assert_eq!(stats.unique_bytes, 6);
        assert!(stats.log_bytes > 0);
        assert_eq!(list_entries(&store).len(), 2);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512.00 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
    }
}
