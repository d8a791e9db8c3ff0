#![allow(dead_code)]

use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime};
use smart_save::metrics::SharedMetrics;
use smart_save::{Durability, SaveConfig, SmartSaver};

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

fn chunk(kind: &[u8; 4], data: &[u8]) -> Vec<u8> {
    let mut out = (data.len() as u32).to_be_bytes().to_vec();
    out.extend_from_slice(kind);
    out.extend_from_slice(data);
    let crc = crc32fast::hash(&out[4..]);
    out.extend_from_slice(&crc.to_be_bytes());
    out
}

/// A structurally valid PNG whose image data is `pixels`.
pub fn png(pixels: &[u8]) -> Vec<u8> {
    let mut out = PNG_SIGNATURE.to_vec();
    out.extend(chunk(b"IHDR", &[0, 0, 0, 1, 0, 0, 0, 1, 8, 0, 0, 0, 0]));
    out.extend(chunk(b"tEXt", b"Software\0test"));
    out.extend(chunk(b"IDAT", pixels));
    out.extend(chunk(b"IEND", &[]));
    out
}

/// A minimal baseline JPEG with `scan` as entropy-coded data.
pub fn jpeg(scan: &[u8]) -> Vec<u8> {
    let mut out = vec![0xFF, 0xD8];
    out.extend_from_slice(&[0xFF, 0xE0, 0x00, 0x07, b'J', b'F', b'I', b'F', 0]);
    out.extend_from_slice(&[0xFF, 0xDA, 0x00, 0x04, 0x01, 0x00]);
    out.extend_from_slice(scan);
    out.extend_from_slice(&[0xFF, 0xD9]);
    out
}

pub fn timestamp() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 3, 14)
        .unwrap()
        .and_hms_opt(15, 9, 26)
        .unwrap()
}

pub fn config() -> SaveConfig {
    SaveConfig {
        durability: Durability::Buffer,
        ..SaveConfig::default()
    }
}

pub fn open(root: &Path, config: SaveConfig) -> SmartSaver {
    SmartSaver::open(root, config, SharedMetrics::default()).unwrap()
}
