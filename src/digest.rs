use std::fmt;
use std::io::{self, Read};
use std::str::FromStr;

use md5::Md5;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Hash used to address saved content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    #[default]
    Sha256,
    /// Kept for trees indexed by older tooling; not collision resistant.
    Md5,
}

impl DigestAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Md5 => "md5",
        }
    }

    /// Length of the raw hash in bytes.
    pub fn output_len(&self) -> usize {
        match self {
            DigestAlgorithm::Sha256 => 32,
            DigestAlgorithm::Md5 => 16,
        }
    }

    pub fn digest(&self, data: &[u8]) -> ContentDigest {
        let bytes = match self {
            DigestAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
            DigestAlgorithm::Md5 => Md5::digest(data).to_vec(),
        };
        ContentDigest {
            algorithm: *self,
            bytes,
        }
    }

    /// Hashes everything the reader yields.
    pub fn digest_reader<R: Read>(&self, reader: R) -> io::Result<ContentDigest> {
        let bytes = match self {
            DigestAlgorithm::Sha256 => hash_reader::<Sha256, R>(reader)?,
            DigestAlgorithm::Md5 => hash_reader::<Md5, R>(reader)?,
        };
        Ok(ContentDigest {
            algorithm: *self,
            bytes,
        })
    }
}

fn hash_reader<D: Digest, R: Read>(mut reader: R) -> io::Result<Vec<u8>> {
    let mut hasher = D::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_vec())
}

impl FromStr for DigestAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sha256" => Ok(DigestAlgorithm::Sha256),
            "md5" => Ok(DigestAlgorithm::Md5),
            _ => Err(format!("Unknown digest algorithm: {}", s)),
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Hash of the exact bytes written for one file, tagged with its algorithm.
///
/// The textual form is `<algorithm>:<lowercase hex>`, which is also how it is
/// stored in the index log.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentDigest {
    algorithm: DigestAlgorithm,
    bytes: Vec<u8>,
}

impl ContentDigest {
    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn to_hex(&self) -> String {
        faster_hex::hex_string(&self.bytes)
    }

    /// Parses the `<algorithm>:<hex>` form.
    pub fn parse(s: &str) -> Option<Self> {
        let (algo, hex) = s.split_once(':')?;
        let algorithm = DigestAlgorithm::from_str(algo).ok()?;
        if hex.len() != algorithm.output_len() * 2 {
            return None;
        }
        let mut bytes = vec![0u8; algorithm.output_len()];
        faster_hex::hex_decode(hex.as_bytes(), &mut bytes).ok()?;
        Some(Self { algorithm, bytes })
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.to_hex())
    }
}

impl Serialize for ContentDigest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ContentDigest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ContentDigest::parse(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid content digest: {}", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vectors() {
        let sha = DigestAlgorithm::Sha256.digest(b"abc");
        assert_eq!(
            sha.to_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        let md5 = DigestAlgorithm::Md5.digest(b"abc");
        assert_eq!(md5.to_hex(), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn test_reader_matches_slice() {
        let data = vec![7u8; READ_BUFFER_SIZE * 2 + 13];
        let from_reader = DigestAlgorithm::Sha256
            .digest_reader(&data[..])
            .unwrap();
        assert_eq!(from_reader, DigestAlgorithm::Sha256.digest(&data));
    }

    #[test]
    fn test_textual_form() {
        let digest = DigestAlgorithm::Md5.digest(b"abc");
        let text = digest.to_string();
        assert_eq!(text, "md5:900150983cd24fb0d6963f7d28e17f72");
        assert_eq!(ContentDigest::parse(&text), Some(digest));

        assert!(ContentDigest::parse("sha256:abcd").is_none());
        assert!(ContentDigest::parse("crc:00").is_none());
        assert!(ContentDigest::parse("no-separator").is_none());
    }
}
