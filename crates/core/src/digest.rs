//! Content digests used as blob identities.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::str::FromStr;

/// Hash algorithm producing the digests a store is keyed by.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    /// MD5, matching the ETag S3 reports for single-part uploads.
    #[default]
    Md5,
    /// SHA-256.
    Sha256,
}

impl DigestAlgorithm {
    /// Number of raw bytes in a digest.
    pub const fn byte_len(self) -> usize {
        match self {
            Self::Md5 => 16,
            Self::Sha256 => 32,
        }
    }

    /// Number of hex characters in a canonical digest.
    pub const fn hex_len(self) -> usize {
        self.byte_len() * 2
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha256 => "sha256",
        }
    }

    /// Hash `data` and return the canonical digest.
    pub fn compute(self, data: &[u8]) -> Digest {
        let hex = match self {
            Self::Md5 => format!("{:x}", md5::compute(data)),
            Self::Sha256 => hex::encode(Sha256::digest(data)),
        };
        Digest(hex)
    }

    /// Algorithm whose digests have `byte_len` raw bytes, if any.
    pub fn for_byte_len(byte_len: usize) -> Option<Self> {
        match byte_len {
            16 => Some(Self::Md5),
            32 => Some(Self::Sha256),
            _ => None,
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A canonical lowercase hex digest.
///
/// The only way to obtain one is through [`Digest::parse`], [`Digest::parse_as`]
/// or [`DigestAlgorithm::compute`], so a `Digest` always has the length of a
/// known algorithm and contains only `[0-9a-f]`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest(String);

impl Digest {
    /// Parse a digest of any supported length.
    pub fn parse(s: &str) -> crate::Result<Self> {
        let algorithm = algorithm_for_hex_len(s.len()).ok_or_else(|| {
            crate::Error::InvalidDigest(format!("unsupported digest length {}", s.len()))
        })?;
        Self::parse_as(s, algorithm)
    }

    /// Parse a digest that must belong to `algorithm`.
    pub fn parse_as(s: &str, algorithm: DigestAlgorithm) -> crate::Result<Self> {
        if s.len() != algorithm.hex_len() {
            return Err(crate::Error::InvalidDigest(format!(
                "expected {} hex chars for {}, got {}",
                algorithm.hex_len(),
                algorithm,
                s.len()
            )));
        }
        if let Some(c) = s.chars().find(|c| !matches!(c, '0'..='9' | 'a'..='f')) {
            return Err(crate::Error::InvalidDigest(format!(
                "invalid character {c:?} (digests are lowercase hex)"
            )));
        }
        Ok(Self(s.to_string()))
    }

    /// Returns true if `s` is a canonical digest for `algorithm`.
    pub fn is_valid(s: &str, algorithm: DigestAlgorithm) -> bool {
        s.len() == algorithm.hex_len() && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The algorithm implied by this digest's length.
    pub fn algorithm(&self) -> DigestAlgorithm {
        // Length was checked on construction.
        algorithm_for_hex_len(self.0.len()).unwrap_or_default()
    }

    /// Raw digest bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        // Canonical hex always decodes.
        hex::decode(&self.0).unwrap_or_default()
    }

    /// Check `data` against this digest.
    pub fn matches(&self, data: &[u8]) -> bool {
        self.algorithm().compute(data) == *self
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

fn algorithm_for_hex_len(len: usize) -> Option<DigestAlgorithm> {
    if len % 2 != 0 {
        return None;
    }
    DigestAlgorithm::for_byte_len(len / 2)
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.0)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Digest {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::parse(s)
    }
}

impl AsRef<str> for Digest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
