//! Content digests and layer chain identifiers.
//!
//! A [`Digest`] is the `<algorithm>:<hex>` string used throughout OCI to
//! address content. Only the sha2 family is accepted; the hex part is
//! lower-case and must have the exact length of the algorithm's output.
//!
//! ## Chain IDs
//!
//! A chain ID names the filesystem produced by applying an ordered list of
//! layer diffs. It is derived from the uncompressed diff IDs:
//!
//! ```text
//! chain[0] = diff[0]
//! chain[n] = sha256(chain[n-1] + " " + diff[n])
//! ```
//!
//! Because each chain ID covers its whole ancestry, a committed snapshot
//! named by a chain ID can be shared by every image whose layer stack starts
//! with the same diffs.

use crate::constants::digest_hex_len;
use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;

/// A validated content digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    algorithm: String,
    hex: String,
}

impl Digest {
    /// Parses and validates a digest string.
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidDigest {
            digest: s.to_string(),
            reason: reason.to_string(),
        };

        let (algorithm, hex) = s.split_once(':').ok_or_else(|| invalid("missing ':'"))?;
        let expected_len =
            digest_hex_len(algorithm).ok_or_else(|| invalid("unsupported algorithm"))?;

        if hex.len() != expected_len {
            return Err(invalid(&format!(
                "expected {} hex characters, got {}",
                expected_len,
                hex.len()
            )));
        }
        if !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(invalid("hash must be lower-case hexadecimal"));
        }

        Ok(Self {
            algorithm: algorithm.to_string(),
            hex: hex.to_string(),
        })
    }

    /// Computes the sha256 digest of `data`.
    pub fn from_bytes(data: &[u8]) -> Self {
        Self::from_sha256(Sha256::digest(data).as_slice())
    }

    fn from_sha256(hash: &[u8]) -> Self {
        Self {
            algorithm: "sha256".to_string(),
            hex: hex::encode(hash),
        }
    }

    /// Returns the algorithm part (`sha256`).
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// Returns the hex-encoded hash.
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Returns the first 12 hex characters, as shown in listings.
    pub fn short(&self) -> &str {
        &self.hex[..12.min(self.hex.len())]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Streaming Digesters
// =============================================================================

/// Incremental sha256 digester.
#[derive(Default, Clone)]
pub struct Digester {
    hasher: Sha256,
    size: u64,
}

impl Digester {
    /// Creates an empty digester.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds bytes into the hash.
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.size += data.len() as u64;
    }

    /// Number of bytes hashed so far.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns the digest of everything hashed so far.
    pub fn digest(&self) -> Digest {
        Digest::from_sha256(self.hasher.clone().finalize().as_slice())
    }
}

/// Reader adapter that hashes everything read through it.
pub struct DigestReader<R> {
    inner: R,
    digester: Digester,
}

impl<R: Read> DigestReader<R> {
    /// Wraps `inner`.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            digester: Digester::new(),
        }
    }

    /// Bytes read so far.
    pub fn size(&self) -> u64 {
        self.digester.size()
    }

    /// Digest of the bytes read so far.
    pub fn digest(&self) -> Digest {
        self.digester.digest()
    }

    /// Reads the remainder of the stream so the digest covers all of it.
    pub fn drain(&mut self) -> io::Result<u64> {
        io::copy(self, &mut io::sink())
    }
}

impl<R: Read> Read for DigestReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.digester.update(&buf[..n]);
        Ok(n)
    }
}

/// Writer adapter that hashes everything written through it.
pub struct DigestWriter<W> {
    inner: W,
    digester: Digester,
}

impl<W: Write> DigestWriter<W> {
    /// Wraps `inner`.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            digester: Digester::new(),
        }
    }

    /// Bytes written so far.
    pub fn size(&self) -> u64 {
        self.digester.size()
    }

    /// Digest of the bytes written so far.
    pub fn digest(&self) -> Digest {
        self.digester.digest()
    }

    /// Returns the wrapped writer.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.digester.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

// =============================================================================
// Chain IDs
// =============================================================================

/// Returns the chain ID for an ordered list of diff IDs, or `None` when the
/// list is empty.
pub fn chain_id(diff_ids: &[Digest]) -> Option<Digest> {
    chain_ids(diff_ids).pop()
}

/// Returns the chain ID of every prefix of `diff_ids`.
///
/// `chain_ids(d)[i]` names the snapshot holding layers `0..=i`.
pub fn chain_ids(diff_ids: &[Digest]) -> Vec<Digest> {
    let mut out: Vec<Digest> = Vec::with_capacity(diff_ids.len());
    for diff in diff_ids {
        let next = match out.last() {
            None => diff.clone(),
            Some(parent) => Digest::from_bytes(format!("{} {}", parent, diff).as_bytes()),
        };
        out.push(next);
    }
    out
}
