//! Content digests: MD5, serialized as padding-stripped base64.
//!
//! The canonical on-disk form is 22 characters of standard base64 with the
//! trailing `==` stripped. Lowercase hex (32 characters) is accepted on read
//! for forward compatibility but never written.
//!
//! Streaming I/O ensures constant memory usage regardless of file size.

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use md5::{Digest as _, Md5};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

// 1 MiB: large enough that spinning-disk seeks dominate, small enough to share
const HASH_BUFFER_SIZE: usize = 1024 * 1024;

/// Length of the canonical base64-no-padding serialization.
pub const DIGEST_STR_LEN: usize = 22;

/// Errors produced when parsing a serialized digest
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DigestParseError {
    #[error("digest has length {0}, expected {DIGEST_STR_LEN} (base64) or 32 (hex)")]
    BadLength(usize),

    #[error("digest is not valid base64 or lowercase hex: {0}")]
    BadEncoding(String),
}

/// A 128-bit MD5 content digest.
///
/// Two files with equal digests are treated as byte-identical everywhere in
/// the engine; the (size, digest) pair is the dedup key on destination
/// volumes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; 16]);

impl Digest {
    /// Digest raw bytes held in memory.
    pub fn of_bytes(data: &[u8]) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(data);
        hasher.finalize()
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    fn from_base64(s: &str) -> Result<Self, DigestParseError> {
        let raw = STANDARD_NO_PAD
            .decode(s)
            .map_err(|_| DigestParseError::BadEncoding(s.to_string()))?;
        let bytes: [u8; 16] = raw
            .try_into()
            .map_err(|_| DigestParseError::BadEncoding(s.to_string()))?;
        Ok(Digest(bytes))
    }

    fn from_hex(s: &str) -> Result<Self, DigestParseError> {
        let mut bytes = [0u8; 16];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hi = hex_val(chunk[0]);
            let lo = hex_val(chunk[1]);
            match (hi, lo) {
                (Some(h), Some(l)) => bytes[i] = (h << 4) | l,
                _ => return Err(DigestParseError::BadEncoding(s.to_string())),
            }
        }
        Ok(Digest(bytes))
    }
}

fn hex_val(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        _ => None,
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&STANDARD_NO_PAD.encode(self.0))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({self})")
    }
}

impl FromStr for Digest {
    type Err = DigestParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.len() {
            DIGEST_STR_LEN => Self::from_base64(s),
            32 => Self::from_hex(s),
            n => Err(DigestParseError::BadLength(n)),
        }
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A streaming MD5 hasher.
pub struct Hasher {
    inner: Md5,
}

impl Hasher {
    pub fn new() -> Self {
        Self { inner: Md5::new() }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn finalize(self) -> Digest {
        Digest(self.inner.finalize().into())
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash a file's contents with streaming I/O.
///
/// Reads the file in fixed-size buffers so memory stays constant for files
/// of any size. After each buffer, `progress` is called with the number of
/// bytes just read; the adaptive tuner feeds on these callbacks to measure
/// aggregate hashing throughput.
pub fn hash_file_with_progress<F>(path: &Path, mut progress: F) -> io::Result<Digest>
where
    F: FnMut(usize),
{
    let file = File::open(path)?;
    let mut reader = BufReader::with_capacity(HASH_BUFFER_SIZE, file);
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    let mut hasher = Hasher::new();

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
        progress(bytes_read);
    }

    Ok(hasher.finalize())
}

/// Hash a file's contents without progress reporting.
pub fn hash_file(path: &Path) -> io::Result<Digest> {
    hash_file_with_progress(path, |_| {})
}
