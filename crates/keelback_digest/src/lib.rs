#![deny(missing_docs)]

//! Content digests for conda artifacts.
//!
//! Repodata payloads, package archives, and linked files are all identified by
//! cryptographic digests somewhere in the pipeline. This crate provides the
//! typed aliases used throughout the keelback workspace together with a few
//! helpers to compute them from files, byte slices, and IO streams. All
//! hashing goes through the [RustCrypto/hashes](https://github.com/RustCrypto/hashes)
//! [`Digest`] trait so call sites pick the algorithm through a type parameter.
//!
//! ```no_run
//! use keelback_digest::{digest_bytes, digest_file, Md5, Sha256};
//!
//! let md5 = digest_bytes::<Md5>("some repodata");
//! let sha = digest_file::<Sha256>("pkg-1.0-0.tar.bz2").unwrap();
//! println!("{md5:x} {sha:x}");
//! ```

#[cfg(feature = "serde")]
pub mod serde;

use std::{
    fs::File,
    io::{Read, Write},
    path::Path,
};

use blake2::{digest::consts::U32, Blake2b};
pub use digest;
use digest::{Digest, Output};
pub use md5::Md5;
pub use sha2::Sha256;

/// Output of an MD5 hash.
pub type Md5Hash = digest::Output<Md5>;

/// Output of a SHA256 hash.
pub type Sha256Hash = digest::Output<Sha256>;

/// Blake2b with a 256 bit output, the digest used by the JLAP checksum chain.
pub type Blake2b256 = Blake2b<U32>;

/// Output of a [`Blake2b256`] hash.
pub type Blake2b256Hash = digest::Output<Blake2b256>;

/// Computes the digest of the file at the given path by streaming its
/// contents through the hasher.
pub fn digest_file<D: Digest + Default + Write>(
    path: impl AsRef<Path>,
) -> Result<Output<D>, std::io::Error> {
    let mut file = File::open(path)?;
    let mut hasher = D::default();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize())
}

/// Computes the digest of a slice of bytes.
pub fn digest_bytes<D: Digest + Default>(bytes: impl AsRef<[u8]>) -> Output<D> {
    let mut hasher = D::default();
    hasher.update(bytes);
    hasher.finalize()
}

/// Parses a lowercase or uppercase hex string into a digest. Returns `None`
/// when the string has the wrong length or contains non-hex characters.
pub fn parse_hex_digest<D: Digest>(hex_str: &str) -> Option<Output<D>> {
    let mut out = <Output<D>>::default();
    hex::decode_to_slice(hex_str, &mut out).ok()?;
    Some(out)
}

/// A reader adapter that hashes every byte that passes through it.
///
/// Used while streaming package downloads to disk so the checksum is known the
/// moment the transfer completes, without a second pass over the file.
pub struct DigestingReader<R, D: Digest> {
    inner: R,
    hasher: D,
}

impl<R, D: Digest + Default> DigestingReader<R, D> {
    /// Wraps a reader with a fresh hasher.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: D::default(),
        }
    }
}

impl<R, D: Digest> DigestingReader<R, D> {
    /// Returns the wrapped reader and the digest of everything read so far.
    pub fn finalize(self) -> (R, Output<D>) {
        (self.inner, self.hasher.finalize())
    }
}

impl<R: Read, D: Digest> Read for DigestingReader<R, D> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

/// A writer adapter that hashes every byte that passes through it.
pub struct DigestingWriter<W, D: Digest> {
    inner: W,
    hasher: D,
}

impl<W, D: Digest + Default> DigestingWriter<W, D> {
    /// Wraps a writer with a fresh hasher.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: D::default(),
        }
    }
}

impl<W, D: Digest> DigestingWriter<W, D> {
    /// Returns the wrapped writer and the digest of everything written so far.
    pub fn finalize(self) -> (W, Output<D>) {
        (self.inner, self.hasher.finalize())
    }
}

impl<W: Write, D: Digest> Write for DigestingWriter<W, D> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod test {
    use std::io::Read;

    use rstest::rstest;
    use sha2::Sha256;

    use super::{digest_bytes, digest_file, parse_hex_digest, DigestingReader};

    #[rstest]
    #[case(
        "1234567890",
        "c775e7b757ede630cd0aa1113bd102661ab38829ca52a6422ab782862f268646"
    )]
    #[case(
        "Hello, world!",
        "315f5bdb76d078c43b8ac0064e4a0164612b1fce77c869345bfc94c75894edd3"
    )]
    fn sha256_of_file(#[case] input: &str, #[case] expected: &str) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload");
        std::fs::write(&path, input).unwrap();
        let hash = digest_file::<Sha256>(&path).unwrap();
        assert_eq!(format!("{hash:x}"), expected);
    }

    #[test]
    fn digesting_reader_matches_direct_hash() {
        let input = "the quick brown fox";
        let mut reader = DigestingReader::<_, Sha256>::new(std::io::Cursor::new(input));
        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, input);
        let (_, streamed) = reader.finalize();
        assert_eq!(streamed, digest_bytes::<Sha256>(input));
    }

    #[test]
    fn parse_hex_rejects_bad_input() {
        assert!(parse_hex_digest::<Sha256>("abcd").is_none());
        assert!(parse_hex_digest::<Sha256>(
            "zz5f5bdb76d078c43b8ac0064e4a0164612b1fce77c869345bfc94c75894edd3"
        )
        .is_none());
        assert!(parse_hex_digest::<Sha256>(
            "315f5bdb76d078c43b8ac0064e4a0164612b1fce77c869345bfc94c75894edd3"
        )
        .is_some());
    }
}
