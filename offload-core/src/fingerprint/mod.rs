//! Content fingerprints: 32-byte SHA-256 digests with streaming hashing
//! through a reusable per-thread buffer.

mod index;
mod store;

pub use index::FingerprintIndex;
pub use store::{IndexPersistence, IndexStore};

use std::cell::RefCell;
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};

/// SHA-256 digest of a file's full contents. Equality is byte-wise; there is
/// deliberately no ordering.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; Self::LEN]);

impl Fingerprint {
    /// Digest width in bytes.
    pub const LEN: usize = 32;

    pub fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; Self::LEN]>::try_from(bytes).ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }

    /// Digest of an in-memory buffer.
    pub fn of_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({}..)", &hex::encode(&self.0[..4]))
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

thread_local! {
    static HASH_BUFFER: RefCell<Vec<u8>> = const { RefCell::new(Vec::new()) };
}

const MIN_BUFFER_SIZE: usize = 4096;

/// Run `f` with this thread's reusable hash buffer.
///
/// The buffer is sized on first use and zeroed again on every exit path,
/// including panics and early returns inside `f`.
pub fn with_hash_buffer<T>(size: usize, f: impl FnOnce(&mut [u8]) -> T) -> T {
    HASH_BUFFER.with(|cell| {
        let mut buffer = cell.borrow_mut();
        if buffer.is_empty() {
            buffer.resize(size.max(MIN_BUFFER_SIZE), 0);
        }

        struct ResetOnExit<'a>(&'a mut Vec<u8>);
        impl Drop for ResetOnExit<'_> {
            fn drop(&mut self) {
                self.0.fill(0);
            }
        }

        let mut guard = ResetOnExit(&mut buffer);
        f(guard.0.as_mut_slice())
    })
}

/// Stream a file through SHA-256. Returns the digest and the byte count.
pub fn fingerprint_file(path: &Path, buffer_size: usize) -> io::Result<(Fingerprint, u64)> {
    let mut file = File::open(path)?;
    with_hash_buffer(buffer_size, |buffer| {
        let mut hasher = Sha256::new();
        let mut total = 0u64;
        loop {
            let read = file.read(buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
            total += read as u64;
        }
        Ok((Fingerprint(hasher.finalize().into()), total))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn empty_input_hashes_to_the_well_known_digest() {
        assert_eq!(Fingerprint::of_bytes(b"").to_string(), EMPTY_SHA256);
    }

    #[test]
    fn zero_byte_file_matches_empty_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.bin");
        File::create(&path).unwrap();

        let (fingerprint, size) = fingerprint_file(&path, 8192).unwrap();
        assert_eq!(size, 0);
        assert_eq!(fingerprint.to_string(), EMPTY_SHA256);
    }

    #[test]
    fn file_digest_matches_in_memory_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let payload = vec![7u8; 100_000];
        File::create(&path)
            .unwrap()
            .write_all(&payload)
            .unwrap();

        // Buffer smaller than the payload forces multiple read iterations.
        let (fingerprint, size) = fingerprint_file(&path, 4096).unwrap();
        assert_eq!(size, payload.len() as u64);
        assert_eq!(fingerprint, Fingerprint::of_bytes(&payload));
    }

    #[test]
    fn buffer_is_zeroed_after_use() {
        with_hash_buffer(4096, |buffer| buffer.fill(0xAB));
        with_hash_buffer(4096, |buffer| {
            assert!(buffer.iter().all(|b| *b == 0));
        });
    }

    #[test]
    fn from_slice_rejects_wrong_width() {
        assert!(Fingerprint::from_slice(&[0u8; 31]).is_none());
        assert!(Fingerprint::from_slice(&[0u8; 32]).is_some());
    }
}
