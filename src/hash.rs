// Content addressing: every object is identified by the SHA-256 of its
// canonical payload bytes. The all-zero hash is the "no commit" sentinel and
// never names a stored object.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::errors::{Error, Result};

pub const HASH_LEN: usize = 32;

/// 32-byte SHA-256 identity of an object.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectHash(pub [u8; HASH_LEN]);

impl ObjectHash {
    /// The empty sentinel: denotes "no commit" when used as a parent or head.
    pub const ZERO: ObjectHash = ObjectHash([0u8; HASH_LEN]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; HASH_LEN]
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Render as 64 lowercase hex characters.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<ObjectHash> {
        let bytes = hex::decode(s).map_err(|e| Error::parse(format!("bad hash hex: {e}")))?;
        if bytes.len() != HASH_LEN {
            return Err(Error::parse(format!(
                "bad hash length: expected {HASH_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut hash = [0u8; HASH_LEN];
        hash.copy_from_slice(&bytes);
        Ok(ObjectHash(hash))
    }

    /// First eight hex characters, for human-facing output.
    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }
}

impl fmt::Display for ObjectHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectHash({})", self.to_hex())
    }
}

/// Hash arbitrary bytes.
#[inline]
pub fn hash_bytes(data: &[u8]) -> ObjectHash {
    let digest = Sha256::digest(data);
    ObjectHash(digest.into())
}

/// Hash a file's contents without loading it whole into memory.
pub fn hash_file(path: &Path) -> Result<ObjectHash> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();

    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(ObjectHash(hasher.finalize().into()))
}
