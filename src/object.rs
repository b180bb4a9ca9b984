// Object headers. Every stored object begins with a fixed-width ObjectInfo
// record describing the payload that follows; the payload bytes themselves
// are the canonical form the object's hash is computed over.

use crate::errors::{Error, Result};
use crate::hash::{ObjectHash, HASH_LEN};

/// Serialized size of an [`ObjectInfo`]: kind u8, hash, payload size u64,
/// compression flag u8.
pub const INFO_SIZE: usize = 1 + HASH_LEN + 8 + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectKind {
    Blob = 0,
    LargeBlob = 1,
    Tree = 2,
    Commit = 3,
}

impl ObjectKind {
    pub fn from_u8(value: u8) -> Result<ObjectKind> {
        match value {
            0 => Ok(ObjectKind::Blob),
            1 => Ok(ObjectKind::LargeBlob),
            2 => Ok(ObjectKind::Tree),
            3 => Ok(ObjectKind::Commit),
            k => Err(Error::parse(format!("invalid object kind {k}"))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ObjectKind::Blob => "blob",
            ObjectKind::LargeBlob => "largeblob",
            ObjectKind::Tree => "tree",
            ObjectKind::Commit => "commit",
        }
    }
}

/// Fixed-width metadata record stored ahead of each payload and exchanged
/// verbatim over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectInfo {
    pub kind: ObjectKind,
    pub hash: ObjectHash,
    /// Uncompressed payload size.
    pub payload_size: u64,
    pub compressed: bool,
}

impl ObjectInfo {
    pub fn new(kind: ObjectKind, hash: ObjectHash, payload_size: u64) -> Self {
        Self {
            kind,
            hash,
            payload_size,
            compressed: false,
        }
    }

    pub fn to_bytes(&self) -> [u8; INFO_SIZE] {
        let mut buf = [0u8; INFO_SIZE];
        buf[0] = self.kind as u8;
        buf[1..1 + HASH_LEN].copy_from_slice(self.hash.as_bytes());
        buf[33..41].copy_from_slice(&self.payload_size.to_le_bytes());
        buf[41] = self.compressed as u8;
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<ObjectInfo> {
        if bytes.len() < INFO_SIZE {
            return Err(Error::parse(format!(
                "object info needs {INFO_SIZE} bytes, got {}",
                bytes.len()
            )));
        }

        let kind = ObjectKind::from_u8(bytes[0])?;

        let mut hash = [0u8; HASH_LEN];
        hash.copy_from_slice(&bytes[1..1 + HASH_LEN]);

        let payload_size = u64::from_le_bytes(bytes[33..41].try_into().unwrap());

        let compressed = match bytes[41] {
            0 => false,
            1 => true,
            f => return Err(Error::parse(format!("invalid compression flag {f}"))),
        };

        Ok(ObjectInfo {
            kind,
            hash: ObjectHash(hash),
            payload_size,
            compressed,
        })
    }
}

/// A fully loaded object: header plus decompressed payload bytes.
#[derive(Debug, Clone)]
pub struct Object {
    pub info: ObjectInfo,
    pub payload: Vec<u8>,
}

impl Object {
    pub fn kind(&self) -> ObjectKind {
        self.info.kind
    }

    pub fn hash(&self) -> ObjectHash {
        self.info.hash
    }
}
