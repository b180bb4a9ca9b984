// Commit objects - immutable snapshots with history metadata.
//
// A commit names its tree, up to two parents, the author, a timestamp and a
// message. The second parent is the zero hash except on merge commits.
// Serialization is canonical: fixed field order, fixed integer widths.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::errors::{Error, Result};
use crate::hash::{hash_bytes, ObjectHash};
use crate::stream::{ByteReader, ByteWriter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub parent1: ObjectHash,
    pub parent2: ObjectHash,
    pub tree: ObjectHash,
    pub author: String,
    /// Seconds since the Unix epoch.
    pub time: u64,
    pub message: String,
}

impl Commit {
    pub fn new(
        tree: ObjectHash,
        parent1: ObjectHash,
        parent2: ObjectHash,
        author: String,
        message: String,
    ) -> Self {
        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        Self {
            parent1,
            parent2,
            tree,
            author,
            time,
            message,
        }
    }

    pub fn is_initial(&self) -> bool {
        self.parent1.is_zero()
    }

    pub fn is_merge(&self) -> bool {
        !self.parent2.is_zero()
    }

    /// First line of the message.
    pub fn summary(&self) -> &str {
        self.message.lines().next().unwrap_or("")
    }

    pub fn hash(&self) -> ObjectHash {
        hash_bytes(&self.to_bytes())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut w = ByteWriter::new(&mut buf);
        w.write_hash(&self.parent1).unwrap();
        w.write_hash(&self.parent2).unwrap();
        w.write_hash(&self.tree).unwrap();
        w.write_pstr(&self.author).unwrap();
        w.write_u64(self.time).unwrap();
        w.write_pstr(&self.message).unwrap();
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Commit> {
        let mut r = ByteReader::new(bytes);
        let parent1 = r.read_hash()?;
        let parent2 = r.read_hash()?;
        let tree = r.read_hash()?;
        let author = r.read_pstr()?;
        let time = r.read_u64()?;
        let message = r.read_pstr()?;

        if !parent2.is_zero() && parent1 == parent2 {
            return Err(Error::parse("merge commit with identical parents"));
        }

        Ok(Commit {
            parent1,
            parent2,
            tree,
            author,
            time,
            message,
        })
    }
}
