// Cached working-directory metadata, used to skip rehashing files whose size
// and mtime have not changed since the last commit or checkout. Losing this
// cache is harmless; every lookup miss just falls back to hashing.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

use crate::errors::{Error, Result};
use crate::hash::ObjectHash;
use crate::stream::{ByteReader, ByteWriter};

const MAGIC: &[u8; 4] = b"ODS1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirstateEntry {
    pub size: u64,
    pub mtime_sec: u64,
    pub mtime_nsec: u32,
    pub hash: ObjectHash,
    pub large: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Dirstate {
    pub entries: BTreeMap<String, DirstateEntry>,
}

impl Dirstate {
    /// Load the cache; a missing file is an empty cache.
    pub fn load(path: &Path) -> Result<Dirstate> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Dirstate::default()),
            Err(e) => return Err(e.into()),
        };

        let mut r = ByteReader::new(file);
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(Error::parse("dirstate has wrong magic"));
        }

        let count = r.read_u32()?;
        let mut entries = BTreeMap::new();
        for _ in 0..count {
            let path = r.read_pstr()?;
            let size = r.read_u64()?;
            let mtime_sec = r.read_u64()?;
            let mtime_nsec = r.read_u32()?;
            let hash = r.read_hash()?;
            let large = r.read_u8()? != 0;
            entries.insert(
                path,
                DirstateEntry {
                    size,
                    mtime_sec,
                    mtime_nsec,
                    hash,
                    large,
                },
            );
        }

        Ok(Dirstate { entries })
    }

    /// Atomically replace the cache file.
    pub fn save(&self, path: &Path, tmp_dir: &Path) -> Result<()> {
        let mut tmp = NamedTempFile::new_in(tmp_dir)?;
        {
            let mut w = ByteWriter::new(&mut tmp);
            w.write_all(MAGIC)?;
            w.write_u32(self.entries.len() as u32)?;
            for (path, entry) in &self.entries {
                w.write_pstr(path)?;
                w.write_u64(entry.size)?;
                w.write_u64(entry.mtime_sec)?;
                w.write_u32(entry.mtime_nsec)?;
                w.write_hash(&entry.hash)?;
                w.write_u8(entry.large as u8)?;
            }
        }
        tmp.flush()?;
        tmp.persist(path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    /// Cached hash for a path, valid only when size and mtime still match.
    pub fn cached(&self, path: &str, size: u64, mtime_sec: u64, mtime_nsec: u32) -> Option<(ObjectHash, bool)> {
        let entry = self.entries.get(path)?;
        if entry.size == size && entry.mtime_sec == mtime_sec && entry.mtime_nsec == mtime_nsec {
            Some((entry.hash, entry.large))
        } else {
            None
        }
    }

    pub fn record(&mut self, path: String, entry: DirstateEntry) {
        self.entries.insert(path, entry);
    }
}
