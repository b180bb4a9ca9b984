// Local object store: a persistent map from hash to (info, payload) under
// <repo>/.ori/objs/XX/YY/<hex>, where XX/YY are the first two byte-pairs of
// the hex digest. Each file is the 42-byte info header followed by the
// payload, compressed when the header says so.
//
// Writes are crash-safe: stage in the store's tmp directory, fsync, rename
// into place, fsync the containing directory. Content addressing makes adds
// idempotent; an object that is already present is never rewritten.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::debug;

use crate::errors::{Error, Result};
use crate::hash::{hash_bytes, ObjectHash};
use crate::object::{Object, ObjectInfo, ObjectKind, INFO_SIZE};

/// Payloads below this size are stored uncompressed; compression overhead
/// outweighs the savings.
const COMPRESS_MIN: usize = 512;
const ZSTD_LEVEL: i32 = 3;

pub struct ObjectStore {
    objs_dir: PathBuf,
    tmp_dir: PathBuf,
}

impl ObjectStore {
    /// Create the store's directories under an `.ori` directory.
    pub fn init(ori_dir: &Path) -> Result<ObjectStore> {
        let store = Self::open(ori_dir);
        fs::create_dir_all(&store.objs_dir)?;
        fs::create_dir_all(&store.tmp_dir)?;
        Ok(store)
    }

    pub fn open(ori_dir: &Path) -> ObjectStore {
        ObjectStore {
            objs_dir: ori_dir.join("objs"),
            tmp_dir: ori_dir.join("tmp"),
        }
    }

    fn object_path(&self, hash: &ObjectHash) -> PathBuf {
        let hex = hash.to_hex();
        self.objs_dir.join(&hex[0..2]).join(&hex[2..4]).join(hex)
    }

    /// Hash and store a payload. Idempotent; returns the payload's hash.
    pub fn add(&self, kind: ObjectKind, payload: &[u8]) -> Result<ObjectHash> {
        let hash = hash_bytes(payload);
        let info = ObjectInfo::new(kind, hash, payload.len() as u64);
        self.add_with_info(info, payload)?;
        Ok(hash)
    }

    /// Store a payload under a caller-supplied header. Fails with a corrupt
    /// object error when the payload does not hash to `info.hash`.
    pub fn add_with_info(&self, mut info: ObjectInfo, payload: &[u8]) -> Result<()> {
        if hash_bytes(payload) != info.hash {
            return Err(Error::corrupt(info.hash, "payload does not match hash"));
        }
        if self.has(&info.hash) {
            return Ok(());
        }

        info.payload_size = payload.len() as u64;

        let mut body = payload;
        let compressed;
        if payload.len() >= COMPRESS_MIN {
            compressed = zstd::encode_all(payload, ZSTD_LEVEL)?;
            if compressed.len() < payload.len() {
                info.compressed = true;
                body = &compressed;
            } else {
                info.compressed = false;
            }
        } else {
            info.compressed = false;
        }

        self.write_object_file(&info, body)
    }

    /// Store an object in its transfer form: the payload bytes exactly as
    /// another store has them on disk (compressed when the header says so).
    /// The object is verified before it becomes visible to readers.
    pub fn add_raw(&self, info: &ObjectInfo, stored: &[u8]) -> Result<()> {
        let payload = decode_payload(info, stored)?;
        if hash_bytes(&payload) != info.hash {
            return Err(Error::corrupt(info.hash, "transferred payload does not match hash"));
        }
        if self.has(&info.hash) {
            return Ok(());
        }
        self.write_object_file(info, stored)
    }

    fn write_object_file(&self, info: &ObjectInfo, body: &[u8]) -> Result<()> {
        let path = self.object_path(&info.hash);
        let dir = path.parent().expect("object path has a parent");
        fs::create_dir_all(dir)?;

        let mut tmp = NamedTempFile::new_in(&self.tmp_dir)?;
        tmp.write_all(&info.to_bytes())?;
        tmp.write_all(body)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| Error::Io(e.error))?;

        // Durable before the head can ever reference it.
        File::open(dir)?.sync_all()?;

        debug!(hash = %info.hash, kind = info.kind.name(), size = info.payload_size, "stored object");
        Ok(())
    }

    /// Load and decompress an object. In debug builds the payload is
    /// re-hashed on every read.
    pub fn get(&self, hash: &ObjectHash) -> Result<Object> {
        let (info, stored) = self.read_stored(hash)?;
        let payload = decode_payload(&info, &stored)?;

        debug_assert_eq!(hash_bytes(&payload), info.hash, "object {hash} corrupt on read");

        Ok(Object { info, payload })
    }

    pub fn get_info(&self, hash: &ObjectHash) -> Result<ObjectInfo> {
        let path = self.object_path(hash);
        let mut file = File::open(&path).map_err(|e| self.map_open_error(hash, e))?;
        let mut header = [0u8; INFO_SIZE];
        file.read_exact(&mut header)?;
        let info = ObjectInfo::from_bytes(&header)?;
        if info.hash != *hash {
            return Err(Error::corrupt(*hash, "stored header names a different hash"));
        }
        Ok(info)
    }

    /// Header plus the payload in stored (possibly compressed) form, for
    /// transfer to another repository.
    pub fn read_stored(&self, hash: &ObjectHash) -> Result<(ObjectInfo, Vec<u8>)> {
        let path = self.object_path(hash);
        let mut file = File::open(&path).map_err(|e| self.map_open_error(hash, e))?;

        let mut header = [0u8; INFO_SIZE];
        file.read_exact(&mut header)?;
        let info = ObjectInfo::from_bytes(&header)?;
        if info.hash != *hash {
            return Err(Error::corrupt(*hash, "stored header names a different hash"));
        }

        let mut body = Vec::new();
        file.read_to_end(&mut body)?;
        Ok((info, body))
    }

    fn map_open_error(&self, hash: &ObjectHash, e: std::io::Error) -> Error {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NotFound(*hash)
        } else {
            Error::Io(e)
        }
    }

    /// Filesystem-stat presence check; never reads the payload.
    pub fn has(&self, hash: &ObjectHash) -> bool {
        self.object_path(hash).exists()
    }

    /// Enumerate every stored object's header.
    pub fn list(&self) -> Result<BTreeSet<ObjectInfo>> {
        let mut infos = BTreeSet::new();
        if !self.objs_dir.exists() {
            return Ok(infos);
        }

        for first in fs::read_dir(&self.objs_dir)? {
            let first = first?.path();
            if !first.is_dir() {
                continue;
            }
            for second in fs::read_dir(&first)? {
                let second = second?.path();
                if !second.is_dir() {
                    continue;
                }
                for entry in fs::read_dir(&second)? {
                    let path = entry?.path();
                    if !path.is_file() {
                        continue;
                    }
                    let mut file = File::open(&path)?;
                    let mut header = [0u8; INFO_SIZE];
                    file.read_exact(&mut header)?;
                    infos.insert(ObjectInfo::from_bytes(&header)?);
                }
            }
        }
        Ok(infos)
    }

    /// Re-hash a stored payload, reporting corruption as an error.
    pub fn verify(&self, hash: &ObjectHash) -> Result<()> {
        let (info, stored) = self.read_stored(hash)?;
        let payload = decode_payload(&info, &stored)?;
        if hash_bytes(&payload) != info.hash {
            return Err(Error::corrupt(*hash, "payload does not hash to id"));
        }
        Ok(())
    }

    /// Remove an object file. The caller is responsible for proving the
    /// object is unreachable first. Returns whether the object existed.
    pub fn purge(&self, hash: &ObjectHash) -> Result<bool> {
        let path = self.object_path(hash);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }
}

fn decode_payload(info: &ObjectInfo, stored: &[u8]) -> Result<Vec<u8>> {
    let payload = if info.compressed {
        zstd::decode_all(stored)
            .map_err(|e| Error::corrupt(info.hash, format!("decompression failed: {e}")))?
    } else {
        stored.to_vec()
    };

    if payload.len() as u64 != info.payload_size {
        return Err(Error::corrupt(
            info.hash,
            format!(
                "payload is {} bytes, header says {}",
                payload.len(),
                info.payload_size
            ),
        ));
    }
    Ok(payload)
}
