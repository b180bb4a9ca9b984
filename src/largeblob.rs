// LargeBlob manifests. A file over the large-file threshold is split by the
// content-defined chunker; each chunk is stored as an ordinary Blob and the
// manifest records (chunk hash, chunk length) in file order plus the SHA-256
// of the whole file. Part offsets are implicit prefix sums of the lengths.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use crate::chunker::Chunker;
use crate::errors::{Error, Result};
use crate::hash::{hash_bytes, hash_file, ObjectHash};
use crate::object::ObjectKind;
use crate::store::ObjectStore;
use crate::stream::{ByteReader, ByteWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LargeBlobPart {
    /// Byte offset of this chunk within the reconstructed file.
    pub offset: u64,
    pub hash: ObjectHash,
    pub length: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LargeBlob {
    /// SHA-256 of the reconstructed file.
    pub total_hash: ObjectHash,
    /// Parts ordered by offset.
    pub parts: Vec<LargeBlobPart>,
}

impl LargeBlob {
    pub fn total_size(&self) -> u64 {
        self.parts
            .last()
            .map(|p| p.offset + u64::from(p.length))
            .unwrap_or(0)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut w = ByteWriter::new(&mut buf);
        w.write_hash(&self.total_hash).unwrap();
        w.write_varint(self.parts.len() as u64).unwrap();
        for part in &self.parts {
            w.write_hash(&part.hash).unwrap();
            w.write_u16(part.length).unwrap();
        }
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<LargeBlob> {
        let mut r = ByteReader::new(bytes);
        let total_hash = r.read_hash()?;
        let count = r.read_varint()?;

        let mut parts = Vec::with_capacity(count as usize);
        let mut offset = 0u64;
        for _ in 0..count {
            let hash = r.read_hash()?;
            let length = r.read_u16()?;
            parts.push(LargeBlobPart {
                offset,
                hash,
                length,
            });
            offset += u64::from(length);
        }

        Ok(LargeBlob { total_hash, parts })
    }

    pub fn hash(&self) -> ObjectHash {
        hash_bytes(&self.to_bytes())
    }

    /// Split a file into chunks, store each chunk as a Blob, and build the
    /// manifest. Duplicate chunks deduplicate naturally through content
    /// addressing.
    pub fn chunk_file(store: &ObjectStore, path: &Path) -> Result<LargeBlob> {
        let total_hash = hash_file(path)?;
        let file = File::open(path)?;

        let mut parts = Vec::new();
        let mut offset = 0u64;
        for chunk in Chunker::new(file) {
            let chunk = chunk?;
            let length = chunk.len() as u16;
            let hash = store.add(ObjectKind::Blob, &chunk)?;
            parts.push(LargeBlobPart {
                offset,
                hash,
                length,
            });
            offset += u64::from(length);
        }

        Ok(LargeBlob { total_hash, parts })
    }

    /// Build the manifest for a file without storing anything: chunk hashes
    /// are computed and discarded. Used to detect changes cheaply.
    pub fn scan_file(path: &Path) -> Result<LargeBlob> {
        let total_hash = hash_file(path)?;
        let file = File::open(path)?;

        let mut parts = Vec::new();
        let mut offset = 0u64;
        for chunk in Chunker::new(file) {
            let chunk = chunk?;
            let length = chunk.len() as u16;
            parts.push(LargeBlobPart {
                offset,
                hash: hash_bytes(&chunk),
                length,
            });
            offset += u64::from(length);
        }

        Ok(LargeBlob { total_hash, parts })
    }

    /// Reassemble the file at `path` from stored chunks.
    pub fn extract_file(&self, store: &ObjectStore, path: &Path) -> Result<()> {
        let mut file = File::create(path)?;
        for part in &self.parts {
            let object = store.get(&part.hash)?;
            if object.payload.len() != usize::from(part.length) {
                return Err(Error::corrupt(
                    part.hash,
                    format!(
                        "chunk is {} bytes, manifest says {}",
                        object.payload.len(),
                        part.length
                    ),
                ));
            }
            file.write_all(&object.payload)?;
        }
        file.sync_all()?;

        debug_assert_eq!(
            hash_file(path)?,
            self.total_hash,
            "extracted file does not hash to the manifest total"
        );
        Ok(())
    }

    /// Read up to `size` bytes starting at `off`, crossing part boundaries as
    /// needed. Returns an empty buffer past end of file.
    pub fn read_at(&self, store: &ObjectStore, off: u64, size: usize) -> Result<Vec<u8>> {
        if off >= self.total_size() || size == 0 {
            return Ok(Vec::new());
        }

        // Largest part offset <= off.
        let mut index = self.parts.partition_point(|p| p.offset <= off) - 1;

        let mut out = Vec::with_capacity(size);
        let mut pos = off;
        while out.len() < size && index < self.parts.len() {
            let part = &self.parts[index];
            let part_off = (pos - part.offset) as usize;

            let object = store.get(&part.hash)?;
            let available = &object.payload[part_off..];
            let want = size - out.len();
            let take = want.min(available.len());
            out.extend_from_slice(&available[..take]);

            pos += take as u64;
            index += 1;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn pseudo_random(len: usize, seed: u64) -> Vec<u8> {
        let mut state = seed | 1;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect()
    }

    fn setup_with_file(len: usize) -> (TempDir, ObjectStore, Vec<u8>, LargeBlob) {
        let dir = TempDir::new().unwrap();
        let store = ObjectStore::init(&dir.path().join(".ori")).unwrap();

        let data = pseudo_random(len, 1234);
        let path = dir.path().join("input.bin");
        fs::write(&path, &data).unwrap();

        let blob = LargeBlob::chunk_file(&store, &path).unwrap();
        (dir, store, data, blob)
    }

    #[test]
    fn manifest_round_trip() {
        let (_dir, _store, _data, blob) = setup_with_file(200 * 1024);
        let parsed = LargeBlob::from_bytes(&blob.to_bytes()).unwrap();
        assert_eq!(parsed, blob);
    }

    #[test]
    fn total_hash_covers_whole_file() {
        let (_dir, _store, data, blob) = setup_with_file(150 * 1024);
        assert_eq!(blob.total_hash, hash_bytes(&data));
        assert_eq!(blob.total_size(), data.len() as u64);
    }

    #[test]
    fn extract_reproduces_the_file() {
        let (dir, store, data, blob) = setup_with_file(300 * 1024);

        let out = dir.path().join("output.bin");
        blob.extract_file(&store, &out).unwrap();
        assert_eq!(fs::read(&out).unwrap(), data);
    }

    #[test]
    fn chunking_twice_reuses_every_chunk() {
        let dir = TempDir::new().unwrap();
        let store = ObjectStore::init(&dir.path().join(".ori")).unwrap();

        let data = pseudo_random(120 * 1024, 77);
        let path = dir.path().join("file.bin");
        fs::write(&path, &data).unwrap();

        let first = LargeBlob::chunk_file(&store, &path).unwrap();
        let second = LargeBlob::chunk_file(&store, &path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn scan_matches_chunking() {
        let dir = TempDir::new().unwrap();
        let store = ObjectStore::init(&dir.path().join(".ori")).unwrap();

        let data = pseudo_random(90 * 1024, 55);
        let path = dir.path().join("file.bin");
        fs::write(&path, &data).unwrap();

        let scanned = LargeBlob::scan_file(&path).unwrap();
        // scan_file leaves nothing in the store.
        assert!(!store.has(&scanned.parts[0].hash));

        let stored = LargeBlob::chunk_file(&store, &path).unwrap();
        assert_eq!(scanned, stored);
    }

    #[test]
    fn read_at_middle_and_across_parts() {
        let (_dir, store, data, blob) = setup_with_file(100 * 1024);

        // A range chosen to straddle at least one chunk boundary.
        let off = 5000u64;
        let len = 20_000usize;
        let got = blob.read_at(&store, off, len).unwrap();
        assert_eq!(got, &data[off as usize..off as usize + len]);
    }

    #[test]
    fn read_at_clamps_at_eof() {
        let (_dir, store, data, blob) = setup_with_file(50 * 1024);

        let off = data.len() as u64 - 100;
        let got = blob.read_at(&store, off, 1000).unwrap();
        assert_eq!(got, &data[data.len() - 100..]);

        assert!(blob
            .read_at(&store, data.len() as u64 + 1, 10)
            .unwrap()
            .is_empty());
    }
}
