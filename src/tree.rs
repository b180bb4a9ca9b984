// Tree objects - directory snapshots.
//
// A tree maps entry names to (kind, mode, target hash). Entries are kept
// sorted by name so serialization is canonical: the same logical directory
// always produces the same bytes, and therefore the same hash. Nested trees
// are separate objects referenced by hash.

use std::collections::BTreeMap;

use crate::errors::{Error, Result};
use crate::hash::{hash_bytes, ObjectHash};
use crate::object::ObjectKind;
use crate::store::ObjectStore;
use crate::stream::{ByteReader, ByteWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File = 0,
    Dir = 1,
    Symlink = 2,
}

impl EntryKind {
    pub fn from_u8(value: u8) -> Result<EntryKind> {
        match value {
            0 => Ok(EntryKind::File),
            1 => Ok(EntryKind::Dir),
            2 => Ok(EntryKind::Symlink),
            k => Err(Error::parse(format!("invalid tree entry kind {k}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeEntry {
    pub kind: EntryKind,
    /// Unix permission bits (0 for symlinks).
    pub mode: u32,
    /// Blob, LargeBlob or Tree hash depending on kind and `large`.
    pub hash: ObjectHash,
    /// For files: the target is a LargeBlob manifest rather than a Blob.
    pub large: bool,
}

impl TreeEntry {
    pub fn file(hash: ObjectHash, mode: u32, large: bool) -> Self {
        Self {
            kind: EntryKind::File,
            mode,
            hash,
            large,
        }
    }

    pub fn dir(hash: ObjectHash) -> Self {
        Self {
            kind: EntryKind::Dir,
            mode: 0o755,
            hash,
            large: false,
        }
    }

    pub fn symlink(hash: ObjectHash) -> Self {
        Self {
            kind: EntryKind::Symlink,
            mode: 0,
            hash,
            large: false,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }
}

/// An ordered set of directory entries. At most one entry per name; names
/// never contain '/'.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tree {
    pub entries: BTreeMap<String, TreeEntry>,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, entry: TreeEntry) -> Result<()> {
        let name = name.into();
        if name.is_empty() || name.contains('/') {
            return Err(Error::parse(format!("invalid tree entry name {name:?}")));
        }
        self.entries.insert(name, entry);
        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut w = ByteWriter::new(&mut buf);
        // Writing into a Vec cannot fail.
        w.write_u32(self.entries.len() as u32).unwrap();
        for (name, entry) in &self.entries {
            w.write_pstr(name).unwrap();
            w.write_u8(entry.kind as u8).unwrap();
            w.write_u32(entry.mode).unwrap();
            w.write_u8(entry.large as u8).unwrap();
            w.write_hash(&entry.hash).unwrap();
        }
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Tree> {
        let mut r = ByteReader::new(bytes);
        let count = r.read_u32()?;

        let mut tree = Tree::new();
        for _ in 0..count {
            let name = r.read_pstr()?;
            let kind = EntryKind::from_u8(r.read_u8()?)?;
            let mode = r.read_u32()?;
            let large = match r.read_u8()? {
                0 => false,
                1 => true,
                f => return Err(Error::parse(format!("invalid large flag {f}"))),
            };
            let hash = r.read_hash()?;
            tree.insert(
                name,
                TreeEntry {
                    kind,
                    mode,
                    hash,
                    large,
                },
            )?;
        }
        Ok(tree)
    }

    pub fn hash(&self) -> ObjectHash {
        hash_bytes(&self.to_bytes())
    }

    /// Expand this tree and every subtree into a path-keyed map. Subtrees
    /// appear as their own entries and contribute their children under
    /// "dir/child" paths.
    pub fn flatten(&self, store: &ObjectStore) -> Result<BTreeMap<String, TreeEntry>> {
        let mut flat = BTreeMap::new();
        self.flatten_into(store, "", &mut flat)?;
        Ok(flat)
    }

    fn flatten_into(
        &self,
        store: &ObjectStore,
        prefix: &str,
        flat: &mut BTreeMap<String, TreeEntry>,
    ) -> Result<()> {
        for (name, entry) in &self.entries {
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}/{name}")
            };

            if entry.is_dir() {
                let object = store.get(&entry.hash)?;
                if object.kind() != ObjectKind::Tree {
                    return Err(Error::corrupt(
                        entry.hash,
                        format!("tree entry {path} points at a {}", object.kind().name()),
                    ));
                }
                let subtree = Tree::from_bytes(&object.payload)?;
                subtree.flatten_into(store, &path, flat)?;
            }
            flat.insert(path, *entry);
        }
        Ok(())
    }
}
