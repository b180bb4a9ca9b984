// Tree diffing over flattened trees.
//
// A diff is an ordered list of path-level changes that transforms one tree
// into another: apply_to(diff(a, b), a) == b. Entries are sorted by path so
// the same pair of trees always produces the same diff. Directories appear
// as NewDir/DeletedDir; content changes inside a directory surface on the
// files themselves, and every tree hash is recomputed when a diff is folded
// back into nested tree objects.

use std::collections::{BTreeMap, BTreeSet};

use crate::errors::Result;
use crate::hash::ObjectHash;
use crate::object::ObjectKind;
use crate::store::ObjectStore;
use crate::tree::{Tree, TreeEntry};

pub type FlatTree = BTreeMap<String, TreeEntry>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffEntry {
    NewFile { path: String, entry: TreeEntry },
    NewDir { path: String },
    DeletedFile { path: String, from: ObjectHash },
    DeletedDir { path: String },
    Modified {
        path: String,
        from: ObjectHash,
        entry: TreeEntry,
    },
}

impl DiffEntry {
    pub fn path(&self) -> &str {
        match self {
            DiffEntry::NewFile { path, .. }
            | DiffEntry::NewDir { path }
            | DiffEntry::DeletedFile { path, .. }
            | DiffEntry::DeletedDir { path }
            | DiffEntry::Modified { path, .. } => path,
        }
    }

    /// The entry this change installs, if any.
    pub fn target(&self) -> Option<&TreeEntry> {
        match self {
            DiffEntry::NewFile { entry, .. } | DiffEntry::Modified { entry, .. } => Some(entry),
            _ => None,
        }
    }

    pub fn is_deletion(&self) -> bool {
        matches!(
            self,
            DiffEntry::DeletedFile { .. } | DiffEntry::DeletedDir { .. }
        )
    }

    /// One-letter tag for status output.
    pub fn tag(&self) -> char {
        match self {
            DiffEntry::NewFile { .. } | DiffEntry::NewDir { .. } => 'N',
            DiffEntry::DeletedFile { .. } | DiffEntry::DeletedDir { .. } => 'D',
            DiffEntry::Modified { .. } => 'U',
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeDiff {
    /// Sorted by path.
    pub entries: Vec<DiffEntry>,
}

impl TreeDiff {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DiffEntry> {
        self.entries.iter()
    }
}

/// Compute the changes that turn `a` into `b`.
pub fn diff_two_trees(a: &FlatTree, b: &FlatTree) -> TreeDiff {
    let paths: BTreeSet<&String> = a.keys().chain(b.keys()).collect();

    let mut entries = Vec::new();
    for path in paths {
        match (a.get(path), b.get(path)) {
            (Some(old), None) => entries.push(deletion(path, old)),
            (None, Some(new)) => entries.push(addition(path, new)),
            (Some(old), Some(new)) => {
                if old.is_dir() && new.is_dir() {
                    // Subtree changes surface on the children.
                    continue;
                }
                if old.is_dir() != new.is_dir() {
                    entries.push(deletion(path, old));
                    entries.push(addition(path, new));
                    continue;
                }
                if old.hash != new.hash || old.mode != new.mode || old.large != new.large {
                    entries.push(DiffEntry::Modified {
                        path: path.clone(),
                        from: old.hash,
                        entry: *new,
                    });
                }
            }
            (None, None) => unreachable!(),
        }
    }

    TreeDiff { entries }
}

fn addition(path: &str, entry: &TreeEntry) -> DiffEntry {
    if entry.is_dir() {
        DiffEntry::NewDir {
            path: path.to_string(),
        }
    } else {
        DiffEntry::NewFile {
            path: path.to_string(),
            entry: *entry,
        }
    }
}

fn deletion(path: &str, entry: &TreeEntry) -> DiffEntry {
    if entry.is_dir() {
        DiffEntry::DeletedDir {
            path: path.to_string(),
        }
    } else {
        DiffEntry::DeletedFile {
            path: path.to_string(),
            from: entry.hash,
        }
    }
}

/// Interpret a diff as a mutation over a flat tree, without touching the
/// store. Directory hashes are left stale; folding recomputes them.
pub fn apply_to_flat(diff: &TreeDiff, base: &FlatTree) -> FlatTree {
    let mut flat = base.clone();
    for change in &diff.entries {
        match change {
            DiffEntry::NewFile { path, entry } | DiffEntry::Modified { path, entry, .. } => {
                flat.insert(path.clone(), *entry);
            }
            DiffEntry::NewDir { path } => {
                flat.insert(path.clone(), TreeEntry::dir(ObjectHash::ZERO));
            }
            DiffEntry::DeletedFile { path, .. } => {
                flat.remove(path);
            }
            DiffEntry::DeletedDir { path } => {
                flat.remove(path);
                // A deleted directory takes anything still under it along.
                let prefix = format!("{path}/");
                flat.retain(|p, _| !p.starts_with(&prefix));
            }
        }
    }
    flat
}

/// Re-fold a flat tree into nested Tree objects bottom-up, writing each tree
/// to the store. Returns the new root tree hash.
pub fn fold_flat(flat: &FlatTree, store: &ObjectStore) -> Result<ObjectHash> {
    fold_dir(flat, store, "")
}

fn fold_dir(flat: &FlatTree, store: &ObjectStore, prefix: &str) -> Result<ObjectHash> {
    // Direct children of `prefix`; a name maps to None when it only exists
    // as an intermediate path component.
    let mut children: BTreeMap<&str, Option<TreeEntry>> = BTreeMap::new();
    for (path, entry) in flat {
        let rest = if prefix.is_empty() {
            path.as_str()
        } else if let Some(rest) = path.strip_prefix(prefix).and_then(|r| r.strip_prefix('/')) {
            rest
        } else {
            continue;
        };

        match rest.split_once('/') {
            None => {
                children.insert(rest, Some(*entry));
            }
            Some((first, _)) => {
                children.entry(first).or_insert(None);
            }
        }
    }

    let mut tree = Tree::new();
    for (name, entry) in children {
        let child_path = if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{prefix}/{name}")
        };

        match entry {
            Some(e) if !e.is_dir() => tree.insert(name, e)?,
            _ => {
                let sub_hash = fold_dir(flat, store, &child_path)?;
                tree.insert(name, TreeEntry::dir(sub_hash))?;
            }
        }
    }

    store.add(ObjectKind::Tree, &tree.to_bytes())
}

/// Apply a diff to a flat base tree and store the resulting tree objects.
pub fn apply_to(diff: &TreeDiff, base: &FlatTree, store: &ObjectStore) -> Result<ObjectHash> {
    fold_flat(&apply_to_flat(diff, base), store)
}
