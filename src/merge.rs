// Three-way merge over tree diffs.
//
// Both inputs are diffs from the common ancestor tree to one side. A path
// touched by a single side adopts that side's change; identical edits are
// taken once; everything else is a conflict recorded for the user. The
// engine never merges within a file - conflicting text files get marker
// blocks in the working directory and an external tool (or the user)
// resolves them.
//
// A path can carry more than one diff entry: a kind change (file becomes a
// directory, or the reverse) is a delete plus an add at the same path. The
// merge treats such a pair as one change. When a path conflicts, the merged
// tree keeps the ancestor version there, so anything the diffs would have
// created underneath it (children of a new directory) or deleted above it
// (a directory removal sweeping the path) is held out of the merged diff
// and surfaced as part of the conflict instead of being silently dropped.

use std::collections::{BTreeMap, BTreeSet};

use crate::diff::{apply_to_flat, diff_two_trees, DiffEntry, FlatTree, TreeDiff};
use crate::errors::Result;
use crate::hash::ObjectHash;
use crate::store::ObjectStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub path: String,
    /// Entry hash in the common ancestor, if the path existed there.
    pub base: Option<ObjectHash>,
    /// Hash each side wants; None when that side deleted the path.
    pub ours: Option<ObjectHash>,
    pub theirs: Option<ObjectHash>,
}

#[derive(Debug, Default)]
pub struct MergeOutcome {
    /// The merged changes, as a diff against the common ancestor tree.
    pub merged: TreeDiff,
    pub conflicts: Vec<Conflict>,
}

impl MergeOutcome {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }
}

/// Merge two diffs taken against the same ancestor.
pub fn merge_diffs(ours: &TreeDiff, theirs: &TreeDiff) -> MergeOutcome {
    let our_map = by_path(ours);
    let their_map = by_path(theirs);
    let paths: BTreeSet<&str> = our_map.keys().chain(their_map.keys()).copied().collect();

    let mut merged = Vec::new();
    let mut conflicts = Vec::new();

    for path in paths {
        match (our_map.get(path), their_map.get(path)) {
            (Some(changes), None) | (None, Some(changes)) => {
                merged.extend(changes.iter().map(|c| (*c).clone()));
            }
            (Some(our_changes), Some(their_changes)) => {
                if our_changes == their_changes {
                    // The same edit landed on both sides.
                    merged.extend(our_changes.iter().map(|c| (*c).clone()));
                } else if let Some(conflict) = classify(path, our_changes, their_changes) {
                    conflicts.push(conflict);
                } else {
                    merged.extend(our_changes.iter().map(|c| (*c).clone()));
                }
            }
            (None, None) => unreachable!(),
        }
    }

    // A conflicted path keeps its ancestor version in the merged tree.
    // Entries the clean side would have created underneath it are dangling
    // now; pull them out of the merged diff and record them as conflicts so
    // nothing disappears without a trace.
    let prefixes: Vec<String> = conflicts.iter().map(|c| format!("{}/", c.path)).collect();
    let mut kept = Vec::with_capacity(merged.len());
    for change in merged {
        if !prefixes.iter().any(|p| change.path().starts_with(p.as_str())) {
            kept.push(change);
            continue;
        }
        if change.is_deletion() {
            continue;
        }
        let path = change.path();
        conflicts.push(Conflict {
            path: path.to_string(),
            base: None,
            ours: our_map.get(path).and_then(|cs| net_target(cs)),
            theirs: their_map.get(path).and_then(|cs| net_target(cs)),
        });
    }

    // Likewise a directory deletion must not sweep a conflicted path away.
    kept.retain(|change| match change {
        DiffEntry::DeletedDir { path } => {
            let prefix = format!("{path}/");
            !conflicts.iter().any(|c| c.path.starts_with(&prefix))
        }
        _ => true,
    });

    conflicts.sort_by(|a, b| a.path.cmp(&b.path));
    MergeOutcome {
        merged: TreeDiff { entries: kept },
        conflicts,
    }
}

/// All entries per path; a kind change contributes its delete and its add.
fn by_path(diff: &TreeDiff) -> BTreeMap<&str, Vec<&DiffEntry>> {
    let mut map: BTreeMap<&str, Vec<&DiffEntry>> = BTreeMap::new();
    for entry in diff.iter() {
        map.entry(entry.path()).or_default().push(entry);
    }
    map
}

/// Decide whether two differing change sets for the same path conflict.
/// Returns None when they are compatible (both removed the path, or both
/// turned it into a directory - the children merge on their own paths).
fn classify(path: &str, ours: &[&DiffEntry], theirs: &[&DiffEntry]) -> Option<Conflict> {
    if is_pure_deletion(ours) && is_pure_deletion(theirs) {
        return None;
    }
    if is_dir_add(ours) && is_dir_add(theirs) {
        return None;
    }
    Some(Conflict {
        path: path.to_string(),
        base: net_base(ours).or_else(|| net_base(theirs)),
        ours: net_target(ours),
        theirs: net_target(theirs),
    })
}

fn is_pure_deletion(changes: &[&DiffEntry]) -> bool {
    changes.iter().all(|c| c.is_deletion())
}

fn is_dir_add(changes: &[&DiffEntry]) -> bool {
    matches!(changes.last(), Some(DiffEntry::NewDir { .. }))
}

/// The entry hash a side leaves at the path; None for a net deletion or a
/// directory (which has no single content hash until folding).
fn net_target(changes: &[&DiffEntry]) -> Option<ObjectHash> {
    changes.iter().rev().find_map(|c| c.target().map(|e| e.hash))
}

fn net_base(changes: &[&DiffEntry]) -> Option<ObjectHash> {
    changes.iter().find_map(|c| match c {
        DiffEntry::Modified { from, .. } | DiffEntry::DeletedFile { from, .. } => Some(*from),
        _ => None,
    })
}

/// The working directory sits at the "ours" tree. Compute the file-system
/// updates that move it to the merged tree.
pub fn merge_changes(ours: &TreeDiff, merged: &TreeDiff, base: &FlatTree) -> TreeDiff {
    let our_tree = apply_to_flat(ours, base);
    let merged_tree = apply_to_flat(merged, base);
    diff_two_trees(&our_tree, &merged_tree)
}

/// Conflict marker bytes for a text-file conflict, in the usual
/// ours/base/theirs layout. Either side may be absent (deleted).
pub fn conflict_markers(store: &ObjectStore, conflict: &Conflict) -> Result<Vec<u8>> {
    let ours = read_side(store, conflict.ours)?;
    let theirs = read_side(store, conflict.theirs)?;
    let base = match conflict.base {
        Some(hash) => Some(store.get(&hash)?.payload),
        None => None,
    };

    let mut out = Vec::new();
    out.extend_from_slice(b"<<<<<<< ours\n");
    push_block(&mut out, &ours);
    if let Some(base) = base {
        out.extend_from_slice(b"||||||| base\n");
        push_block(&mut out, &base);
    }
    out.extend_from_slice(b"=======\n");
    push_block(&mut out, &theirs);
    out.extend_from_slice(b">>>>>>> theirs\n");
    Ok(out)
}

fn read_side(store: &ObjectStore, hash: Option<ObjectHash>) -> Result<Vec<u8>> {
    match hash {
        Some(hash) => Ok(store.get(&hash)?.payload),
        None => Ok(Vec::new()),
    }
}

fn push_block(out: &mut Vec<u8>, content: &[u8]) {
    out.extend_from_slice(content);
    if !content.ends_with(b"\n") && !content.is_empty() {
        out.push(b'\n');
    }
}

/// Heuristic text check: no NUL byte in the leading window.
pub fn looks_like_text(content: &[u8]) -> bool {
    !content.iter().take(8000).any(|&b| b == 0)
}
