// Repository: the working tree plus its `.ori` metadata directory.
//
// Layout under <root>/.ori/:
//   version      format version string
//   id           uuid of this repository
//   HEAD         64 hex chars, current commit (all-zero = no commit)
//   dirstate     working-directory metadata cache
//   merge_state  pending merge parents + conflict paths (only mid-merge)
//   log          append-only operation log
//   lock         advisory exclusive lock for mutating operations
//   tmp/         staging area for atomic writes
//   objs/        the object store
//
// Mutating operations take the lock, write objects durably, and advance the
// head pointer last; the head update (temp file + rename) is the commit
// point of every transaction.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use nix::fcntl::{Flock, FlockArg};
use rayon::prelude::*;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::commit::Commit;
use crate::config::Config;
use crate::dag::CommitDag;
use crate::diff::{diff_two_trees, fold_flat, DiffEntry, FlatTree, TreeDiff};
use crate::dirstate::{Dirstate, DirstateEntry};
use crate::errors::{Error, Result};
use crate::hash::{hash_bytes, ObjectHash};
use crate::largeblob::LargeBlob;
use crate::merge::{conflict_markers, looks_like_text, merge_changes, merge_diffs, MergeOutcome};
use crate::object::{ObjectInfo, ObjectKind};
use crate::remote::Source;
use crate::store::ObjectStore;
use crate::stream::{ByteReader, ByteWriter};
use crate::tree::{EntryKind, Tree, TreeEntry};

/// Files at or above this size are chunked into a LargeBlob.
pub const LARGEFILE_MINIMUM: u64 = 1024 * 1024;

pub const ORI_DIR: &str = ".ori";
pub const REPO_FORMAT_VERSION: &str = "ori-repo-1";

const MERGE_STATE_MAGIC: &[u8; 4] = b"OMS1";

/// Pending merge: recorded by `merge`, consumed by the concluding `commit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeState {
    pub parent1: ObjectHash,
    pub parent2: ObjectHash,
    /// Paths whose working-directory copies still need user resolution.
    pub conflicts: Vec<String>,
}

/// Holds the repository's advisory lock; released on drop.
pub struct RepoLock {
    _flock: Flock<File>,
}

pub struct PullStats {
    pub fetched: usize,
    pub head: ObjectHash,
}

pub struct Repository {
    root: PathBuf,
    ori_dir: PathBuf,
    store: ObjectStore,
}

impl Repository {
    /// Create the `.ori` layout under `root`.
    pub fn init(root: &Path) -> Result<Repository> {
        let ori_dir = root.join(ORI_DIR);
        if ori_dir.exists() {
            return Err(Error::invalid(format!(
                "repository already exists at {}",
                root.display()
            )));
        }

        fs::create_dir_all(&ori_dir)?;
        let store = ObjectStore::init(&ori_dir)?;

        fs::write(ori_dir.join("version"), format!("{REPO_FORMAT_VERSION}\n"))?;
        fs::write(ori_dir.join("id"), format!("{}\n", uuid::Uuid::new_v4()))?;
        fs::write(ori_dir.join("HEAD"), format!("{}\n", ObjectHash::ZERO))?;
        fs::write(ori_dir.join("log"), "")?;

        let repo = Repository {
            root: root.to_path_buf(),
            ori_dir,
            store,
        };
        repo.append_log("init")?;
        info!(root = %root.display(), "initialized repository");
        Ok(repo)
    }

    /// Open an existing repository rooted exactly at `root`.
    pub fn open(root: &Path) -> Result<Repository> {
        let ori_dir = root.join(ORI_DIR);
        if !ori_dir.is_dir() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no repository at {}", root.display()),
            )));
        }

        let version = fs::read_to_string(ori_dir.join("version"))?;
        if version.trim() != REPO_FORMAT_VERSION {
            return Err(Error::parse(format!(
                "unsupported repository version {:?}",
                version.trim()
            )));
        }

        Ok(Repository {
            root: root.to_path_buf(),
            store: ObjectStore::open(&ori_dir),
            ori_dir,
        })
    }

    /// Walk upward from `start` to find the enclosing repository.
    pub fn find(start: &Path) -> Result<Repository> {
        for dir in start.ancestors() {
            if dir.join(ORI_DIR).is_dir() {
                return Self::open(dir);
            }
        }
        Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no repository found above {}", start.display()),
        )))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    pub fn id(&self) -> Result<String> {
        Ok(fs::read_to_string(self.ori_dir.join("id"))?.trim().to_string())
    }

    /// Take the exclusive repository lock, failing immediately when another
    /// process holds it.
    pub fn lock(&self) -> Result<RepoLock> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.ori_dir.join("lock"))?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => Ok(RepoLock { _flock: flock }),
            Err((_, _)) => Err(Error::Locked(self.root.clone())),
        }
    }

    // ----- head pointer -----

    pub fn head(&self) -> Result<ObjectHash> {
        let text = fs::read_to_string(self.ori_dir.join("HEAD"))?;
        ObjectHash::from_hex(text.trim())
    }

    /// Atomically advance the head pointer. Object durability is the
    /// store's business; this is the transaction's linearization point.
    pub fn set_head(&self, hash: ObjectHash) -> Result<()> {
        let mut tmp = NamedTempFile::new_in(self.store.tmp_dir())?;
        writeln!(tmp, "{hash}")?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.ori_dir.join("HEAD"))
            .map_err(|e| Error::Io(e.error))?;
        File::open(&self.ori_dir)?.sync_all()?;
        debug!(head = %hash, "advanced head");
        Ok(())
    }

    // ----- typed object access -----

    pub fn get_commit(&self, hash: &ObjectHash) -> Result<Commit> {
        let object = self.store.get(hash)?;
        if object.kind() != ObjectKind::Commit {
            return Err(Error::corrupt(*hash, "expected a commit object"));
        }
        Commit::from_bytes(&object.payload)
    }

    pub fn get_tree(&self, hash: &ObjectHash) -> Result<Tree> {
        let object = self.store.get(hash)?;
        if object.kind() != ObjectKind::Tree {
            return Err(Error::corrupt(*hash, "expected a tree object"));
        }
        Tree::from_bytes(&object.payload)
    }

    pub fn get_largeblob(&self, hash: &ObjectHash) -> Result<LargeBlob> {
        let object = self.store.get(hash)?;
        if object.kind() != ObjectKind::LargeBlob {
            return Err(Error::corrupt(*hash, "expected a largeblob object"));
        }
        LargeBlob::from_bytes(&object.payload)
    }

    /// Flattened tree of a commit; the zero sentinel yields an empty tree.
    pub fn commit_tree_flat(&self, commit: ObjectHash) -> Result<FlatTree> {
        if commit.is_zero() {
            return Ok(FlatTree::new());
        }
        let commit = self.get_commit(&commit)?;
        let tree = self.get_tree(&commit.tree)?;
        tree.flatten(&self.store)
    }

    // ----- file ingestion -----

    /// Add a working file to the store: small files become a Blob, files at
    /// or above the threshold are chunked into a LargeBlob manifest.
    pub fn add_file(&self, path: &Path) -> Result<(ObjectKind, ObjectHash)> {
        let size = fs::metadata(path)?.len();
        if size < LARGEFILE_MINIMUM {
            let content = fs::read(path)?;
            let hash = self.store.add(ObjectKind::Blob, &content)?;
            Ok((ObjectKind::Blob, hash))
        } else {
            let manifest = LargeBlob::chunk_file(&self.store, path)?;
            let hash = self.store.add(ObjectKind::LargeBlob, &manifest.to_bytes())?;
            Ok((ObjectKind::LargeBlob, hash))
        }
    }

    // ----- working-directory scan -----

    /// Flatten the working directory into tree entries. With `ingest` the
    /// contents of changed files are added to the store; without it they are
    /// only hashed. The dirstate cache skips rehashing files whose size and
    /// mtime are unchanged.
    fn working_tree_flat(&self, ingest: bool) -> Result<(FlatTree, Dirstate)> {
        let old_state = Dirstate::load(&self.ori_dir.join("dirstate"))?;
        let mut new_state = Dirstate::default();
        let mut flat = FlatTree::new();

        struct Pending {
            rel: String,
            path: PathBuf,
            size: u64,
            mtime_sec: u64,
            mtime_nsec: u32,
            mode: u32,
        }
        let mut pending: Vec<Pending> = Vec::new();

        let walker = WalkDir::new(&self.root)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.file_name() != ORI_DIR);

        for entry in walker {
            let entry = entry.map_err(|e| Error::Io(e.into()))?;
            let rel = entry
                .path()
                .strip_prefix(&self.root)
                .expect("walker stays under root")
                .to_string_lossy()
                .into_owned();

            let file_type = entry.file_type();
            if file_type.is_dir() {
                flat.insert(rel, TreeEntry::dir(ObjectHash::ZERO));
            } else if file_type.is_symlink() {
                let target = fs::read_link(entry.path())?;
                let target_bytes = target.to_string_lossy().into_owned().into_bytes();
                let hash = if ingest {
                    self.store.add(ObjectKind::Blob, &target_bytes)?
                } else {
                    hash_bytes(&target_bytes)
                };
                flat.insert(rel, TreeEntry::symlink(hash));
            } else if file_type.is_file() {
                let meta = entry.metadata().map_err(|e| Error::Io(e.into()))?;
                let (mtime_sec, mtime_nsec) = mtime_parts(&meta);
                let mode = meta.permissions().mode() & 0o777;

                if let Some((hash, large)) = old_state.cached(&rel, meta.len(), mtime_sec, mtime_nsec)
                {
                    new_state.record(
                        rel.clone(),
                        DirstateEntry {
                            size: meta.len(),
                            mtime_sec,
                            mtime_nsec,
                            hash,
                            large,
                        },
                    );
                    flat.insert(rel, TreeEntry::file(hash, mode, large));
                } else {
                    pending.push(Pending {
                        rel,
                        path: entry.path().to_path_buf(),
                        size: meta.len(),
                        mtime_sec,
                        mtime_nsec,
                        mode,
                    });
                }
            }
        }

        // Hash the cache misses in parallel; ingestion is idempotent, so
        // concurrent adds of identical chunks are fine.
        let store = &self.store;
        let hashed: Vec<(ObjectHash, bool)> = pending
            .par_iter()
            .map(|p| hash_working_file(store, &p.path, p.size, ingest))
            .collect::<Result<Vec<_>>>()?;

        for (p, (hash, large)) in pending.into_iter().zip(hashed) {
            new_state.record(
                p.rel.clone(),
                DirstateEntry {
                    size: p.size,
                    mtime_sec: p.mtime_sec,
                    mtime_nsec: p.mtime_nsec,
                    hash,
                    large,
                },
            );
            flat.insert(p.rel, TreeEntry::file(hash, p.mode, large));
        }

        Ok((flat, new_state))
    }

    /// Working-directory changes relative to the head commit. Never writes
    /// to the store.
    pub fn status(&self) -> Result<TreeDiff> {
        let base = self.commit_tree_flat(self.head()?)?;
        let (work, _) = self.working_tree_flat(false)?;
        Ok(diff_two_trees(&base, &work))
    }

    // ----- commit -----

    /// Commit outstanding working-directory changes. Returns None when there
    /// is nothing to commit.
    pub fn commit(&self, message: &str) -> Result<Option<ObjectHash>> {
        let _lock = self.lock()?;

        let merge_state = self.merge_state()?;
        if let Some(state) = &merge_state {
            let unresolved = self.unresolved_conflicts(state)?;
            if unresolved > 0 {
                return Err(Error::MergeConflict(unresolved));
            }
        }

        let head = self.head()?;
        let base = self.commit_tree_flat(head)?;
        let (work, dirstate) = self.working_tree_flat(true)?;

        let diff = diff_two_trees(&base, &work);
        if diff.is_empty() && merge_state.is_none() {
            return Ok(None);
        }

        let tree_hash = fold_flat(&work, &self.store)?;
        let commit_hash = self.commit_from_tree(tree_hash, message)?;

        dirstate.save(&self.ori_dir.join("dirstate"), self.store.tmp_dir())?;
        self.append_log(&format!("commit {commit_hash}"))?;
        Ok(Some(commit_hash))
    }

    /// Build a commit for an already-stored tree: parent1 is the current
    /// head, parent2 comes from a pending merge state (which this consumes),
    /// and the head pointer advances to the new commit.
    pub fn commit_from_tree(&self, tree: ObjectHash, message: &str) -> Result<ObjectHash> {
        let merge_state = self.merge_state()?;
        let parent1 = self.head()?;
        let parent2 = merge_state
            .as_ref()
            .map(|s| s.parent2)
            .unwrap_or(ObjectHash::ZERO);

        let config = Config::load(&self.ori_dir)?;
        let commit = Commit::new(tree, parent1, parent2, config.author, message.to_string());
        let hash = self.store.add(ObjectKind::Commit, &commit.to_bytes())?;

        self.set_head(hash)?;
        self.clear_merge_state()?;
        info!(commit = %hash, merge = !parent2.is_zero(), "created commit");
        Ok(hash)
    }

    /// Conflicted paths still awaiting resolution: a parked `<path>.theirs`
    /// copy that has not been cleaned up, or marker lines still sitting in
    /// the working copy.
    fn unresolved_conflicts(&self, state: &MergeState) -> Result<usize> {
        let mut unresolved = 0;
        for path in &state.conflicts {
            if self.theirs_copy_path(path).exists() {
                unresolved += 1;
                continue;
            }
            // A path that cannot be read (gone, or a directory now) cannot
            // be carrying marker lines.
            if let Ok(content) = fs::read(self.root.join(path)) {
                if content
                    .split(|&b| b == b'\n')
                    .any(|line| line.starts_with(b"<<<<<<< "))
                {
                    unresolved += 1;
                }
            }
        }
        Ok(unresolved)
    }

    /// First-parent history from the head, newest first.
    pub fn history(&self) -> Result<Vec<(ObjectHash, Commit)>> {
        let mut entries = Vec::new();
        let mut cursor = self.head()?;
        while !cursor.is_zero() {
            let commit = self.get_commit(&cursor)?;
            let parent = commit.parent1;
            entries.push((cursor, commit));
            cursor = parent;
        }
        Ok(entries)
    }

    // ----- merge -----

    /// Three-way merge of the head with another commit. Applies the clean
    /// side of the merge to the working directory, leaves every conflicted
    /// path at our version with markers or a parked `<path>.theirs` copy to
    /// resolve, and records the merge state for the concluding commit.
    pub fn merge(&self, theirs: ObjectHash) -> Result<MergeOutcome> {
        let _lock = self.lock()?;

        let ours = self.head()?;
        if ours.is_zero() {
            return Err(Error::invalid("nothing to merge onto: no commits yet"));
        }
        if theirs == ours {
            return Err(Error::invalid("cannot merge a commit with itself"));
        }
        if !self.store.has(&theirs) {
            return Err(Error::NotFound(theirs));
        }

        let dag = CommitDag::from_store(&self.store)?;
        let lca = dag.find_lca(ours, theirs);
        debug!(ours = %ours, theirs = %theirs, lca = %lca, "computed merge base");

        let base = self.commit_tree_flat(lca)?;
        let ours_flat = self.commit_tree_flat(ours)?;
        let theirs_flat = self.commit_tree_flat(theirs)?;

        let our_diff = diff_two_trees(&base, &ours_flat);
        let their_diff = diff_two_trees(&base, &theirs_flat);
        let outcome = merge_diffs(&our_diff, &their_diff);

        // File-system updates from the working tree (at `ours`) to the
        // merged tree. The merged tree holds the ancestor version at every
        // conflicted path; dropping those entries keeps the working copy on
        // our side instead of reverting it under the user's feet.
        let mut updates = merge_changes(&our_diff, &outcome.merged, &base);
        if outcome.has_conflicts() {
            updates.entries.retain(|change| {
                !outcome.conflicts.iter().any(|c| {
                    change.path() == c.path
                        || change.path().starts_with(&format!("{}/", c.path))
                })
            });
        }
        self.apply_wd_updates(&updates)?;

        let mut conflict_paths = Vec::new();
        for conflict in &outcome.conflicts {
            conflict_paths.push(conflict.path.clone());
            self.materialize_conflict(conflict, &ours_flat, &theirs_flat)?;
        }

        self.set_merge_state(&MergeState {
            parent1: ours,
            parent2: theirs,
            conflicts: conflict_paths,
        })?;
        self.append_log(&format!("merge {theirs}"))?;

        if outcome.has_conflicts() {
            warn!(count = outcome.conflicts.len(), "merge produced conflicts");
        }
        Ok(outcome)
    }

    /// Leave the user everything needed to resolve a conflict, in a form
    /// `unresolved_conflicts` can detect. A both-sides-modified text file
    /// gets in-file marker blocks. Every other both-sided conflict (binary,
    /// chunked, or directory-kind) keeps our version at the path and parks
    /// their version at `<path>.theirs`; deleting that parked copy is how
    /// the user marks the conflict resolved.
    fn materialize_conflict(
        &self,
        conflict: &crate::merge::Conflict,
        ours_flat: &FlatTree,
        theirs_flat: &FlatTree,
    ) -> Result<()> {
        let (Some(our_entry), Some(their_entry)) = (
            ours_flat.get(&conflict.path),
            theirs_flat.get(&conflict.path),
        ) else {
            // One side deleted the path: the working copy stays on our side.
            return Ok(());
        };

        if !our_entry.is_dir() && !their_entry.is_dir() && !our_entry.large && !their_entry.large {
            let our_payload = self.store.get(&our_entry.hash)?.payload;
            let their_payload = self.store.get(&their_entry.hash)?.payload;
            if looks_like_text(&our_payload) && looks_like_text(&their_payload) {
                let markers = conflict_markers(&self.store, conflict)?;
                fs::write(self.root.join(&conflict.path), markers)?;
                return Ok(());
            }
        }

        if their_entry.is_dir() {
            self.park_their_subtree(&conflict.path, theirs_flat)?;
        } else {
            let dest = self.theirs_copy_path(&conflict.path);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            self.materialize_entry(&dest, their_entry)?;
        }
        Ok(())
    }

    /// Materialize their side of a directory-kind conflict under
    /// `<path>.theirs/` so the user can inspect it next to our version.
    fn park_their_subtree(&self, path: &str, theirs_flat: &FlatTree) -> Result<()> {
        let copy_root = self.theirs_copy_path(path);
        for (p, entry) in theirs_flat {
            let suffix = if p == path {
                ""
            } else if let Some(rest) = p.strip_prefix(path).and_then(|r| r.strip_prefix('/')) {
                rest
            } else {
                continue;
            };

            let dest = if suffix.is_empty() {
                copy_root.clone()
            } else {
                copy_root.join(suffix)
            };

            if entry.is_dir() {
                fs::create_dir_all(&dest)?;
            } else {
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                self.materialize_entry(&dest, entry)?;
            }
        }
        Ok(())
    }

    fn theirs_copy_path(&self, path: &str) -> PathBuf {
        self.root.join(format!("{path}.theirs"))
    }

    // ----- merge state -----

    pub fn merge_state(&self) -> Result<Option<MergeState>> {
        let path = self.ori_dir.join("merge_state");
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut r = ByteReader::new(file);
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if &magic != MERGE_STATE_MAGIC {
            return Err(Error::parse("merge state has wrong magic"));
        }

        let parent1 = r.read_hash()?;
        let parent2 = r.read_hash()?;
        let count = r.read_u32()?;
        let mut conflicts = Vec::with_capacity(count as usize);
        for _ in 0..count {
            conflicts.push(r.read_pstr()?);
        }

        Ok(Some(MergeState {
            parent1,
            parent2,
            conflicts,
        }))
    }

    fn set_merge_state(&self, state: &MergeState) -> Result<()> {
        let mut tmp = NamedTempFile::new_in(self.store.tmp_dir())?;
        {
            let mut w = ByteWriter::new(&mut tmp);
            w.write_all(MERGE_STATE_MAGIC)?;
            w.write_hash(&state.parent1)?;
            w.write_hash(&state.parent2)?;
            w.write_u32(state.conflicts.len() as u32)?;
            for path in &state.conflicts {
                w.write_pstr(path)?;
            }
        }
        tmp.as_file().sync_all()?;
        tmp.persist(self.ori_dir.join("merge_state"))
            .map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    fn clear_merge_state(&self) -> Result<()> {
        match fs::remove_file(self.ori_dir.join("merge_state")) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // ----- working-directory materialization -----

    /// Apply a diff to the working directory, reading file contents from the
    /// store. Entries are path-ordered, so parent directories are created
    /// before their children.
    pub fn apply_wd_updates(&self, diff: &TreeDiff) -> Result<()> {
        for change in diff.iter() {
            let abs = self.root.join(change.path());
            match change {
                DiffEntry::NewDir { .. } => {
                    fs::create_dir_all(&abs)?;
                }
                DiffEntry::NewFile { entry, .. } | DiffEntry::Modified { entry, .. } => {
                    if let Some(parent) = abs.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    self.materialize_entry(&abs, entry)?;
                }
                DiffEntry::DeletedFile { .. } => match fs::remove_file(&abs) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                },
                DiffEntry::DeletedDir { .. } => match fs::remove_dir_all(&abs) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                },
            }
        }
        Ok(())
    }

    fn materialize_entry(&self, abs: &Path, entry: &TreeEntry) -> Result<()> {
        match entry.kind {
            EntryKind::Dir => {
                fs::create_dir_all(abs)?;
            }
            EntryKind::Symlink => {
                let target = self.store.get(&entry.hash)?.payload;
                let target = String::from_utf8(target)
                    .map_err(|_| Error::corrupt(entry.hash, "symlink target is not utf-8"))?;
                match fs::remove_file(abs) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                std::os::unix::fs::symlink(target, abs)?;
            }
            EntryKind::File => {
                if entry.large {
                    let manifest = self.get_largeblob(&entry.hash)?;
                    manifest.extract_file(&self.store, abs)?;
                } else {
                    let content = self.store.get(&entry.hash)?.payload;
                    fs::write(abs, content)?;
                }
                fs::set_permissions(abs, fs::Permissions::from_mode(entry.mode))?;
            }
        }
        Ok(())
    }

    /// Bring the working directory in line with the head commit's tree and
    /// refresh the dirstate cache.
    pub fn checkout_head(&self) -> Result<()> {
        let head = self.head()?;
        let target = self.commit_tree_flat(head)?;
        let (work, _) = self.working_tree_flat(false)?;

        let updates = diff_two_trees(&work, &target);
        self.apply_wd_updates(&updates)?;
        self.refresh_dirstate(&target)?;
        Ok(())
    }

    /// Re-stat materialized files so the next scan gets cache hits.
    fn refresh_dirstate(&self, tree: &FlatTree) -> Result<()> {
        let mut state = Dirstate::default();
        for (path, entry) in tree {
            if entry.kind != EntryKind::File {
                continue;
            }
            let meta = match fs::metadata(self.root.join(path)) {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            let (mtime_sec, mtime_nsec) = mtime_parts(&meta);
            state.record(
                path.clone(),
                DirstateEntry {
                    size: meta.len(),
                    mtime_sec,
                    mtime_nsec,
                    hash: entry.hash,
                    large: entry.large,
                },
            );
        }
        state.save(&self.ori_dir.join("dirstate"), self.store.tmp_dir())
    }

    // ----- replication -----

    /// Replicate missing objects from a source and advance the head. The
    /// head moves only once the full closure is present and verified, so an
    /// interrupted pull leaves the repository unchanged.
    pub fn pull(&self, source: &mut dyn Source) -> Result<PullStats> {
        let _lock = self.lock()?;

        let remote_head = source.head()?;
        if remote_head.is_zero() {
            return Ok(PullStats {
                fetched: 0,
                head: self.head()?,
            });
        }
        if self.store.has(&remote_head) {
            debug!(head = %remote_head, "remote head already present");
            return Ok(PullStats {
                fetched: 0,
                head: self.head()?,
            });
        }

        let remote_commits = source.list_commits()?;
        let mut wanted: Vec<ObjectHash> = remote_commits
            .iter()
            .map(Commit::hash)
            .filter(|hash| !self.store.has(hash))
            .collect();

        let mut fetched = 0usize;
        while !wanted.is_empty() {
            let mut received = Vec::new();
            for batch in wanted.chunks(crate::protocol::READOBJS_BATCH) {
                let objects = source.fetch_objects(batch)?;
                if objects.len() != batch.len() {
                    return Err(Error::protocol(format!(
                        "asked for {} objects, received {}",
                        batch.len(),
                        objects.len()
                    )));
                }
                for (info, stored) in objects {
                    // add_raw re-derives the hash before the object becomes
                    // visible; a lying peer cannot poison the store.
                    self.store.add_raw(&info, &stored)?;
                    received.push(info);
                    fetched += 1;
                }
            }

            // Newly arrived objects may reference more missing objects.
            let mut next = Vec::new();
            let mut seen = HashSet::new();
            for info in received {
                for reference in self.object_references(&info)? {
                    if !self.store.has(&reference) && seen.insert(reference) {
                        next.push(reference);
                    }
                }
            }
            wanted = next;
        }

        self.set_head(remote_head)?;
        self.append_log(&format!("pull {remote_head} ({fetched} objects)"))?;
        info!(head = %remote_head, fetched, "pull complete");
        Ok(PullStats {
            fetched,
            head: remote_head,
        })
    }

    /// Hashes directly referenced by a stored object.
    fn object_references(&self, info: &ObjectInfo) -> Result<Vec<ObjectHash>> {
        let mut refs = Vec::new();
        match info.kind {
            ObjectKind::Blob => {}
            ObjectKind::Commit => {
                let commit = self.get_commit(&info.hash)?;
                refs.push(commit.tree);
                for parent in [commit.parent1, commit.parent2] {
                    if !parent.is_zero() {
                        refs.push(parent);
                    }
                }
            }
            ObjectKind::Tree => {
                let tree = self.get_tree(&info.hash)?;
                refs.extend(tree.entries.values().map(|e| e.hash));
            }
            ObjectKind::LargeBlob => {
                let manifest = self.get_largeblob(&info.hash)?;
                refs.extend(manifest.parts.iter().map(|p| p.hash));
            }
        }
        Ok(refs)
    }

    // ----- reachability -----

    /// Mark-and-sweep reachability from the head (and a pending merge's
    /// second parent).
    pub fn reachable_objects(&self) -> Result<HashSet<ObjectHash>> {
        let mut roots = vec![self.head()?];
        if let Some(state) = self.merge_state()? {
            roots.push(state.parent1);
            roots.push(state.parent2);
        }

        let mut reachable = HashSet::new();
        let mut queue: Vec<ObjectHash> = roots.into_iter().filter(|h| !h.is_zero()).collect();
        while let Some(hash) = queue.pop() {
            if !reachable.insert(hash) {
                continue;
            }
            let info = self.store.get_info(&hash)?;
            queue.extend(self.object_references(&info)?);
        }
        Ok(reachable)
    }

    /// Remove an object that is provably unreachable. Returns whether an
    /// object was removed.
    pub fn purge_object(&self, hash: &ObjectHash) -> Result<bool> {
        let _lock = self.lock()?;
        if self.reachable_objects()?.contains(hash) {
            return Err(Error::invalid(format!(
                "refusing to purge reachable object {hash}"
            )));
        }
        self.store.purge(hash)
    }

    // ----- mount-facing surface -----

    /// Look up a path inside a commit's tree.
    pub fn resolve(&self, commit: ObjectHash, path: &str) -> Result<Option<TreeEntry>> {
        let commit = self.get_commit(&commit)?;
        let mut tree = self.get_tree(&commit.tree)?;

        let mut components = path.split('/').filter(|c| !c.is_empty()).peekable();
        while let Some(component) = components.next() {
            let Some(entry) = tree.entries.get(component).copied() else {
                return Ok(None);
            };
            if components.peek().is_none() {
                return Ok(Some(entry));
            }
            if !entry.is_dir() {
                return Ok(None);
            }
            tree = self.get_tree(&entry.hash)?;
        }
        Ok(None)
    }

    /// Read a byte range out of a Blob or LargeBlob.
    pub fn read_at(&self, hash: &ObjectHash, off: u64, len: usize) -> Result<Vec<u8>> {
        let info = self.store.get_info(hash)?;
        match info.kind {
            ObjectKind::Blob => {
                let payload = self.store.get(hash)?.payload;
                let start = (off as usize).min(payload.len());
                let end = start.saturating_add(len).min(payload.len());
                Ok(payload[start..end].to_vec())
            }
            ObjectKind::LargeBlob => {
                let manifest = self.get_largeblob(hash)?;
                manifest.read_at(&self.store, off, len)
            }
            kind => Err(Error::invalid(format!(
                "cannot read file bytes from a {} object",
                kind.name()
            ))),
        }
    }

    /// Apply staged changes on top of the head tree and store the resulting
    /// tree objects, returning the new root tree hash.
    pub fn stage_tree(&self, changes: &TreeDiff) -> Result<ObjectHash> {
        let base = self.commit_tree_flat(self.head()?)?;
        crate::diff::apply_to(changes, &base, &self.store)
    }

    // ----- operation log -----

    fn append_log(&self, line: &str) -> Result<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.ori_dir.join("log"))?;
        writeln!(file, "{now} {line}")?;
        Ok(())
    }
}

/// Hash (and optionally ingest) one working file, returning its entry hash
/// and whether it is stored as a LargeBlob.
fn hash_working_file(
    store: &ObjectStore,
    path: &Path,
    size: u64,
    ingest: bool,
) -> Result<(ObjectHash, bool)> {
    if size < LARGEFILE_MINIMUM {
        let content = fs::read(path)?;
        let hash = if ingest {
            store.add(ObjectKind::Blob, &content)?
        } else {
            hash_bytes(&content)
        };
        Ok((hash, false))
    } else {
        let manifest = if ingest {
            LargeBlob::chunk_file(store, path)?
        } else {
            LargeBlob::scan_file(path)?
        };
        let bytes = manifest.to_bytes();
        let hash = if ingest {
            store.add(ObjectKind::LargeBlob, &bytes)?
        } else {
            hash_bytes(&bytes)
        };
        Ok((hash, true))
    }
}

fn mtime_parts(meta: &fs::Metadata) -> (u64, u32) {
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .unwrap_or_default();
    (mtime.as_secs(), mtime.subsec_nanos())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn init_repo() -> (TempDir, Repository) {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        (dir, repo)
    }

    #[test]
    fn init_creates_layout() {
        let (dir, repo) = init_repo();
        let ori = dir.path().join(".ori");
        assert!(ori.join("version").is_file());
        assert!(ori.join("id").is_file());
        assert!(ori.join("HEAD").is_file());
        assert!(ori.join("objs").is_dir());
        assert!(ori.join("tmp").is_dir());
        assert!(repo.head().unwrap().is_zero());
        assert_eq!(repo.id().unwrap().len(), 36);
    }

    #[test]
    fn init_twice_fails() {
        let (dir, _repo) = init_repo();
        assert!(Repository::init(dir.path()).is_err());
    }

    #[test]
    fn find_walks_upward() {
        let (dir, _repo) = init_repo();
        let nested = dir.path().join("a/b");
        fs::create_dir_all(&nested).unwrap();
        let found = Repository::find(&nested).unwrap();
        assert_eq!(found.root(), dir.path());
    }

    #[test]
    fn commit_and_status_cycle() {
        let (dir, repo) = init_repo();
        fs::write(dir.path().join("a.txt"), "A").unwrap();

        let status = repo.status().unwrap();
        assert_eq!(status.len(), 1);

        let first = repo.commit("m1").unwrap().unwrap();
        assert_eq!(repo.head().unwrap(), first);
        assert!(repo.status().unwrap().is_empty());

        // Nothing new: commit is a no-op.
        assert!(repo.commit("empty").unwrap().is_none());

        fs::write(dir.path().join("b.txt"), "B").unwrap();
        let second = repo.commit("m2").unwrap().unwrap();
        assert_ne!(first, second);

        let commit = repo.get_commit(&second).unwrap();
        assert_eq!(commit.parent1, first);
        assert!(commit.parent2.is_zero());

        let diff = diff_two_trees(
            &repo.commit_tree_flat(first).unwrap(),
            &repo.commit_tree_flat(second).unwrap(),
        );
        assert_eq!(diff.len(), 1);
        assert!(matches!(&diff.entries[0], DiffEntry::NewFile { path, .. } if path == "b.txt"));
    }

    #[test]
    fn history_walks_first_parent() {
        let (dir, repo) = init_repo();
        fs::write(dir.path().join("a.txt"), "1").unwrap();
        let c1 = repo.commit("one").unwrap().unwrap();
        fs::write(dir.path().join("a.txt"), "2").unwrap();
        let c2 = repo.commit("two").unwrap().unwrap();

        let history = repo.history().unwrap();
        let hashes: Vec<ObjectHash> = history.iter().map(|(h, _)| *h).collect();
        assert_eq!(hashes, vec![c2, c1]);
    }

    #[test]
    fn large_files_become_largeblobs() {
        let (dir, repo) = init_repo();
        let content = vec![0x5Au8; (LARGEFILE_MINIMUM + 4096) as usize];
        fs::write(dir.path().join("big.bin"), &content).unwrap();

        let (kind, hash) = repo.add_file(&dir.path().join("big.bin")).unwrap();
        assert_eq!(kind, ObjectKind::LargeBlob);

        let manifest = repo.get_largeblob(&hash).unwrap();
        assert_eq!(manifest.total_size(), content.len() as u64);
        assert_eq!(manifest.total_hash, hash_bytes(&content));
    }

    #[test]
    fn lock_is_exclusive() {
        let (_dir, repo) = init_repo();
        let held = repo.lock().unwrap();
        assert!(matches!(repo.lock(), Err(Error::Locked(_))));
        drop(held);
        assert!(repo.lock().is_ok());
    }

    #[test]
    fn resolve_and_read_at() {
        let (dir, repo) = init_repo();
        fs::create_dir_all(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/f.txt"), "file contents").unwrap();
        let head = repo.commit("add").unwrap().unwrap();

        let entry = repo.resolve(head, "sub/f.txt").unwrap().unwrap();
        assert_eq!(entry.kind, EntryKind::File);
        assert_eq!(repo.read_at(&entry.hash, 5, 8).unwrap(), b"contents");

        assert!(repo.resolve(head, "sub/missing").unwrap().is_none());
        assert!(repo.resolve(head, "sub/f.txt/deeper").unwrap().is_none());
    }

    #[test]
    fn reachability_and_purge() {
        let (dir, repo) = init_repo();
        fs::write(dir.path().join("a.txt"), "kept").unwrap();
        repo.commit("keep").unwrap().unwrap();

        let stray = repo.store().add(ObjectKind::Blob, b"unreferenced").unwrap();
        let reachable = repo.reachable_objects().unwrap();
        assert!(!reachable.contains(&stray));

        // A blob referenced by the head tree cannot be purged.
        let head_flat = repo.commit_tree_flat(repo.head().unwrap()).unwrap();
        let kept = head_flat.get("a.txt").unwrap().hash;
        assert!(repo.purge_object(&kept).is_err());

        assert!(repo.purge_object(&stray).unwrap());
        assert!(!repo.store().has(&stray));
    }

    #[test]
    fn dirstate_caches_across_commits() {
        let (dir, repo) = init_repo();
        fs::write(dir.path().join("a.txt"), "stable").unwrap();
        repo.commit("one").unwrap().unwrap();

        // Second scan hits the cache and reports no changes.
        assert!(repo.status().unwrap().is_empty());

        fs::write(dir.path().join("a.txt"), "changed").unwrap();
        let status = repo.status().unwrap();
        assert_eq!(status.len(), 1);
        assert!(matches!(status.entries[0], DiffEntry::Modified { .. }));
    }

    #[test]
    fn stage_tree_builds_on_head() {
        let (dir, repo) = init_repo();
        fs::write(dir.path().join("a.txt"), "A").unwrap();
        repo.commit("base").unwrap().unwrap();

        let blob = repo.store().add(ObjectKind::Blob, b"staged").unwrap();
        let changes = TreeDiff {
            entries: vec![DiffEntry::NewFile {
                path: "staged.txt".to_string(),
                entry: TreeEntry::file(blob, 0o644, false),
            }],
        };
        let tree_hash = repo.stage_tree(&changes).unwrap();

        let tree = repo.get_tree(&tree_hash).unwrap();
        let flat = tree.flatten(repo.store()).unwrap();
        assert!(flat.contains_key("a.txt"));
        assert_eq!(flat.get("staged.txt").unwrap().hash, blob);
    }
}
