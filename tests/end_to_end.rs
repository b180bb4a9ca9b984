// End-to-end walks through the whole engine: blob round-trips, large-file
// chunking, commit/diff cycles, branching merges (clean and conflicting),
// and replication over the wire protocol.

use std::fs;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::thread;

use anyhow::Result;
use rand::RngCore;
use tempfile::TempDir;

use ori::chunker::{CHUNK_MAX, CHUNK_MIN};
use ori::errors::Error;
use ori::hash::{hash_bytes, ObjectHash};
use ori::object::ObjectKind;
use ori::remote::{LocalSource, WireClient};
use ori::repo::Repository;
use ori::server;

fn random_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

#[test]
fn blob_round_trip() -> Result<()> {
    let dir = TempDir::new()?;
    let repo = Repository::init(dir.path())?;

    let path = dir.path().join("hello.txt");
    fs::write(&path, "Hello, world!\n")?;

    let (kind, hash) = repo.add_file(&path)?;
    assert_eq!(kind, ObjectKind::Blob);
    assert_eq!(
        hash.to_hex(),
        "d9014c4624844aa5bac314773d6b689ad467fa4e1d1a50a1b8a99d5a95f72ff5"
    );

    let object = repo.store().get(&hash)?;
    assert_eq!(object.payload, b"Hello, world!\n");
    Ok(())
}

#[test]
fn large_file_chunking_round_trip() -> Result<()> {
    let dir = TempDir::new()?;
    let repo = Repository::init(dir.path())?;

    let data = random_bytes(3 * 1024 * 1024);
    let path = dir.path().join("big.bin");
    fs::write(&path, &data)?;

    let (kind, hash) = repo.add_file(&path)?;
    assert_eq!(kind, ObjectKind::LargeBlob);

    let manifest = repo.get_largeblob(&hash)?;
    assert_eq!(manifest.total_hash, hash_bytes(&data));
    assert_eq!(manifest.total_size(), data.len() as u64);

    // 3 MiB of 2048..=8192-byte chunks.
    let pieces = manifest.parts.len();
    assert!(
        (384..=1536).contains(&pieces),
        "unexpected piece count {pieces}"
    );
    for (i, part) in manifest.parts.iter().enumerate() {
        let len = usize::from(part.length);
        assert!(len <= CHUNK_MAX);
        if i + 1 != pieces {
            assert!(len >= CHUNK_MIN);
        }
    }

    let out = dir.path().join("restored.bin");
    manifest.extract_file(repo.store(), &out)?;
    assert_eq!(fs::read(&out)?, data);
    Ok(())
}

#[test]
fn commit_then_diff_shows_one_addition() -> Result<()> {
    let dir = TempDir::new()?;
    let repo = Repository::init(dir.path())?;

    fs::write(dir.path().join("a.txt"), "A")?;
    let h1 = repo.commit("m1")?.expect("first commit");
    assert!(!h1.is_zero());

    fs::write(dir.path().join("b.txt"), "B")?;
    let h2 = repo.commit("m2")?.expect("second commit");

    let diff = ori::diff::diff_two_trees(
        &repo.commit_tree_flat(h1)?,
        &repo.commit_tree_flat(h2)?,
    );
    assert_eq!(diff.len(), 1);
    assert!(matches!(
        &diff.entries[0],
        ori::diff::DiffEntry::NewFile { path, .. } if path == "b.txt"
    ));
    Ok(())
}

/// Build two branches off the same base commit by rewinding the head, then
/// return (base, ours, theirs).
fn fork(
    repo: &Repository,
    root: &Path,
    ours: &[(&str, &[u8])],
    theirs: &[(&str, &[u8])],
) -> Result<(ObjectHash, ObjectHash, ObjectHash)> {
    let base = repo.head()?;

    for (name, content) in ours {
        fs::write(root.join(name), content)?;
    }
    let ours_commit = repo.commit("ours")?.expect("ours branch commit");

    repo.set_head(base)?;
    repo.checkout_head()?;
    for (name, content) in theirs {
        fs::write(root.join(name), content)?;
    }
    let theirs_commit = repo.commit("theirs")?.expect("theirs branch commit");

    repo.set_head(ours_commit)?;
    repo.checkout_head()?;
    Ok((base, ours_commit, theirs_commit))
}

#[test]
fn clean_merge_unions_both_sides() -> Result<()> {
    let dir = TempDir::new()?;
    let repo = Repository::init(dir.path())?;

    fs::write(dir.path().join("a.txt"), "base\n")?;
    repo.commit("base")?.expect("base commit");

    let (_base, ours, theirs) = fork(
        &repo,
        dir.path(),
        &[("x.txt", b"from x\n")],
        &[("y.txt", b"from y\n")],
    )?;

    let outcome = repo.merge(theirs)?;
    assert!(!outcome.has_conflicts());

    // Both branch files are in the working directory now.
    assert_eq!(fs::read_to_string(dir.path().join("x.txt"))?, "from x\n");
    assert_eq!(fs::read_to_string(dir.path().join("y.txt"))?, "from y\n");

    let merge_commit = repo.commit("join")?.expect("merge commit");
    let commit = repo.get_commit(&merge_commit)?;
    assert_eq!(commit.parent1, ours);
    assert_eq!(commit.parent2, theirs);

    let flat = repo.commit_tree_flat(merge_commit)?;
    assert!(flat.contains_key("a.txt"));
    assert!(flat.contains_key("x.txt"));
    assert!(flat.contains_key("y.txt"));
    Ok(())
}

#[test]
fn conflicting_merge_blocks_commit_until_resolved() -> Result<()> {
    let dir = TempDir::new()?;
    let repo = Repository::init(dir.path())?;

    fs::write(dir.path().join("a.txt"), "base\n")?;
    repo.commit("base")?.expect("base commit");

    let (_base, ours, theirs) = fork(
        &repo,
        dir.path(),
        &[("a.txt", b"our side\n")],
        &[("a.txt", b"their side entirely\n")],
    )?;

    let outcome = repo.merge(theirs)?;
    assert_eq!(outcome.conflicts.len(), 1);
    assert_eq!(outcome.conflicts[0].path, "a.txt");

    // The working copy carries conflict markers.
    let conflicted = fs::read_to_string(dir.path().join("a.txt"))?;
    assert!(conflicted.contains("<<<<<<< ours\nour side\n"));
    assert!(conflicted.contains("=======\ntheir side entirely\n"));

    // Committing with markers still in place is refused.
    let err = repo.commit("too early").unwrap_err();
    assert!(matches!(err, Error::MergeConflict(1)));

    // Resolve and conclude the merge.
    fs::write(dir.path().join("a.txt"), "settled\n")?;
    let merged = repo.commit("resolved")?.expect("merge commit");

    let commit = repo.get_commit(&merged)?;
    assert_eq!(commit.parent1, ours);
    assert_eq!(commit.parent2, theirs);
    assert!(repo.merge_state()?.is_none());

    let flat = repo.commit_tree_flat(merged)?;
    let resolved = repo.store().get(&flat["a.txt"].hash)?;
    assert_eq!(resolved.payload, b"settled\n");
    Ok(())
}

#[test]
fn binary_conflict_parks_their_version() -> Result<()> {
    let dir = TempDir::new()?;
    let repo = Repository::init(dir.path())?;

    let base = b"\x00\x01base payload\x02".to_vec();
    fs::write(dir.path().join("a.bin"), &base)?;
    repo.commit("base")?.expect("base commit");

    let our_bytes = b"\x00\x01our payload".to_vec();
    let their_bytes = b"\x00\x01their payload entirely\x03".to_vec();
    let (_base, ours, theirs) = fork(
        &repo,
        dir.path(),
        &[("a.bin", &our_bytes[..])],
        &[("a.bin", &their_bytes[..])],
    )?;

    let outcome = repo.merge(theirs)?;
    assert_eq!(outcome.conflicts.len(), 1);
    assert_eq!(outcome.conflicts[0].path, "a.bin");

    // Our version stays in place - no silent revert to the ancestor - and
    // their version is parked next to it.
    assert_eq!(fs::read(dir.path().join("a.bin"))?, our_bytes);
    let parked = dir.path().join("a.bin.theirs");
    assert_eq!(fs::read(&parked)?, their_bytes);

    // The parked copy blocks the concluding commit.
    let err = repo.commit("too early").unwrap_err();
    assert!(matches!(err, Error::MergeConflict(1)));

    // Removing it marks the conflict resolved; our version wins.
    fs::remove_file(&parked)?;
    let merged = repo.commit("keep ours")?.expect("merge commit");

    let commit = repo.get_commit(&merged)?;
    assert_eq!(commit.parent1, ours);
    assert_eq!(commit.parent2, theirs);

    let flat = repo.commit_tree_flat(merged)?;
    let kept = repo.store().get(&flat["a.bin"].hash)?;
    assert_eq!(kept.payload, our_bytes);
    Ok(())
}

fn populate_remote(root: &Path) -> Result<(Repository, Vec<u8>, ObjectHash)> {
    let repo = Repository::init(root)?;

    fs::write(root.join("readme.txt"), "remote file\n")?;
    fs::create_dir_all(root.join("docs"))?;
    fs::write(root.join("docs/guide.txt"), "guide\n")?;
    repo.commit("first")?.expect("first commit");

    let big = random_bytes(1024 * 1024 + 512 * 1024);
    fs::write(root.join("big.bin"), &big)?;
    let head = repo.commit("second")?.expect("second commit");

    Ok((repo, big, head))
}

fn verify_replica(local: &Repository, root: &Path, big: &[u8], head: ObjectHash) -> Result<()> {
    assert_eq!(local.head()?, head);

    // The full closure arrived and every object re-hashes cleanly.
    for info in local.store().list()? {
        local.store().verify(&info.hash)?;
    }

    local.checkout_head()?;
    assert_eq!(fs::read_to_string(root.join("readme.txt"))?, "remote file\n");
    assert_eq!(fs::read_to_string(root.join("docs/guide.txt"))?, "guide\n");
    assert_eq!(fs::read(root.join("big.bin"))?, big);
    Ok(())
}

#[test]
fn pull_from_local_source() -> Result<()> {
    let remote_dir = TempDir::new()?;
    let (_remote, big, head) = populate_remote(remote_dir.path())?;

    let local_dir = TempDir::new()?;
    let local = Repository::init(local_dir.path())?;

    let mut source = LocalSource::open(remote_dir.path())?;
    let stats = local.pull(&mut source)?;
    assert!(stats.fetched > 0);

    verify_replica(&local, local_dir.path(), &big, head)?;

    // A second pull is a no-op.
    let again = local.pull(&mut source)?;
    assert_eq!(again.fetched, 0);
    Ok(())
}

#[test]
fn pull_over_the_wire() -> Result<()> {
    let remote_dir = TempDir::new()?;
    let (remote, big, head) = populate_remote(remote_dir.path())?;
    drop(remote);

    let remote_root: PathBuf = remote_dir.path().to_path_buf();
    let (client_end, server_end) = UnixStream::pair()?;
    let server = thread::spawn(move || -> ori::Result<()> {
        let repo = Repository::open(&remote_root)?;
        let input = server_end.try_clone().expect("clone socket");
        server::serve(&repo, input, server_end)
    });

    let local_dir = TempDir::new()?;
    let local = Repository::init(local_dir.path())?;

    let input = client_end.try_clone()?;
    let mut client = WireClient::connect(input, client_end)?;
    let stats = local.pull(&mut client)?;
    assert!(stats.fetched > 0);

    drop(client);
    server.join().unwrap()?;

    verify_replica(&local, local_dir.path(), &big, head)?;
    Ok(())
}

#[test]
fn pull_from_empty_remote_is_a_no_op() -> Result<()> {
    let remote_dir = TempDir::new()?;
    Repository::init(remote_dir.path())?;

    let local_dir = TempDir::new()?;
    let local = Repository::init(local_dir.path())?;

    let mut source = LocalSource::open(remote_dir.path())?;
    let stats = local.pull(&mut source)?;
    assert_eq!(stats.fetched, 0);
    assert!(local.head()?.is_zero());
    Ok(())
}

#[test]
fn merge_of_unrelated_histories_unions_trees() -> Result<()> {
    // Two repositories with no common ancestor, joined through a pull.
    let a_dir = TempDir::new()?;
    let a = Repository::init(a_dir.path())?;
    fs::write(a_dir.path().join("from_a.txt"), "a\n")?;
    a.commit("a root")?.expect("commit in a");

    let b_dir = TempDir::new()?;
    let b = Repository::init(b_dir.path())?;
    fs::write(b_dir.path().join("from_b.txt"), "b\n")?;
    let b_head = b.commit("b root")?.expect("commit in b");

    // Replicate b's objects into a without moving a's head.
    let a_head = a.head()?;
    let mut source = LocalSource::open(b_dir.path())?;
    a.pull(&mut source)?;
    a.set_head(a_head)?;
    a.checkout_head()?;

    let outcome = a.merge(b_head)?;
    assert!(!outcome.has_conflicts());

    let merged = a.commit("union")?.expect("merge commit");
    let flat = a.commit_tree_flat(merged)?;
    assert!(flat.contains_key("from_a.txt"));
    assert!(flat.contains_key("from_b.txt"));
    Ok(())
}
