// Protocol server. Speaks the replication protocol on a pair of byte
// streams, normally the stdin/stdout a remote shell wired to `ori
// sshserver`. One client per session; the repository lock is held for the
// session's lifetime so a second server on the same repository is refused.

use std::io::{Read, Write};

use tracing::{debug, info};

use crate::errors::{Error, Result};
use crate::object::INFO_SIZE;
use crate::protocol::{
    write_error, write_ok, CMD_GET_HEAD, CMD_HELLO, CMD_LIST_COMMITS, CMD_LIST_OBJS,
    CMD_READ_OBJS, PROTO_VERSION,
};
use crate::remote::list_store_commits;
use crate::repo::Repository;
use crate::stream::{ByteReader, ByteWriter};

pub fn serve<R: Read, W: Write>(repo: &Repository, input: R, output: W) -> Result<()> {
    let mut reader = ByteReader::new(input);
    let mut writer = ByteWriter::new(output);

    let _lock = match repo.lock() {
        Ok(lock) => lock,
        Err(e) => {
            write_error(&mut writer, "repository is locked")?;
            return Err(e);
        }
    };

    info!(root = %repo.root().display(), "serving repository");

    loop {
        let command = match reader.read_pstr() {
            Ok(command) => command,
            // Client hung up between commands: a normal session end.
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        };
        debug!(command = %command, "request");

        let outcome = match command.as_str() {
            CMD_HELLO => cmd_hello(&mut writer),
            CMD_GET_HEAD => cmd_get_head(repo, &mut writer),
            CMD_LIST_OBJS => cmd_list_objs(repo, &mut writer),
            CMD_LIST_COMMITS => cmd_list_commits(repo, &mut writer),
            CMD_READ_OBJS => cmd_read_objs(repo, &mut reader, &mut writer),
            _ => {
                write_error(&mut writer, &format!("unknown command {command:?}"))?;
                Ok(())
            }
        };

        if let Err(e) = outcome {
            // Command-level failures are reported in-band; the session
            // survives unless the transport itself is broken.
            match e {
                Error::Io(e) => return Err(Error::Io(e)),
                e => write_error(&mut writer, &e.to_string())?,
            }
        }

        writer.flush()?;
    }

    Ok(())
}

fn cmd_hello<W: Write>(w: &mut ByteWriter<W>) -> Result<()> {
    write_ok(w)?;
    w.write_pstr(PROTO_VERSION)
}

fn cmd_get_head<W: Write>(repo: &Repository, w: &mut ByteWriter<W>) -> Result<()> {
    let head = repo.head()?;
    write_ok(w)?;
    w.write_hash(&head)
}

fn cmd_list_objs<W: Write>(repo: &Repository, w: &mut ByteWriter<W>) -> Result<()> {
    let infos = repo.store().list()?;
    write_ok(w)?;
    w.write_u64(infos.len() as u64)?;
    for info in infos {
        w.write_all(&info.to_bytes())?;
    }
    Ok(())
}

fn cmd_list_commits<W: Write>(repo: &Repository, w: &mut ByteWriter<W>) -> Result<()> {
    let commits = list_store_commits(repo.store())?;
    write_ok(w)?;
    w.write_u32(commits.len() as u32)?;
    for commit in commits {
        w.write_pstr_bytes(&commit.to_bytes())?;
    }
    Ok(())
}

fn cmd_read_objs<R: Read, W: Write>(
    repo: &Repository,
    r: &mut ByteReader<R>,
    w: &mut ByteWriter<W>,
) -> Result<()> {
    let count = r.read_u32()?;
    let mut hashes = Vec::with_capacity(count as usize);
    for _ in 0..count {
        hashes.push(r.read_hash()?);
    }

    // Gather everything before committing to an OK frame, so a missing
    // object becomes a clean error response instead of a torn stream.
    let mut records = Vec::with_capacity(hashes.len());
    for hash in &hashes {
        records.push(repo.store().read_stored(hash)?);
    }
    debug!(count = records.len(), "transmitting objects");

    write_ok(w)?;
    for (info, stored) in records {
        w.write_u32(1)?;
        let header: [u8; INFO_SIZE] = info.to_bytes();
        w.write_all(&header)?;
        w.write_u32(stored.len() as u32)?;
        w.write_all(&stored)?;
    }
    w.write_u32(0)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;
    use crate::object::ObjectKind;
    use crate::remote::{Source, WireClient};
    use std::fs;
    use std::os::unix::net::UnixStream;
    use std::thread;
    use tempfile::TempDir;

    /// Serve `repo_root` on one end of a socketpair, returning the client's
    /// end wrapped in a WireClient.
    fn serve_in_thread(
        repo_root: std::path::PathBuf,
    ) -> (
        WireClient<UnixStream, UnixStream>,
        thread::JoinHandle<Result<()>>,
    ) {
        let (client_end, server_end) = UnixStream::pair().unwrap();
        let handle = thread::spawn(move || {
            let repo = Repository::open(&repo_root)?;
            let input = server_end.try_clone().expect("clone socket");
            serve(&repo, input, server_end)
        });
        let input = client_end.try_clone().unwrap();
        let client = WireClient::connect(input, client_end).unwrap();
        (client, handle)
    }

    #[test]
    fn hello_head_and_objects() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        fs::write(dir.path().join("a.txt"), "served").unwrap();
        let head = repo.commit("serve me").unwrap().unwrap();
        drop(repo);

        let (mut client, handle) = serve_in_thread(dir.path().to_path_buf());

        assert_eq!(client.head().unwrap(), head);

        let commits = client.list_commits().unwrap();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].hash(), head);

        let infos = client.list_objects().unwrap();
        // blob + tree + commit
        assert_eq!(infos.len(), 3);

        let fetched = client.fetch_objects(&[head]).unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].0.hash, head);

        drop(client);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn missing_object_is_an_in_band_error() {
        let dir = TempDir::new().unwrap();
        Repository::init(dir.path()).unwrap();

        let (mut client, handle) = serve_in_thread(dir.path().to_path_buf());

        let absent = hash_bytes(b"no such object");
        let err = client.fetch_objects(&[absent]).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));

        // The session survives an errored command.
        assert!(client.head().unwrap().is_zero());

        drop(client);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn second_server_is_refused_while_locked() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let lock = repo.lock().unwrap();

        let (client_end, server_end) = UnixStream::pair().unwrap();
        let input = server_end.try_clone().unwrap();
        let result = serve(&repo, input, server_end);
        assert!(matches!(result, Err(Error::Locked(_))));

        // The refused client sees an error frame, not silence.
        let input = client_end.try_clone().unwrap();
        let connect = WireClient::connect(input, client_end);
        assert!(connect.is_err());

        drop(lock);
        let _ = repo.store().add(ObjectKind::Blob, b"still usable");
    }
}
