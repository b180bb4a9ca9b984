// Replication sources. `pull` is generic over anything that can report a
// head, enumerate commits and hand over objects in stored form: another
// repository on the same machine, or a wire client talking to an
// `ori sshserver` over the stdio of an ssh subprocess.

use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use tracing::debug;

use crate::commit::Commit;
use crate::errors::{Error, Result};
use crate::hash::ObjectHash;
use crate::object::{ObjectInfo, ObjectKind, INFO_SIZE};
use crate::protocol::{
    read_status, CMD_GET_HEAD, CMD_HELLO, CMD_LIST_COMMITS, CMD_LIST_OBJS, CMD_READ_OBJS,
    PROTO_VERSION,
};
use crate::repo::Repository;
use crate::store::ObjectStore;
use crate::stream::{ByteReader, ByteWriter};

/// What `pull` needs from the far side.
pub trait Source {
    fn head(&mut self) -> Result<ObjectHash>;
    fn list_commits(&mut self) -> Result<Vec<Commit>>;
    /// Objects in stored (possibly compressed) form, one per requested hash.
    fn fetch_objects(&mut self, hashes: &[ObjectHash]) -> Result<Vec<(ObjectInfo, Vec<u8>)>>;
}

/// A sibling repository on the local filesystem.
pub struct LocalSource {
    repo: Repository,
}

impl LocalSource {
    pub fn open(path: &Path) -> Result<LocalSource> {
        Ok(LocalSource {
            repo: Repository::open(path)?,
        })
    }
}

impl Source for LocalSource {
    fn head(&mut self) -> Result<ObjectHash> {
        self.repo.head()
    }

    fn list_commits(&mut self) -> Result<Vec<Commit>> {
        list_store_commits(self.repo.store())
    }

    fn fetch_objects(&mut self, hashes: &[ObjectHash]) -> Result<Vec<(ObjectInfo, Vec<u8>)>> {
        hashes
            .iter()
            .map(|hash| self.repo.store().read_stored(hash))
            .collect()
    }
}

pub(crate) fn list_store_commits(store: &ObjectStore) -> Result<Vec<Commit>> {
    let mut commits = Vec::new();
    for info in store.list()? {
        if info.kind == ObjectKind::Commit {
            let object = store.get(&info.hash)?;
            commits.push(Commit::from_bytes(&object.payload)?);
        }
    }
    Ok(commits)
}

/// Protocol client over any full-duplex byte stream.
pub struct WireClient<R, W> {
    reader: ByteReader<R>,
    writer: ByteWriter<W>,
}

impl<R: Read, W: Write> WireClient<R, W> {
    /// Handshake with the server and check protocol compatibility.
    pub fn connect(input: R, output: W) -> Result<WireClient<R, W>> {
        let mut client = WireClient {
            reader: ByteReader::new(input),
            writer: ByteWriter::new(output),
        };

        client.send_command(CMD_HELLO)?;
        read_status(&mut client.reader)?;
        let version = client.reader.read_pstr()?;
        if version != PROTO_VERSION {
            return Err(Error::protocol(format!(
                "version mismatch: server speaks {version}, expected {PROTO_VERSION}"
            )));
        }
        debug!(version = %version, "connected to remote");
        Ok(client)
    }

    fn send_command(&mut self, command: &str) -> Result<()> {
        self.writer.write_pstr(command)?;
        self.writer.flush()
    }

    /// Every stored object's header on the remote.
    pub fn list_objects(&mut self) -> Result<Vec<ObjectInfo>> {
        self.send_command(CMD_LIST_OBJS)?;
        read_status(&mut self.reader)?;

        let count = self.reader.read_u64()?;
        let mut infos = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let mut header = [0u8; INFO_SIZE];
            self.reader.read_exact(&mut header)?;
            infos.push(ObjectInfo::from_bytes(&header)?);
        }
        Ok(infos)
    }
}

impl<R: Read, W: Write> Source for WireClient<R, W> {
    fn head(&mut self) -> Result<ObjectHash> {
        self.send_command(CMD_GET_HEAD)?;
        read_status(&mut self.reader)?;
        self.reader.read_hash()
    }

    fn list_commits(&mut self) -> Result<Vec<Commit>> {
        self.send_command(CMD_LIST_COMMITS)?;
        read_status(&mut self.reader)?;

        let count = self.reader.read_u32()?;
        let mut commits = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let payload = self.reader.read_pstr_bytes()?;
            commits.push(Commit::from_bytes(&payload)?);
        }
        Ok(commits)
    }

    fn fetch_objects(&mut self, hashes: &[ObjectHash]) -> Result<Vec<(ObjectInfo, Vec<u8>)>> {
        self.send_command(CMD_READ_OBJS)?;
        self.writer.write_u32(hashes.len() as u32)?;
        for hash in hashes {
            self.writer.write_hash(hash)?;
        }
        self.writer.flush()?;

        read_status(&mut self.reader)?;

        let mut objects = Vec::with_capacity(hashes.len());
        loop {
            match self.reader.read_u32()? {
                0 => break,
                1 => {}
                n => {
                    return Err(Error::protocol(format!(
                        "unexpected object-record marker {n}"
                    )))
                }
            }

            let mut header = [0u8; INFO_SIZE];
            self.reader.read_exact(&mut header)?;
            let info = ObjectInfo::from_bytes(&header)?;

            let size = self.reader.read_u32()? as usize;
            let stored = self.reader.read_exact_vec(size)?;
            objects.push((info, stored));
        }
        Ok(objects)
    }
}

/// A wire client across an `ssh host ori sshserver <path>` subprocess. The
/// child is reaped on drop.
pub struct SshRemote {
    client: WireClient<ChildStdout, ChildStdin>,
    child: Child,
}

impl SshRemote {
    /// `spec` is `host:path`, the host being anything the ssh binary
    /// understands (including `user@host` and config aliases).
    pub fn connect(spec: &str) -> Result<SshRemote> {
        let (host, path) = spec
            .split_once(':')
            .ok_or_else(|| Error::invalid(format!("remote {spec:?} is not host:path")))?;

        let mut child = Command::new("ssh")
            .arg(host)
            .arg("ori")
            .arg("sshserver")
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        let client = WireClient::connect(stdout, stdin)?;
        Ok(SshRemote { client, child })
    }
}

impl Source for SshRemote {
    fn head(&mut self) -> Result<ObjectHash> {
        self.client.head()
    }

    fn list_commits(&mut self) -> Result<Vec<Commit>> {
        self.client.list_commits()
    }

    fn fetch_objects(&mut self, hashes: &[ObjectHash]) -> Result<Vec<(ObjectInfo, Vec<u8>)>> {
        self.client.fetch_objects(hashes)
    }
}

impl Drop for SshRemote {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Open a pull source for a remote spec: `host:path` goes over ssh,
/// anything else is a local repository path.
pub fn connect(spec: &str) -> Result<Box<dyn Source>> {
    if spec.contains(':') {
        Ok(Box::new(SshRemote::connect(spec)?))
    } else {
        Ok(Box::new(LocalSource::open(Path::new(spec))?))
    }
}
