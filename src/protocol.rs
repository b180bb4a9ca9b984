// Wire protocol shared by the replication client and server: a synchronous
// request/response conversation over a full-duplex byte stream (typically
// the stdin/stdout of a remote `ori sshserver`).
//
// Requests are a pstr command name followed by a command-specific body.
// Every response starts with a status byte; on error a pstr message follows
// and the command ends.

use std::io::{Read, Write};

use crate::errors::{Error, Result};
use crate::stream::{ByteReader, ByteWriter};

pub const PROTO_VERSION: &str = "ori-1.0";

pub const STATUS_OK: u8 = 0;
pub const STATUS_ERROR: u8 = 1;

/// Hashes per `readobjs` request; pull batches its missing set at this size.
pub const READOBJS_BATCH: usize = 256;

pub const CMD_HELLO: &str = "hello";
pub const CMD_GET_HEAD: &str = "get head";
pub const CMD_LIST_OBJS: &str = "list objs";
pub const CMD_LIST_COMMITS: &str = "list commits";
pub const CMD_READ_OBJS: &str = "readobjs";

pub fn write_ok<W: Write>(w: &mut ByteWriter<W>) -> Result<()> {
    w.write_u8(STATUS_OK)
}

pub fn write_error<W: Write>(w: &mut ByteWriter<W>, message: &str) -> Result<()> {
    w.write_u8(STATUS_ERROR)?;
    w.write_pstr(message)?;
    w.flush()
}

/// Consume a response status; an error frame becomes a protocol error
/// carrying the remote's message.
pub fn read_status<R: Read>(r: &mut ByteReader<R>) -> Result<()> {
    match r.read_u8()? {
        STATUS_OK => Ok(()),
        STATUS_ERROR => {
            let message = r.read_pstr()?;
            Err(Error::protocol(format!("remote: {message}")))
        }
        status => Err(Error::protocol(format!("unknown status byte {status}"))),
    }
}
