// Typed byte streams shared by object serialization and the wire protocol.
// All multi-byte integers are little-endian at explicit widths; strings are
// "pstr" framed as a u32 length followed by the raw bytes.

use std::io::{Read, Write};

use crate::errors::{Error, Result};
use crate::hash::{ObjectHash, HASH_LEN};

/// Upper bound on a single pstr / counted frame, to keep a malformed peer
/// from forcing an unbounded allocation.
pub const MAX_FRAME: usize = 64 * 1024 * 1024;

pub struct ByteReader<R> {
    inner: R,
}

impl<R: Read> ByteReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.inner.read_exact(buf)?;
        Ok(())
    }

    pub fn read_exact_vec(&mut self, n: usize) -> Result<Vec<u8>> {
        if n > MAX_FRAME {
            return Err(Error::protocol(format!("frame of {n} bytes exceeds limit")));
        }
        let mut buf = vec![0u8; n];
        self.inner.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.inner.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.inner.read_exact(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.inner.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.inner.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// LEB128 unsigned varint.
    pub fn read_varint(&mut self) -> Result<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift >= 64 || (shift == 63 && (byte & 0x7f) > 1) {
                return Err(Error::parse("varint overflows u64"));
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    pub fn read_hash(&mut self) -> Result<ObjectHash> {
        let mut buf = [0u8; HASH_LEN];
        self.inner.read_exact(&mut buf)?;
        Ok(ObjectHash(buf))
    }

    pub fn read_pstr_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u32()? as usize;
        self.read_exact_vec(len)
    }

    pub fn read_pstr(&mut self) -> Result<String> {
        let bytes = self.read_pstr_bytes()?;
        String::from_utf8(bytes).map_err(|e| Error::parse(format!("pstr is not utf-8: {e}")))
    }

    pub fn read_all(&mut self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.inner.read_to_end(&mut buf)?;
        Ok(buf)
    }
}

pub struct ByteWriter<W> {
    inner: W,
}

impl<W: Write> ByteWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.write_all(bytes)?;
        Ok(())
    }

    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.write_all(&[value])
    }

    pub fn write_u16(&mut self, value: u16) -> Result<()> {
        self.write_all(&value.to_le_bytes())
    }

    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.write_all(&value.to_le_bytes())
    }

    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.write_all(&value.to_le_bytes())
    }

    pub fn write_varint(&mut self, mut value: u64) -> Result<()> {
        loop {
            let mut byte = (value & 0x7f) as u8;
            value >>= 7;
            if value != 0 {
                byte |= 0x80;
            }
            self.write_u8(byte)?;
            if value == 0 {
                return Ok(());
            }
        }
    }

    pub fn write_hash(&mut self, hash: &ObjectHash) -> Result<()> {
        self.write_all(hash.as_bytes())
    }

    pub fn write_pstr_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_u32(bytes.len() as u32)?;
        self.write_all(bytes)
    }

    pub fn write_pstr(&mut self, s: &str) -> Result<()> {
        self.write_pstr_bytes(s.as_bytes())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;

    fn round_trip(write: impl FnOnce(&mut ByteWriter<&mut Vec<u8>>)) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut w = ByteWriter::new(&mut buf);
        write(&mut w);
        buf
    }

    #[test]
    fn ints_round_trip_little_endian() {
        let buf = round_trip(|w| {
            w.write_u8(0xAB).unwrap();
            w.write_u16(0x1234).unwrap();
            w.write_u32(0xDEADBEEF).unwrap();
            w.write_u64(0x0102030405060708).unwrap();
        });

        // u16 0x1234 is stored low byte first
        assert_eq!(&buf[1..3], &[0x34, 0x12]);

        let mut r = ByteReader::new(&buf[..]);
        assert_eq!(r.read_u8().unwrap(), 0xAB);
        assert_eq!(r.read_u16().unwrap(), 0x1234);
        assert_eq!(r.read_u32().unwrap(), 0xDEADBEEF);
        assert_eq!(r.read_u64().unwrap(), 0x0102030405060708);
    }

    #[test]
    fn varint_round_trip() {
        for value in [0u64, 1, 127, 128, 300, 16_384, u32::MAX as u64, u64::MAX] {
            let buf = round_trip(|w| w.write_varint(value).unwrap());
            let mut r = ByteReader::new(&buf[..]);
            assert_eq!(r.read_varint().unwrap(), value, "value {value}");
        }
    }

    #[test]
    fn varint_small_values_are_one_byte() {
        let buf = round_trip(|w| w.write_varint(42).unwrap());
        assert_eq!(buf, vec![42]);
    }

    #[test]
    fn pstr_round_trip() {
        let buf = round_trip(|w| w.write_pstr("hello, pstr").unwrap());
        assert_eq!(&buf[..4], &11u32.to_le_bytes());

        let mut r = ByteReader::new(&buf[..]);
        assert_eq!(r.read_pstr().unwrap(), "hello, pstr");
    }

    #[test]
    fn hash_round_trip() {
        let h = hash_bytes(b"stream");
        let buf = round_trip(|w| w.write_hash(&h).unwrap());
        assert_eq!(buf.len(), HASH_LEN);

        let mut r = ByteReader::new(&buf[..]);
        assert_eq!(r.read_hash().unwrap(), h);
    }

    #[test]
    fn short_input_is_an_error() {
        let mut r = ByteReader::new(&[0u8; 3][..]);
        assert!(r.read_u32().is_err());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut buf = Vec::new();
        let mut w = ByteWriter::new(&mut buf);
        w.write_u32(u32::MAX).unwrap();
        let mut r = ByteReader::new(&buf[..]);
        assert!(matches!(r.read_pstr_bytes(), Err(Error::Protocol(_))));
    }
}
