// Content-defined chunking for large files.
//
// A rolling fingerprint over a 32-byte window decides chunk boundaries: a
// boundary is declared at the first position past the minimum size where the
// fingerprint's low bits are all ones, or forcibly at the maximum size. The
// boundary therefore depends only on nearby content, so an edit near the
// start of a file leaves later chunk boundaries (and chunk hashes) intact.

use std::io::{self, Read};

/// Expected average chunk size. The boundary mask keeps the low
/// log2(CHUNK_TARGET) bits of the fingerprint.
pub const CHUNK_TARGET: usize = 4096;
pub const CHUNK_MIN: usize = 2048;
pub const CHUNK_MAX: usize = 8192;

/// Rolling fingerprint window.
pub const WINDOW: usize = 32;

const BOUNDARY_MASK: u64 = (CHUNK_TARGET as u64) - 1;
const PRIME: u64 = 1_000_003;
// PRIME^WINDOW, for removing the byte that leaves the window.
const PRIME_POW_WINDOW: u64 = {
    let mut pow = 1u64;
    let mut i = 0;
    while i < WINDOW {
        pow = pow.wrapping_mul(PRIME);
        i += 1;
    }
    pow
};

/// Pull-based chunk iterator over any byte source. Yields owned chunks of
/// CHUNK_MIN..=CHUNK_MAX bytes (the final chunk may be shorter).
pub struct Chunker<R> {
    reader: R,
    buf: Vec<u8>,
    pos: usize,
    len: usize,
    eof: bool,
}

impl<R: Read> Chunker<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: vec![0u8; 64 * 1024],
            pos: 0,
            len: 0,
            eof: false,
        }
    }

    fn refill(&mut self) -> io::Result<()> {
        debug_assert_eq!(self.pos, self.len);
        let n = self.reader.read(&mut self.buf)?;
        self.pos = 0;
        self.len = n;
        if n == 0 {
            self.eof = true;
        }
        Ok(())
    }
}

impl<R: Read> Iterator for Chunker<R> {
    type Item = io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut chunk = Vec::with_capacity(CHUNK_MAX);
        let mut window = [0u8; WINDOW];
        let mut acc = 0u64;

        loop {
            if self.pos == self.len {
                if !self.eof {
                    if let Err(e) = self.refill() {
                        return Some(Err(e));
                    }
                }
                if self.eof {
                    return if chunk.is_empty() {
                        None
                    } else {
                        Some(Ok(chunk))
                    };
                }
            }

            let byte = self.buf[self.pos];
            self.pos += 1;

            let slot = chunk.len() % WINDOW;
            let outgoing = window[slot];
            window[slot] = byte;
            acc = acc
                .wrapping_mul(PRIME)
                .wrapping_add(u64::from(byte))
                .wrapping_sub(u64::from(outgoing).wrapping_mul(PRIME_POW_WINDOW));

            chunk.push(byte);

            let at_boundary = chunk.len() >= CHUNK_MIN && (acc & BOUNDARY_MASK) == BOUNDARY_MASK;
            if at_boundary || chunk.len() == CHUNK_MAX {
                return Some(Ok(chunk));
            }
        }
    }
}
