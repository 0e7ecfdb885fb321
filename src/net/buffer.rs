// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Contiguous byte buffer with distinct read and write cursors

use std::io::{ErrorKind, Read, Result, Write};

/// Outcome of moving bytes between a buffer and a non-blocking descriptor.
///
/// Would-block and peer-closed are ordinary conditions on non-blocking
/// sockets, not errors; only genuine I/O failures surface as `Err`.
#[derive(Debug, PartialEq, Eq)]
pub enum FdIo {
    /// `n` bytes were moved. `0` means no progress was possible right now
    /// (e.g. the buffer had no space or nothing to write).
    Transferred(usize),
    /// The descriptor is not ready; rearm readiness and try again later.
    WouldBlock,
    /// The peer closed the stream (read returned 0 bytes).
    Closed,
}

/// A contiguous byte region. `consume` advances the read cursor, `produce`
/// the write cursor; `compact` moves the readable bytes back to offset 0 so
/// the writable tail is maximal.
#[derive(Debug)]
pub struct Buffer {
    data: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Buffer {
    /// Creates a buffer with `cap` bytes of initial capacity.
    pub fn with_capacity(cap: usize) -> Self {
        Buffer {
            data: vec![0; cap],
            read_pos: 0,
            write_pos: 0,
        }
    }

    /// The bytes produced but not yet consumed.
    #[inline]
    pub fn readable(&self) -> &[u8] {
        &self.data[self.read_pos..self.write_pos]
    }

    /// Number of readable bytes.
    #[inline]
    pub fn readable_len(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Space available for writing without growing.
    #[inline]
    pub fn writable_len(&self) -> usize {
        self.data.len() - self.write_pos
    }

    /// True when no bytes are pending.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.read_pos == self.write_pos
    }

    /// Total capacity of the backing allocation.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Marks `n` bytes as consumed. When the buffer empties both cursors
    /// rewind to 0 so the next write starts at the front.
    pub fn consume(&mut self, n: usize) {
        self.read_pos = self.write_pos.min(self.read_pos + n);
        if self.read_pos == self.write_pos {
            self.read_pos = 0;
            self.write_pos = 0;
        }
    }

    /// Marks `n` bytes as produced.
    pub fn produce(&mut self, n: usize) {
        self.write_pos = self.data.len().min(self.write_pos + n);
    }

    /// Rewinds both cursors, discarding any pending bytes.
    pub fn reset(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }

    /// Moves the readable bytes to offset 0 so `writable_len` is maximal.
    pub fn compact(&mut self) {
        if self.is_empty() {
            self.reset();
            return;
        }
        if self.read_pos > 0 {
            self.data.copy_within(self.read_pos..self.write_pos, 0);
            self.write_pos -= self.read_pos;
            self.read_pos = 0;
        }
    }

    /// Appends `bytes`, growing the backing allocation if the writable tail
    /// is too small. Growth doubles, so repeated puts amortize.
    pub fn put(&mut self, bytes: &[u8]) {
        if self.writable_len() < bytes.len() {
            self.compact();
        }
        if self.writable_len() < bytes.len() {
            let needed = self.write_pos + bytes.len();
            let new_cap = (self.data.len() * 2).max(needed);
            self.data.resize(new_cap, 0);
        }
        self.data[self.write_pos..self.write_pos + bytes.len()].copy_from_slice(bytes);
        self.write_pos += bytes.len();
    }

    /// Performs one read from `src` into the writable tail, compacting
    /// first. Returns `Transferred(0)` when the buffer is full, which a
    /// caller should treat as back-pressure and stop draining.
    pub fn read_from<R: Read>(&mut self, src: &mut R) -> Result<FdIo> {
        self.compact();
        let space = self.writable_len();
        if space == 0 {
            return Ok(FdIo::Transferred(0));
        }

        match src.read(&mut self.data[self.write_pos..]) {
            Ok(0) => Ok(FdIo::Closed),
            Ok(n) => {
                self.produce(n);
                Ok(FdIo::Transferred(n))
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => Ok(FdIo::WouldBlock),
            Err(ref e) if e.kind() == ErrorKind::Interrupted => Ok(FdIo::Transferred(0)),
            Err(e) => Err(e),
        }
    }

    /// Performs one write of the readable prefix to `dst`. Partial writes
    /// are normal and reported by byte count.
    pub fn write_to<W: Write>(&mut self, dst: &mut W) -> Result<FdIo> {
        if self.is_empty() {
            return Ok(FdIo::Transferred(0));
        }

        match dst.write(self.readable()) {
            Ok(0) => Ok(FdIo::Transferred(0)),
            Ok(n) => {
                self.consume(n);
                Ok(FdIo::Transferred(n))
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => Ok(FdIo::WouldBlock),
            Err(ref e) if e.kind() == ErrorKind::Interrupted => Ok(FdIo::Transferred(0)),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use super::{Buffer, FdIo};

    #[test]
    fn buffer_put_and_consume_track_cursors() {
        let mut buf = Buffer::with_capacity(16);
        buf.put(b"hello");
        assert_eq!(5, buf.readable_len());
        assert_eq!(b"hello", buf.readable());
        buf.consume(2);
        assert_eq!(b"llo", buf.readable());
        buf.consume(3);
        assert!(buf.is_empty());
        assert_eq!(16, buf.writable_len());
    }

    #[test]
    fn buffer_compact_moves_readable_prefix_to_front() {
        let mut buf = Buffer::with_capacity(8);
        buf.put(b"abcdef");
        buf.consume(4);
        assert_eq!(2, buf.writable_len());
        buf.compact();
        assert_eq!(b"ef", buf.readable());
        assert_eq!(6, buf.writable_len());
    }

    #[test]
    fn buffer_put_grows_when_tail_too_small() {
        let mut buf = Buffer::with_capacity(4);
        buf.put(b"abcdefgh");
        assert_eq!(b"abcdefgh", buf.readable());
        assert!(buf.capacity() >= 8);
    }

    #[test]
    fn buffer_read_from_reports_closed_on_eof() {
        let mut buf = Buffer::with_capacity(8);
        let mut src = Cursor::new(Vec::new());
        assert_eq!(FdIo::Closed, buf.read_from(&mut src).unwrap());
    }

    #[test]
    fn buffer_read_from_fills_writable_tail() {
        let mut buf = Buffer::with_capacity(4);
        let mut src = Cursor::new(b"abcdef".to_vec());
        assert_eq!(FdIo::Transferred(4), buf.read_from(&mut src).unwrap());
        assert_eq!(b"abcd", buf.readable());
        // full buffer reports no progress instead of growing
        assert_eq!(FdIo::Transferred(0), buf.read_from(&mut src).unwrap());
    }

    #[test]
    fn buffer_write_to_drains_readable_prefix() {
        let mut buf = Buffer::with_capacity(8);
        buf.put(b"abc");
        let mut dst = Vec::new();
        assert_eq!(FdIo::Transferred(3), buf.write_to(&mut dst).unwrap());
        assert_eq!(b"abc", dst.as_slice());
        assert!(buf.is_empty());
    }
}
