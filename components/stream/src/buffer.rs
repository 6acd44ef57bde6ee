// Copyright 2024 kisekifs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    cmp::min,
    fmt::{Debug, Display, Formatter},
    fs::File,
    io::{Read, Seek, SeekFrom, Write},
};

use bytes::{Bytes, BytesMut};
use kiseki_utils::readable_size::ReadableSize;
use snafu::ResultExt;

use crate::err::{Result, UnknownIOSnafu};

///
/// ChunkBuffer is a FIFO byte buffer that sits between a stream and the
/// backend, it holds prefetched bytes for readers and pending part bytes
/// for writers.
///
/// ```text
///   0            read_cursor          write_cursor
///   |  retired   |      unread        |
/// ```
///
/// Retired bytes stay around until [ChunkBuffer::reclaim] so a reader can
/// seek backwards inside the window it just consumed.
///
pub struct ChunkBuffer {
    backing: Backing,
    read_cursor: usize,
    write_cursor: usize,
    // how many bytes have ever been appended, only for stats.
    total_appended: u64,
}

enum Backing {
    // `data.len() == write_cursor` always holds.
    Memory(BytesMut),
    // An anonymous temporary file, the scratch holds the last unread view.
    Disk { file: File, scratch: Vec<u8> },
}

impl ChunkBuffer {
    pub fn memory(capacity: usize) -> Self {
        Self::with_backing(Backing::Memory(BytesMut::with_capacity(capacity)))
    }

    /// A buffer backed by an unnamed temporary file which is removed by the
    /// OS once the buffer is dropped.
    pub fn disk() -> Result<Self> {
        let file = tempfile::tempfile().context(UnknownIOSnafu)?;
        Ok(Self::with_backing(Backing::Disk {
            file,
            scratch: Vec::new(),
        }))
    }

    fn with_backing(backing: Backing) -> Self {
        Self {
            backing,
            read_cursor: 0,
            write_cursor: 0,
            total_appended: 0,
        }
    }

    /// The count of unread bytes.
    pub fn len(&self) -> usize { self.write_cursor - self.read_cursor }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Bytes consumed but not reclaimed yet.
    pub fn retired(&self) -> usize { self.read_cursor }

    pub fn is_disk(&self) -> bool { matches!(self.backing, Backing::Disk { .. }) }

    pub fn total_appended(&self) -> u64 { self.total_appended }

    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        match &mut self.backing {
            Backing::Memory(buf) => buf.extend_from_slice(data),
            Backing::Disk { file, .. } => {
                file.seek(SeekFrom::Start(self.write_cursor as u64))
                    .context(UnknownIOSnafu)?;
                file.write_all(data).context(UnknownIOSnafu)?;
            }
        }
        self.write_cursor += data.len();
        self.total_appended += data.len() as u64;
        Ok(())
    }

    /// Borrow every unread byte.
    pub fn unread(&mut self) -> Result<&[u8]> {
        let (start, end) = (self.read_cursor, self.write_cursor);
        match &mut self.backing {
            Backing::Memory(buf) => Ok(&buf[start..end]),
            Backing::Disk { file, scratch } => {
                scratch.resize(end - start, 0);
                file.seek(SeekFrom::Start(start as u64))
                    .context(UnknownIOSnafu)?;
                file.read_exact(scratch).context(UnknownIOSnafu)?;
                Ok(scratch.as_slice())
            }
        }
    }

    /// Copy out at most `n` unread bytes without consuming them.
    pub fn peek(&mut self, n: usize) -> Result<Bytes> {
        let n = min(n, self.len());
        let unread = self.unread()?;
        Ok(Bytes::copy_from_slice(&unread[..n]))
    }

    /// Copy out at most `n` unread bytes and retire them.
    pub fn consume(&mut self, n: usize) -> Result<Bytes> {
        let part = self.peek(n)?;
        self.read_cursor += part.len();
        Ok(part)
    }

    /// Retire `n` unread bytes without copying them.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.len(), "advance {} over {} unread", n, self.len());
        self.read_cursor += min(n, self.len());
    }

    /// Move the read cursor back by `n` retired bytes, returns false when
    /// those bytes are reclaimed already.
    pub fn rewind(&mut self, n: usize) -> bool {
        if n > self.read_cursor {
            return false;
        }
        self.read_cursor -= n;
        true
    }

    /// Remove at most `n` unread bytes from the front and hand them out.
    ///
    /// Unlike [ChunkBuffer::consume] the bytes are gone afterwards, for
    /// memory buffers this avoids a copy.
    pub fn take(&mut self, n: usize) -> Result<Bytes> {
        self.reclaim()?;
        let n = min(n, self.len());
        let part = match &mut self.backing {
            Backing::Memory(buf) => {
                let part = buf.split_to(n).freeze();
                self.write_cursor -= n;
                part
            }
            Backing::Disk { .. } => self.consume(n)?,
        };
        self.reclaim()?;
        Ok(part)
    }

    /// Remove and return every unread byte.
    pub fn drain(&mut self) -> Result<Bytes> { self.take(self.len()) }

    /// Search `needle` inside the unread bytes, starting `from` bytes past the
    /// read cursor. Returns the match position relative to the read cursor.
    pub fn find(&mut self, needle: &[u8], from: usize) -> Result<Option<usize>> {
        if needle.is_empty() || from >= self.len() {
            return Ok(None);
        }
        let unread = self.unread()?;
        if unread.len() - from < needle.len() {
            return Ok(None);
        }
        let found = if needle.len() == 1 {
            unread[from..].iter().position(|b| *b == needle[0])
        } else {
            unread[from..]
                .windows(needle.len())
                .position(|w| w == needle)
        };
        Ok(found.map(|pos| pos + from))
    }

    /// Drop retired bytes.
    ///
    /// A disk buffer can only be reclaimed once everything is consumed.
    pub fn reclaim(&mut self) -> Result<()> {
        if self.read_cursor == 0 {
            return Ok(());
        }
        match &mut self.backing {
            Backing::Memory(buf) => {
                let _ = buf.split_to(self.read_cursor);
                self.write_cursor -= self.read_cursor;
                self.read_cursor = 0;
            }
            Backing::Disk { file, scratch } => {
                if self.read_cursor == self.write_cursor {
                    file.set_len(0).context(UnknownIOSnafu)?;
                    scratch.clear();
                    self.read_cursor = 0;
                    self.write_cursor = 0;
                }
            }
        }
        Ok(())
    }

    /// Forget every byte, retired or not.
    pub fn clear(&mut self) -> Result<()> {
        match &mut self.backing {
            Backing::Memory(buf) => buf.clear(),
            Backing::Disk { file, scratch } => {
                file.set_len(0).context(UnknownIOSnafu)?;
                scratch.clear();
            }
        }
        self.read_cursor = 0;
        self.write_cursor = 0;
        Ok(())
    }

    /// Clear and give the memory back.
    pub fn release(&mut self) -> Result<()> {
        self.clear()?;
        match &mut self.backing {
            Backing::Memory(buf) => *buf = BytesMut::new(),
            Backing::Disk { scratch, .. } => *scratch = Vec::new(),
        }
        Ok(())
    }
}

impl Display for ChunkBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ChunkBuffer {{ backing: {}, unread: {}, retired: {}, appended: {} }}",
            if self.is_disk() { "disk" } else { "memory" },
            ReadableSize(self.len() as u64),
            ReadableSize(self.retired() as u64),
            ReadableSize(self.total_appended),
        )
    }
}

impl Debug for ChunkBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { Display::fmt(self, f) }
}
