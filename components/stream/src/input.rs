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
    io,
    io::{BufRead, Read, Seek, SeekFrom},
};

use bytes::{Bytes, BytesMut};
use kiseki_common::{ObjectOffset, ObjectSize};
use tracing::{debug, error};

use crate::{
    buffer::ChunkBuffer,
    config::StreamConfig,
    err::{ClosedStreamSnafu, InvalidSeekSnafu, Result, StreamFailedSnafu},
    range_reader::RangeReader,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputState {
    /// The object has not been looked at yet, only with `defer_seek`.
    Unopened,
    Open,
    /// The last read hit the end of the object.
    Eof,
    Closed,
    /// A fetch failed, every further read fails too.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Start,
    Current,
    End,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReadStats {
    pub fetches: u64,
    pub fetched_bytes: u64,
    /// Backend fetch calls, retries included.
    pub fetch_attempts: u64,
    /// Bytes looked at while searching for line terminators.
    pub scanned_bytes: u64,
    /// Seeks that moved the position.
    pub seeks: u64,
}

/// ChunkedInputStream is a seekable read stream over a remote object.
///
/// The object is pulled through the [RangeReader] one window at a time and
/// staged in a [ChunkBuffer]. The bytes in the buffer always mirror the
/// object range right before and after the caller's position:
///
/// ```text
///           retired        unread
///   ... |-------------|-------------| ...
///       ^             ^             ^
///       window start  position      fetch_offset
/// ```
#[derive(Debug)]
pub struct ChunkedInputStream {
    reader: RangeReader,
    buffer: ChunkBuffer,
    window: usize,
    defer_seek: bool,
    terminator: Bytes,
    state: InputState,
    failure: Option<String>,
    position: ObjectOffset,
    // the object offset right after the last buffered byte.
    fetch_offset: ObjectOffset,
    scanned_bytes: u64,
    seeks: u64,
}

impl ChunkedInputStream {
    /// Without `defer_seek` the object size is looked up right away, so a
    /// missing object fails here instead of on the first read.
    pub fn new(reader: RangeReader, config: &StreamConfig) -> Result<Self> {
        let window = config.buffer_size.as_bytes_usize().max(1);
        let mut stream = Self {
            reader,
            buffer: ChunkBuffer::memory(window),
            window,
            defer_seek: config.defer_seek,
            terminator: Bytes::from(config.line_terminator.clone()),
            state: InputState::Unopened,
            failure: None,
            position: 0,
            fetch_offset: 0,
            scanned_bytes: 0,
            seeks: 0,
        };
        if !stream.defer_seek {
            stream.object_size()?;
        }
        Ok(stream)
    }

    pub fn key(&self) -> &str { self.reader.key() }

    pub fn state(&self) -> InputState { self.state }

    pub fn tell(&self) -> ObjectOffset { self.position }

    pub fn stats(&self) -> ReadStats {
        let fetch = self.reader.stats();
        ReadStats {
            fetches: fetch.fetches,
            fetched_bytes: fetch.fetched_bytes,
            fetch_attempts: fetch.attempts,
            scanned_bytes: self.scanned_bytes,
            seeks: self.seeks,
        }
    }

    /// The size of the object, this opens the stream.
    pub fn object_size(&mut self) -> Result<ObjectSize> {
        self.check_usable()?;
        let r = self.reader.size();
        let size = self.mark(r)?;
        if self.state == InputState::Unopened {
            self.state = InputState::Open;
        }
        if self.position > size {
            // a deferred seek went past the end.
            self.buffer.clear()?;
            self.position = size;
            self.fetch_offset = size;
        }
        Ok(size)
    }

    /// Read `n` bytes, or everything left with `None`.
    ///
    /// Exactly `n` bytes come back unless the end of the object comes first,
    /// once there every read returns nothing.
    pub fn read(&mut self, n: Option<usize>) -> Result<Bytes> {
        let size = self.object_size()?;
        if self.position >= size {
            self.state = InputState::Eof;
            return Ok(Bytes::new());
        }
        let out = match n {
            Some(n) => self.read_exact_or_eof(n)?,
            None => self.read_tail()?,
        };
        if self.position >= size {
            self.state = InputState::Eof;
        }
        Ok(out)
    }

    fn read_exact_or_eof(&mut self, n: usize) -> Result<Bytes> {
        if self.buffer.len() >= n {
            let out = self.buffer.consume(n)?;
            self.position += out.len() as u64;
            return Ok(out);
        }
        let remain = self.fetch_remaining()?;
        let mut out = BytesMut::with_capacity(min(n as u64, remain + self.buffer.len() as u64) as usize);
        while out.len() < n {
            if self.buffer.is_empty() && self.fill_window()? == 0 {
                break;
            }
            let chunk = self.buffer.consume(n - out.len())?;
            self.position += chunk.len() as u64;
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }

    fn read_tail(&mut self) -> Result<Bytes> {
        let buffered = self.buffer.len();
        let remain = self.fetch_remaining()?;
        if remain == 0 {
            let out = self.buffer.consume(buffered)?;
            self.position += out.len() as u64;
            return Ok(out);
        }
        // one fetch for the whole tail, bypassing the window.
        let r = self.reader.fetch(self.fetch_offset, None);
        let tail = self.mark(r)?;
        debug!(
            "fetch the tail of {} from {}, {} bytes",
            self.reader.key(),
            self.fetch_offset,
            tail.len()
        );
        let mut out = BytesMut::with_capacity(buffered + tail.len());
        out.extend_from_slice(&self.buffer.consume(buffered)?);
        out.extend_from_slice(&tail);
        self.buffer.clear()?;
        self.fetch_offset += tail.len() as u64;
        self.position = self.fetch_offset;
        Ok(out.freeze())
    }

    /// Read up to and including the next line terminator, or up to the end
    /// of the object for the last line.
    ///
    /// Bytes already searched are never searched again, so reading all lines
    /// of an object is linear in its size.
    pub fn readline(&mut self) -> Result<Bytes> {
        let size = self.object_size()?;
        if self.position >= size {
            self.state = InputState::Eof;
            return Ok(Bytes::new());
        }
        let terminator = self.terminator.clone();
        let overlap = terminator.len().saturating_sub(1);
        // how far past the read cursor we have searched.
        let mut scanned: usize = 0;
        let line = loop {
            let from = scanned.saturating_sub(overlap);
            if let Some(pos) = self.buffer.find(&terminator, from)? {
                let end = pos + terminator.len();
                self.scanned_bytes += (end - from) as u64;
                break self.buffer.consume(end)?;
            }
            self.scanned_bytes += self.buffer.len().saturating_sub(from) as u64;
            scanned = self.buffer.len();
            if self.fill_window()? == 0 {
                break self.buffer.consume(scanned)?;
            }
        };
        self.position += line.len() as u64;
        if self.position >= size {
            self.state = InputState::Eof;
        }
        Ok(line)
    }

    /// Read into `out`, serving from the buffer and fetching at most one
    /// window. Returns 0 only at the end of the object.
    pub fn read_into(&mut self, out: &mut [u8]) -> Result<usize> {
        self.object_size()?;
        if out.is_empty() {
            return Ok(0);
        }
        if self.buffer.is_empty() && self.fill_window()? == 0 {
            self.state = InputState::Eof;
            return Ok(0);
        }
        let unread = self.buffer.unread()?;
        let n = min(out.len(), unread.len());
        out[..n].copy_from_slice(&unread[..n]);
        self.buffer.advance(n);
        self.position += n as u64;
        Ok(n)
    }

    /// Move the position, returns the new one.
    ///
    /// Targets past the end are clamped to the object size. A target inside
    /// the buffered window only moves the cursor, anything else drops the
    /// buffer and refills it at the target, unless `defer_seek` leaves that
    /// to the next read.
    pub fn seek(&mut self, offset: i64, whence: Whence) -> Result<ObjectOffset> {
        self.check_usable()?;
        let base = match whence {
            Whence::Start => 0,
            Whence::Current => self.position as i128,
            Whence::End => self.object_size()? as i128,
        };
        self.seek_to(base + offset as i128)
    }

    fn seek_to(&mut self, target: i128) -> Result<ObjectOffset> {
        self.check_usable()?;
        if target < 0 {
            return InvalidSeekSnafu { target }.fail();
        }
        let mut target = u64::try_from(target).unwrap_or(u64::MAX);
        if let Some(size) = self.reader.known_size() {
            target = min(target, size);
        }
        if target == self.position {
            return Ok(target);
        }
        self.seeks += 1;
        if self.state == InputState::Eof {
            self.state = InputState::Open;
        }

        let window_start = self.position - self.buffer.retired() as u64;
        if (window_start..=self.fetch_offset).contains(&target) {
            if target < self.position {
                self.buffer.rewind((self.position - target) as usize);
            } else {
                self.buffer.advance((target - self.position) as usize);
            }
            debug!("seek {} to {} inside the window", self.reader.key(), target);
            self.position = target;
            return Ok(target);
        }

        debug!(
            "seek {} to {} outside the window [{}, {}), drop {}",
            self.reader.key(),
            target,
            window_start,
            self.fetch_offset,
            self.buffer
        );
        self.buffer.clear()?;
        self.position = target;
        self.fetch_offset = target;
        if !self.defer_seek {
            self.object_size()?;
            self.fill_window()?;
        }
        Ok(self.position)
    }

    /// Release the buffer, every later read fails. Closing twice is fine.
    pub fn close(&mut self) {
        if self.state == InputState::Closed {
            return;
        }
        if let Err(e) = self.buffer.release() {
            debug!("release buffer of {}: {}", self.reader.key(), e);
        }
        self.state = InputState::Closed;
    }

    pub fn is_closed(&self) -> bool { self.state == InputState::Closed }

    fn check_usable(&self) -> Result<()> {
        match self.state {
            InputState::Closed => ClosedStreamSnafu.fail(),
            InputState::Failed => StreamFailedSnafu {
                reason: self.failure.clone().unwrap_or_default(),
            }
            .fail(),
            _ => Ok(()),
        }
    }

    /// Bytes of the object not buffered yet.
    fn fetch_remaining(&mut self) -> Result<u64> {
        let size = self.object_size()?;
        Ok(size.saturating_sub(self.fetch_offset))
    }

    /// Append the next window to the buffer, returns how much was appended.
    fn fill_window(&mut self) -> Result<usize> {
        let remain = self.fetch_remaining()?;
        if remain == 0 {
            return Ok(0);
        }
        let len = min(self.window as u64, remain);
        let r = self.reader.fetch(self.fetch_offset, Some(len));
        let data = self.mark(r)?;
        debug!(
            "fetch window of {} at {}, {} bytes",
            self.reader.key(),
            self.fetch_offset,
            data.len()
        );
        self.buffer.reclaim()?;
        self.buffer.append(&data)?;
        self.fetch_offset += data.len() as u64;
        Ok(data.len())
    }

    fn mark<T>(&mut self, r: Result<T>) -> Result<T> {
        r.map_err(|e| {
            error!("read stream of {} failed: {}", self.reader.key(), e);
            self.state = InputState::Failed;
            self.failure = Some(e.to_string());
            e
        })
    }
}

impl Read for ChunkedInputStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> { Ok(self.read_into(buf)?) }
}

impl BufRead for ChunkedInputStream {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.object_size()?;
        if self.buffer.is_empty() {
            self.fill_window()?;
        }
        Ok(self.buffer.unread()?)
    }

    fn consume(&mut self, amt: usize) {
        let amt = min(amt, self.buffer.len());
        self.buffer.advance(amt);
        self.position += amt as u64;
    }
}

impl Seek for ChunkedInputStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let pos = match pos {
            SeekFrom::Start(n) => self.seek_to(n as i128)?,
            SeekFrom::Current(n) => ChunkedInputStream::seek(self, n, Whence::Current)?,
            SeekFrom::End(n) => ChunkedInputStream::seek(self, n, Whence::End)?,
        };
        Ok(pos)
    }

    fn stream_position(&mut self) -> io::Result<u64> { Ok(self.position) }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        backend::{
            testkit::{BackendOp, FailureKind, InstrumentedBackend},
            ObjectBackend,
        },
        config::RetryConfig,
        err::Error,
        retry::RetryPolicy,
    };

    fn object(len: usize) -> Vec<u8> { (0..len).map(|i| (i % 251) as u8).collect() }

    fn setup(data: Vec<u8>, config: &StreamConfig) -> (Arc<InstrumentedBackend>, ChunkedInputStream) {
        let backend = Arc::new(InstrumentedBackend::in_memory());
        backend.put("obj", Bytes::from(data)).unwrap();
        backend.reset_counters();
        let reader = RangeReader::new(backend.clone(), "obj", RetryPolicy::new(config.retry.clone()));
        let stream = ChunkedInputStream::new(reader, config).unwrap();
        (backend, stream)
    }

    fn small_window(window: usize) -> StreamConfig {
        StreamConfig::default()
            .with_buffer_size(window)
            .with_retry(RetryConfig::no_delay(3))
    }

    #[test]
    fn read_exact_then_eof() {
        let data = object(100);
        let (backend, mut s) = setup(data.clone(), &small_window(64));
        assert_eq!(s.read(Some(100)).unwrap().as_ref(), data.as_slice());
        assert_eq!(backend.calls(BackendOp::Fetch), 2);
        assert_eq!(s.state(), InputState::Eof);
        assert!(s.read(Some(10)).unwrap().is_empty());
        assert!(s.read(None).unwrap().is_empty());
        assert_eq!(backend.calls(BackendOp::Fetch), 2);
    }

    #[test]
    fn short_read_at_eof() {
        let data = object(50);
        let (_, mut s) = setup(data.clone(), &small_window(16));
        assert_eq!(s.read(Some(30)).unwrap().len(), 30);
        let rest = s.read(Some(30)).unwrap();
        assert_eq!(rest.as_ref(), &data[30..]);
        assert_eq!(s.tell(), 50);
        assert!(s.read(Some(1)).unwrap().is_empty());
    }

    #[test]
    fn read_to_end_in_one_fetch() {
        let data = object(1000);
        let (backend, mut s) = setup(data.clone(), &small_window(64));
        assert_eq!(s.read(Some(10)).unwrap().as_ref(), &data[..10]);
        assert_eq!(s.read(None).unwrap().as_ref(), &data[10..]);
        assert_eq!(backend.calls(BackendOp::Fetch), 2);
        assert_eq!(backend.fetch_log()[1], crate::backend::ByteRange::to_end(64));
    }

    #[test]
    fn seek_inside_window_does_not_fetch() {
        let data = object(100);
        let (backend, mut s) = setup(data.clone(), &small_window(64));
        s.read(Some(20)).unwrap();
        let fetches = backend.calls(BackendOp::Fetch);

        assert_eq!(s.seek(0, Whence::Current).unwrap(), 20);
        assert_eq!(s.seek(20, Whence::Start).unwrap(), 20);
        assert_eq!(s.seek(5, Whence::Start).unwrap(), 5);
        assert_eq!(s.read(Some(10)).unwrap().as_ref(), &data[5..15]);
        assert_eq!(s.seek(40, Whence::Current).unwrap(), 55);
        assert_eq!(s.read(Some(5)).unwrap().as_ref(), &data[55..60]);
        assert_eq!(backend.calls(BackendOp::Fetch), fetches);
        assert_eq!(s.stats().seeks, 2);
    }

    #[test]
    fn seek_outside_window() {
        let data = object(300);
        let (backend, mut s) = setup(data.clone(), &small_window(64));
        s.read(Some(10)).unwrap();
        assert_eq!(s.seek(200, Whence::Start).unwrap(), 200);
        // eager refill at the target.
        assert_eq!(backend.calls(BackendOp::Fetch), 2);
        assert_eq!(s.read(Some(4)).unwrap().as_ref(), &data[200..204]);
        assert_eq!(backend.calls(BackendOp::Fetch), 2);

        assert_eq!(s.seek(-10, Whence::End).unwrap(), 290);
        assert_eq!(s.read(None).unwrap().as_ref(), &data[290..]);
        assert_eq!(s.seek(1000, Whence::Start).unwrap(), 300);
        assert!(s.read(Some(1)).unwrap().is_empty());

        let e = s.seek(-1, Whence::Start).unwrap_err();
        assert!(matches!(e, Error::InvalidSeek { .. }));
        // not fatal.
        assert_eq!(s.seek(0, Whence::Start).unwrap(), 0);
        assert_eq!(s.read(Some(3)).unwrap().as_ref(), &data[..3]);
    }

    #[test]
    fn deferred_seek() {
        let data = object(300);
        let config = small_window(64).with_defer_seek(true);
        let (backend, mut s) = setup(data.clone(), &config);
        assert_eq!(s.state(), InputState::Unopened);
        assert_eq!(backend.calls(BackendOp::Stat), 0);

        assert_eq!(s.seek(250, Whence::Start).unwrap(), 250);
        assert_eq!(backend.calls(BackendOp::Fetch), 0);
        assert_eq!(s.read(Some(10)).unwrap().as_ref(), &data[250..260]);
        assert_eq!(backend.calls(BackendOp::Fetch), 1);

        s.seek(10, Whence::Start).unwrap();
        assert_eq!(backend.calls(BackendOp::Fetch), 1);

        // clamped once the size is known.
        let (_, mut s) = setup(data, &config);
        assert_eq!(s.seek(5000, Whence::Start).unwrap(), 5000);
        assert!(s.read(Some(1)).unwrap().is_empty());
        assert_eq!(s.tell(), 300);
    }

    #[test]
    fn readline_is_linear() {
        let mut data = Vec::new();
        for i in 0..200 {
            data.extend_from_slice(format!("line number {}\n", i).as_bytes());
        }
        let (_, mut s) = setup(data.clone(), &small_window(32));
        let mut lines = 0;
        let mut total = 0;
        loop {
            let line = s.readline().unwrap();
            if line.is_empty() {
                break;
            }
            assert!(line.ends_with(b"\n"));
            total += line.len();
            lines += 1;
        }
        assert_eq!(lines, 200);
        assert_eq!(total, data.len());
        assert_eq!(s.stats().scanned_bytes, data.len() as u64);
    }

    #[test]
    fn readline_multi_byte_terminator() {
        let data = b"first\r\nsecond\r\nno terminator".to_vec();
        let config = small_window(4).with_line_terminator(b"\r\n");
        let (_, mut s) = setup(data.clone(), &config);
        assert_eq!(s.readline().unwrap().as_ref(), b"first\r\n");
        assert_eq!(s.readline().unwrap().as_ref(), b"second\r\n");
        assert_eq!(s.readline().unwrap().as_ref(), b"no terminator");
        assert!(s.readline().unwrap().is_empty());
        assert!(s.stats().scanned_bytes <= 2 * data.len() as u64);
    }

    #[test]
    fn failed_read_poisons_stream() {
        let (backend, mut s) = setup(object(100), &small_window(64));
        backend.fail(BackendOp::Fetch, FailureKind::Permanent, 1);
        let e = s.read(Some(10)).unwrap_err();
        assert!(matches!(e, Error::PermanentFetch { .. }));
        assert_eq!(s.state(), InputState::Failed);
        let e = s.read(Some(10)).unwrap_err();
        assert!(matches!(e, Error::StreamFailed { .. }));
    }

    #[test]
    fn transient_fetch_is_invisible() {
        let data = object(100);
        let (backend, mut s) = setup(data.clone(), &small_window(64));
        backend.fail(BackendOp::Fetch, FailureKind::Transient, 2);
        assert_eq!(s.read(Some(100)).unwrap().as_ref(), data.as_slice());
        assert_eq!(s.stats().fetches, 2);
        assert_eq!(s.stats().fetch_attempts, 4);
    }

    #[test]
    fn missing_object() {
        let backend = Arc::new(InstrumentedBackend::in_memory());
        let config = small_window(64);
        let reader = RangeReader::new(backend, "nope", RetryPolicy::new(config.retry.clone()));
        let e = ChunkedInputStream::new(reader, &config).unwrap_err();
        assert!(e.is_not_found());
    }

    #[test]
    fn close_is_idempotent() {
        let (_, mut s) = setup(object(10), &small_window(64));
        s.close();
        s.close();
        assert!(s.is_closed());
        let e = s.read(Some(1)).unwrap_err();
        assert!(matches!(e, Error::ClosedStream { .. }));
        assert!(s.seek(0, Whence::Start).is_err());
    }

    #[test]
    fn std_io_traits() {
        let mut data = Vec::new();
        for i in 0..50 {
            data.extend_from_slice(format!("{}\n", i).as_bytes());
        }
        let (_, mut s) = setup(data.clone(), &small_window(16));
        let mut all = Vec::new();
        s.read_to_end(&mut all).unwrap();
        assert_eq!(all, data);

        Seek::seek(&mut s, SeekFrom::Start(0)).unwrap();
        let lines = (&mut s).lines().map(|l| l.unwrap()).collect::<Vec<_>>();
        assert_eq!(lines.len(), 50);
        assert_eq!(lines[49], "49");

        let pos = Seek::seek(&mut s, SeekFrom::End(-3)).unwrap();
        assert_eq!(pos, data.len() as u64 - 3);
        let mut tail = String::new();
        s.read_to_string(&mut tail).unwrap();
        assert_eq!(tail, "49\n");
    }
}
