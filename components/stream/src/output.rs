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

use std::{cmp::min, io, io::Write};

use kiseki_common::ObjectOffset;
use kiseki_utils::readable_size::ReadableSize;
use tracing::{debug, warn};

use crate::{
    backend::ObjectMeta,
    buffer::ChunkBuffer,
    config::{StreamConfig, WriteBufferKind},
    err::{ClosedStreamSnafu, Result, TransferAbortedSnafu},
    orchestrator::TransferOrchestrator,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputState {
    Open,
    /// `close` is assembling the object.
    Closing,
    /// The object is visible at its key.
    Committed,
    /// Nothing was, or ever will be, visible at the key.
    Aborted,
}

/// ChunkedOutputStream buffers writes and ships them as parts.
///
/// Whenever `part_size` bytes are pending they are cut into a part and
/// stored synchronously, so at most about one part sits in memory. Closing
/// either completes the multipart upload, or, when no part was ever cut,
/// stores the bytes with a single put.
///
/// Dropping an open stream aborts the transfer.
#[derive(Debug)]
pub struct ChunkedOutputStream {
    orchestrator: TransferOrchestrator,
    buffer: ChunkBuffer,
    part_size: usize,
    multipart: bool,
    state: OutputState,
    written: u64,
    object: Option<ObjectMeta>,
}

impl ChunkedOutputStream {
    pub fn new(orchestrator: TransferOrchestrator, config: &StreamConfig) -> Result<Self> {
        let part_size = config.part_size.as_bytes_usize().max(1);
        if config.multipart && config.part_size < config.min_part_size {
            warn!(
                "part size {} of {} is below {}, the backend may refuse the parts",
                config.part_size,
                orchestrator.key(),
                config.min_part_size
            );
        }
        let buffer = match config.write_buffer {
            WriteBufferKind::Memory => ChunkBuffer::memory(min(part_size, ReadableSize::mb(8).as_bytes_usize())),
            WriteBufferKind::Disk => ChunkBuffer::disk()?,
        };
        Ok(Self {
            orchestrator,
            buffer,
            part_size,
            multipart: config.multipart,
            state: OutputState::Open,
            written: 0,
            object: None,
        })
    }

    pub fn key(&self) -> &str { self.orchestrator.key() }

    pub fn state(&self) -> OutputState { self.state }

    /// Bytes accepted so far.
    pub fn tell(&self) -> ObjectOffset { self.written }

    pub fn orchestrator(&self) -> &TransferOrchestrator { &self.orchestrator }

    /// The stored object, once committed.
    pub fn object(&self) -> Option<&ObjectMeta> { self.object.as_ref() }

    fn check_open(&self) -> Result<()> {
        match self.state {
            OutputState::Open => Ok(()),
            OutputState::Aborted => TransferAbortedSnafu { key: self.key() }.fail(),
            OutputState::Closing | OutputState::Committed => ClosedStreamSnafu.fail(),
        }
    }

    /// Accept every byte of `data`, cutting parts along the way.
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<usize> {
        self.check_open()?;
        let mut rest = data;
        while !rest.is_empty() {
            let take = if self.multipart {
                min(self.part_size.saturating_sub(self.buffer.len()).max(1), rest.len())
            } else {
                rest.len()
            };
            if let Err(e) = self.buffer.append(&rest[..take]) {
                self.fail();
                return Err(e);
            }
            self.written += take as u64;
            rest = &rest[take..];
            if self.multipart && self.buffer.len() >= self.part_size {
                self.flush_part()?;
            }
        }
        Ok(data.len())
    }

    fn flush_part(&mut self) -> Result<()> {
        let part = match self.buffer.take(self.part_size) {
            Ok(part) => part,
            Err(e) => {
                self.fail();
                return Err(e);
            }
        };
        debug!("cut part of {} at {}", self.key(), self.written);
        if let Err(e) = self.orchestrator.flush_part(part) {
            self.fail();
            return Err(e);
        }
        Ok(())
    }

    /// Make the bytes visible at the key. Closing twice is fine, so is
    /// closing a stream that was already aborted.
    pub fn close(&mut self) -> Result<()> {
        match self.state {
            OutputState::Committed | OutputState::Aborted => return Ok(()),
            OutputState::Closing => return ClosedStreamSnafu.fail(),
            OutputState::Open => {}
        }
        self.state = OutputState::Closing;
        let committed = if self.orchestrator.part_count() == 0 {
            self.buffer
                .drain()
                .and_then(|data| self.orchestrator.put_whole(data))
        } else {
            self.buffer.drain().and_then(|rest| {
                if !rest.is_empty() {
                    self.orchestrator.flush_part(rest)?;
                }
                self.orchestrator.finalize()
            })
        };
        match committed {
            Ok(meta) => {
                debug!("closed {}, {} written", self.key(), ReadableSize(self.written));
                self.object = Some(meta);
                self.state = OutputState::Committed;
                if let Err(e) = self.buffer.release() {
                    debug!("release buffer of {}: {}", self.key(), e);
                }
                Ok(())
            }
            Err(e) => {
                self.fail();
                Err(e)
            }
        }
    }

    /// Give up on the transfer, nothing shows up at the key.
    pub fn terminate(&mut self) -> Result<()> {
        match self.state {
            OutputState::Open | OutputState::Closing => {
                self.state = OutputState::Aborted;
                if let Err(e) = self.buffer.release() {
                    debug!("release buffer of {}: {}", self.key(), e);
                }
                self.orchestrator.abort()
            }
            OutputState::Aborted => Ok(()),
            OutputState::Committed => ClosedStreamSnafu.fail(),
        }
    }

    fn fail(&mut self) {
        if let Err(e) = self.terminate() {
            warn!("abort {} after a failure: {}", self.key(), e);
        }
    }
}

impl Write for ChunkedOutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> { Ok(self.write_bytes(buf)?) }

    /// Parts are cut by size only, so there is nothing to push here.
    fn flush(&mut self) -> io::Result<()> { Ok(()) }
}

impl Drop for ChunkedOutputStream {
    fn drop(&mut self) {
        if matches!(self.state, OutputState::Open | OutputState::Closing) {
            warn!(
                "{} dropped before close, abort the transfer of {} written",
                self.key(),
                ReadableSize(self.written)
            );
            if let Err(e) = self.terminate() {
                warn!("abort {} on drop: {}", self.key(), e);
            }
        }
    }
}
