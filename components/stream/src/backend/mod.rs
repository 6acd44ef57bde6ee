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

//! The storage capability consumed by the streams, one implementation per
//! kind of storage.

use std::{
    collections::hash_map::DefaultHasher,
    fmt::{Debug, Display, Formatter},
    hash::{Hash, Hasher},
    ops::Range,
    sync::Arc,
};

use bytes::Bytes;
use kiseki_common::{ObjectOffset, ObjectSize, PartNumber};

use crate::err::{BackendResult, InvalidRangeSnafu};

pub mod local;
pub mod memory;
pub mod operator;
#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

pub use self::{local::LocalBackend, memory::MemoryBackend, operator::OpenDalBackend};

pub type BackendRef = Arc<dyn ObjectBackend>;

/// A byte range request, `len == None` means up to the end of the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: ObjectOffset,
    pub len: Option<u64>,
}

impl ByteRange {
    pub fn new(offset: ObjectOffset, len: u64) -> Self {
        Self {
            offset,
            len: Some(len),
        }
    }

    pub fn to_end(offset: ObjectOffset) -> Self { Self { offset, len: None } }

    /// Resolve against the real object size, the end is truncated at the
    /// object end. An offset past the end is an invalid range, an offset
    /// right at the end is an empty one.
    pub fn resolve(&self, key: &str, size: ObjectSize) -> BackendResult<Range<u64>> {
        if self.offset > size {
            return InvalidRangeSnafu {
                key,
                offset: self.offset,
                size,
            }
            .fail();
        }
        let end = match self.len {
            Some(len) => self.offset.saturating_add(len).min(size),
            None => size,
        };
        Ok(self.offset..end)
    }
}

impl Display for ByteRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.len {
            Some(len) => write!(f, "[{}, {})", self.offset, self.offset + len),
            None => write!(f, "[{}, EOF)", self.offset),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: ObjectSize,
}

/// Identifies one multipart upload on a backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self { Self(id.into()) }

    /// A fresh, process-unique id.
    pub fn generate() -> Self { Self(format!("{:016x}", kiseki_utils::random_id())) }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { f.write_str(&self.0) }
}

/// The receipt of a stored part, handed back to [ObjectBackend::complete].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartAck {
    pub part_number: PartNumber,
    pub etag: String,
    pub size: u64,
}

impl PartAck {
    pub fn new(part_number: PartNumber, data: &[u8]) -> Self {
        Self {
            part_number,
            etag: etag_of(data),
            size: data.len() as u64,
        }
    }
}

/// A content tag, good enough to spot a part that changed between the upload
/// and the completion.
pub fn etag_of(data: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    data.hash(&mut hasher);
    format!("{:016x}-{}", hasher.finish(), data.len())
}

/// [ObjectBackend] is what a stream needs from a storage: random access
/// reads, whole object puts and multipart sessions.
///
/// Implementations classify their failures through
/// [crate::err::BackendError::is_transient], retrying is up to the caller.
pub trait ObjectBackend: Send + Sync + Debug + 'static {
    fn name(&self) -> &'static str;

    fn stat(&self, key: &str) -> BackendResult<ObjectMeta>;

    /// Read a range, never more than requested, fewer only at the end of the
    /// object.
    fn fetch(&self, key: &str, range: ByteRange) -> BackendResult<Bytes>;

    /// [ObjectBackend::fetch] for a caller that already knows the object is
    /// `size` bytes long, so the backend can skip looking it up.
    fn fetch_within(&self, key: &str, range: ByteRange, size: ObjectSize) -> BackendResult<Bytes> {
        let _ = size;
        self.fetch(key, range)
    }

    /// Store a whole object at once, replacing any previous one.
    fn put(&self, key: &str, data: Bytes) -> BackendResult<ObjectMeta>;

    fn delete(&self, key: &str) -> BackendResult<()>;

    /// Open a multipart session, nothing is visible at `key` until
    /// [ObjectBackend::complete] succeeds.
    fn create_session(&self, key: &str) -> BackendResult<SessionId>;

    /// Store one part. Uploading the same number twice replaces it.
    fn put_part(
        &self,
        key: &str,
        session: &SessionId,
        part_number: PartNumber,
        data: Bytes,
    ) -> BackendResult<PartAck>;

    /// Assemble the parts listed in `parts`, in that order, into the object.
    fn complete(
        &self,
        key: &str,
        session: &SessionId,
        parts: &[PartAck],
    ) -> BackendResult<ObjectMeta>;

    /// Drop a session and every part stored in it. Aborting an unknown
    /// session is not an error.
    fn abort(&self, key: &str, session: &SessionId) -> BackendResult<()>;
}

/// Cut the requested range out of a whole object held in memory.
pub(crate) fn slice_object(key: &str, data: &Bytes, range: ByteRange) -> BackendResult<Bytes> {
    let r = range.resolve(key, data.len() as u64)?;
    Ok(data.slice(r.start as usize..r.end as usize))
}
