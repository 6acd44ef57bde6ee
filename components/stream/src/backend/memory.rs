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

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use kiseki_common::PartNumber;
use snafu::OptionExt;
use tracing::debug;

use super::{slice_object, ByteRange, ObjectBackend, ObjectMeta, PartAck, SessionId};
use crate::err::{BackendResult, NoSuchSessionSnafu, NotFoundSnafu, RejectedSnafu};

#[derive(Debug)]
struct PendingUpload {
    key: String,
    parts: BTreeMap<PartNumber, Bytes>,
}

/// Keeps every object in process memory.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: DashMap<String, Bytes>,
    uploads: DashMap<SessionId, PendingUpload>,
}

impl MemoryBackend {
    pub fn new() -> Self { Self::default() }

    pub fn contains(&self, key: &str) -> bool { self.objects.contains_key(key) }

    /// Sessions neither completed nor aborted.
    pub fn pending_sessions(&self) -> usize { self.uploads.len() }

    /// Parts stored in a pending session.
    pub fn staged_parts(&self, session: &SessionId) -> usize {
        self.uploads
            .get(session)
            .map(|u| u.parts.len())
            .unwrap_or_default()
    }
}

impl ObjectBackend for MemoryBackend {
    fn name(&self) -> &'static str { "memory" }

    fn stat(&self, key: &str) -> BackendResult<ObjectMeta> {
        let data = self.objects.get(key).context(NotFoundSnafu { key })?;
        Ok(ObjectMeta {
            key: key.to_string(),
            size: data.len() as u64,
        })
    }

    fn fetch(&self, key: &str, range: ByteRange) -> BackendResult<Bytes> {
        let data = self.objects.get(key).context(NotFoundSnafu { key })?;
        slice_object(key, data.value(), range)
    }

    fn put(&self, key: &str, data: Bytes) -> BackendResult<ObjectMeta> {
        let size = data.len() as u64;
        self.objects.insert(key.to_string(), data);
        Ok(ObjectMeta {
            key: key.to_string(),
            size,
        })
    }

    fn delete(&self, key: &str) -> BackendResult<()> {
        self.objects.remove(key);
        Ok(())
    }

    fn create_session(&self, key: &str) -> BackendResult<SessionId> {
        let session = SessionId::generate();
        self.uploads.insert(
            session.clone(),
            PendingUpload {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        debug!("create upload session {} for {}", session, key);
        Ok(session)
    }

    fn put_part(
        &self,
        key: &str,
        session: &SessionId,
        part_number: PartNumber,
        data: Bytes,
    ) -> BackendResult<PartAck> {
        let mut upload = self.uploads.get_mut(session).context(NoSuchSessionSnafu {
            key,
            session: session.as_str(),
        })?;
        let ack = PartAck::new(part_number, &data);
        upload.parts.insert(part_number, data);
        Ok(ack)
    }

    fn complete(
        &self,
        key: &str,
        session: &SessionId,
        parts: &[PartAck],
    ) -> BackendResult<ObjectMeta> {
        let object = {
            let upload = self.uploads.get(session).context(NoSuchSessionSnafu {
                key,
                session: session.as_str(),
            })?;
            if upload.key != key {
                return RejectedSnafu {
                    key,
                    reason: format!("session {} belongs to {}", session, upload.key),
                }
                .fail();
            }
            let total = parts.iter().map(|p| p.size as usize).sum();
            let mut object = BytesMut::with_capacity(total);
            for ack in parts {
                let data = upload
                    .parts
                    .get(&ack.part_number)
                    .with_context(|| RejectedSnafu {
                        key,
                        reason: format!("part {} was never uploaded", ack.part_number),
                    })?;
                if super::etag_of(data) != ack.etag {
                    return RejectedSnafu {
                        key,
                        reason: format!("part {} does not match its etag", ack.part_number),
                    }
                    .fail();
                }
                object.extend_from_slice(data);
            }
            object.freeze()
        };
        self.uploads.remove(session);
        self.put(key, object)
    }

    fn abort(&self, _key: &str, session: &SessionId) -> BackendResult<()> {
        self.uploads.remove(session);
        Ok(())
    }
}
