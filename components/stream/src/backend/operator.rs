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

use std::fmt::{Debug, Formatter};

use bytes::Bytes;
use kiseki_common::{ObjectSize, PartNumber, MULTIPART_STAGING_PREFIX};
use kiseki_utils::runtime::block_on;
use opendal::Operator;
use snafu::ResultExt;
use tracing::{debug, instrument, warn};

use super::{ByteRange, ObjectBackend, ObjectMeta, PartAck, SessionId};
use crate::err::{
    BackendResult, NoSuchSessionSnafu, NotFoundSnafu, OpenDalSnafu, RejectedSnafu,
};

const SESSION_KEY_OBJECT: &str = "KEY";
const ATOMIC_WRITE_DIR: &str = "atomic";

/// Any storage OpenDAL speaks to, behind an [Operator].
///
/// Multipart sessions stage their parts as hidden objects under
/// `.kiseki-multipart/<session>/` and completion streams them, in order,
/// into one writer on the final key.
///
/// The async operator is driven on the shared io runtime, so the methods
/// must not be called from inside that runtime.
#[derive(Clone)]
pub struct OpenDalBackend {
    op: Operator,
}

impl Debug for OpenDalBackend {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenDalBackend")
            .field("scheme", &self.op.info().scheme())
            .field("root", &self.op.info().root())
            .finish()
    }
}

impl OpenDalBackend {
    pub fn new(op: Operator) -> Self { Self { op } }

    pub fn memory() -> BackendResult<Self> {
        let builder = opendal::services::Memory::default();
        let op = Operator::new(builder)
            .context(OpenDalSnafu { key: "memory" })?
            .finish();
        Ok(Self::new(op))
    }

    /// A directory tree. Completed objects are written into a scratch
    /// directory under the staging prefix and renamed onto their key when
    /// the writer closes.
    pub fn fs(root: &str) -> BackendResult<Self> {
        let mut builder = opendal::services::Fs::default();
        builder.root(root);
        builder.atomic_write_dir(&format!(
            "{}/{}/{}",
            root.trim_end_matches('/'),
            MULTIPART_STAGING_PREFIX,
            ATOMIC_WRITE_DIR
        ));
        let op = Operator::new(builder)
            .context(OpenDalSnafu { key: root })?
            .finish();
        Ok(Self::new(op))
    }

    pub fn operator(&self) -> &Operator { &self.op }

    fn session_prefix(session: &SessionId) -> String {
        format!("{}/{}/", MULTIPART_STAGING_PREFIX, session)
    }

    fn part_path(session: &SessionId, part_number: PartNumber) -> String {
        format!("{}part-{}", Self::session_prefix(session), part_number)
    }

    async fn check_session(&self, key: &str, session: &SessionId) -> BackendResult<()> {
        let path = format!("{}{}", Self::session_prefix(session), SESSION_KEY_OBJECT);
        let owner = match self.op.read(&path).await {
            Ok(owner) => owner,
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => {
                return NoSuchSessionSnafu {
                    key,
                    session: session.as_str(),
                }
                .fail();
            }
            Err(e) => return Err(e).context(OpenDalSnafu { key }),
        };
        if owner.as_slice() != key.as_bytes() {
            return RejectedSnafu {
                key,
                reason: format!(
                    "session {} belongs to {}",
                    session,
                    String::from_utf8_lossy(&owner)
                ),
            }
            .fail();
        }
        Ok(())
    }

    // copy the staged `paths`, in order, into one writer on `key`. The
    // writer is aborted on any failure so no partial object is left behind.
    async fn stitch(&self, key: &str, paths: &[String]) -> BackendResult<u64> {
        let mut writer = self.op.writer(key).await.context(OpenDalSnafu { key })?;
        let mut size = 0;
        for path in paths {
            let copied = match self.op.read(path).await {
                Ok(data) => {
                    size += data.len() as u64;
                    writer.write(data).await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = copied {
                if let Err(abort_err) = writer.abort().await {
                    warn!("failed to abort the writer of {}: {}", key, abort_err);
                }
                return Err(e).context(OpenDalSnafu { key });
            }
        }
        writer.close().await.context(OpenDalSnafu { key })?;
        Ok(size)
    }

    async fn fetch_resolved(&self, key: &str, range: ByteRange, size: u64) -> BackendResult<Bytes> {
        let r = range.resolve(key, size)?;
        if r.is_empty() {
            return Ok(Bytes::new());
        }
        let data = self
            .op
            .read_with(key)
            .range(r)
            .await
            .context(OpenDalSnafu { key })?;
        Ok(Bytes::from(data))
    }
}

impl ObjectBackend for OpenDalBackend {
    fn name(&self) -> &'static str { "opendal" }

    fn stat(&self, key: &str) -> BackendResult<ObjectMeta> {
        let meta = block_on(self.op.stat(key)).context(OpenDalSnafu { key })?;
        if meta.is_dir() {
            return NotFoundSnafu { key }.fail();
        }
        Ok(ObjectMeta {
            key: key.to_string(),
            size: meta.content_length(),
        })
    }

    fn fetch(&self, key: &str, range: ByteRange) -> BackendResult<Bytes> {
        block_on(async {
            let size = self
                .op
                .stat(key)
                .await
                .context(OpenDalSnafu { key })?
                .content_length();
            self.fetch_resolved(key, range, size).await
        })
    }

    fn fetch_within(&self, key: &str, range: ByteRange, size: ObjectSize) -> BackendResult<Bytes> {
        block_on(self.fetch_resolved(key, range, size))
    }

    #[instrument(skip(self, data), fields(len = data.len()))]
    fn put(&self, key: &str, data: Bytes) -> BackendResult<ObjectMeta> {
        let size = data.len() as u64;
        block_on(self.op.write(key, data)).context(OpenDalSnafu { key })?;
        Ok(ObjectMeta {
            key: key.to_string(),
            size,
        })
    }

    fn delete(&self, key: &str) -> BackendResult<()> {
        block_on(self.op.delete(key)).context(OpenDalSnafu { key })
    }

    fn create_session(&self, key: &str) -> BackendResult<SessionId> {
        let session = SessionId::generate();
        let path = format!("{}{}", Self::session_prefix(&session), SESSION_KEY_OBJECT);
        block_on(self.op.write(&path, key.to_string())).context(OpenDalSnafu { key })?;
        debug!("staging parts of {} under {}", key, Self::session_prefix(&session));
        Ok(session)
    }

    fn put_part(
        &self,
        key: &str,
        session: &SessionId,
        part_number: PartNumber,
        data: Bytes,
    ) -> BackendResult<PartAck> {
        let ack = PartAck::new(part_number, &data);
        block_on(async {
            self.check_session(key, session).await?;
            self.op
                .write(&Self::part_path(session, part_number), data)
                .await
                .context(OpenDalSnafu { key })
        })?;
        Ok(ack)
    }

    #[instrument(skip(self, parts), fields(parts = parts.len()))]
    fn complete(
        &self,
        key: &str,
        session: &SessionId,
        parts: &[PartAck],
    ) -> BackendResult<ObjectMeta> {
        block_on(async {
            self.check_session(key, session).await?;
            for ack in parts {
                let path = Self::part_path(session, ack.part_number);
                let len = self.op.stat(&path).await.map(|m| m.content_length()).ok();
                if len != Some(ack.size) {
                    return RejectedSnafu {
                        key,
                        reason: format!("part {} is missing or has another size", ack.part_number),
                    }
                    .fail();
                }
            }

            let paths = parts
                .iter()
                .map(|ack| Self::part_path(session, ack.part_number))
                .collect::<Vec<_>>();
            let size = self.stitch(key, &paths).await?;

            if let Err(e) = self.op.remove_all(&Self::session_prefix(session)).await {
                warn!("failed to clean staged parts of session {}: {}", session, e);
            }
            Ok(ObjectMeta {
                key: key.to_string(),
                size,
            })
        })
    }

    fn abort(&self, key: &str, session: &SessionId) -> BackendResult<()> {
        block_on(self.op.remove_all(&Self::session_prefix(session))).context(OpenDalSnafu { key })
    }
}
