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
    fs,
    fs::File,
    io,
    io::{Read, Seek, SeekFrom, Write},
    path::{Component, Path, PathBuf},
};

use bytes::Bytes;
use kiseki_common::{PartNumber, MULTIPART_STAGING_PREFIX};
use snafu::IntoError;
use tracing::{debug, instrument, warn};

use super::{ByteRange, ObjectBackend, ObjectMeta, PartAck, SessionId};
use crate::err::{
    BackendError, BackendResult, IoSnafu, NoSuchSessionSnafu, NotFoundSnafu, RejectedSnafu,
};

// the file in a session directory that remembers the destination key.
const SESSION_KEY_FILE: &str = "KEY";

fn classify(key: &str, e: io::Error) -> BackendError {
    if e.kind() == io::ErrorKind::NotFound {
        NotFoundSnafu { key }.build()
    } else {
        IoSnafu { key }.into_error(e)
    }
}

/// Objects are plain files under a root directory.
///
/// Multipart sessions stage their parts in a hidden directory under the root,
/// completion concatenates them into a temporary file next to the target and
/// renames it into place, so the final key appears atomically.
#[derive(Debug)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl AsRef<Path>) -> BackendResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| classify(&root.display().to_string(), e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path { &self.root }

    fn object_path(&self, key: &str) -> BackendResult<PathBuf> {
        let relative = Path::new(key.trim_start_matches('/'));
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if key.is_empty() || escapes || relative.starts_with(MULTIPART_STAGING_PREFIX) {
            return RejectedSnafu {
                key,
                reason: "key is not a plain relative path",
            }
            .fail();
        }
        Ok(self.root.join(relative))
    }

    fn session_dir(&self, session: &SessionId) -> PathBuf {
        self.root
            .join(MULTIPART_STAGING_PREFIX)
            .join(session.as_str())
    }

    fn open_session(&self, key: &str, session: &SessionId) -> BackendResult<PathBuf> {
        let dir = self.session_dir(session);
        let owner = fs::read_to_string(dir.join(SESSION_KEY_FILE)).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                NoSuchSessionSnafu {
                    key,
                    session: session.as_str(),
                }
                .build()
            } else {
                IoSnafu { key }.into_error(e)
            }
        })?;
        if owner != key {
            return RejectedSnafu {
                key,
                reason: format!("session {} belongs to {}", session, owner),
            }
            .fail();
        }
        Ok(dir)
    }

    /// Write `data` into a temporary file in the target directory then rename
    /// it over `path`.
    fn write_atomic<F>(&self, key: &str, path: &Path, fill: F) -> BackendResult<u64>
    where
        F: FnOnce(&mut File) -> io::Result<u64>,
    {
        let parent = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(parent).map_err(|e| classify(key, e))?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| classify(key, e))?;
        let size = fill(tmp.as_file_mut()).map_err(|e| classify(key, e))?;
        tmp.as_file().sync_data().map_err(|e| classify(key, e))?;
        tmp.persist(path).map_err(|e| classify(key, e.error))?;
        Ok(size)
    }
}

impl ObjectBackend for LocalBackend {
    fn name(&self) -> &'static str { "local" }

    fn stat(&self, key: &str) -> BackendResult<ObjectMeta> {
        let path = self.object_path(key)?;
        let meta = fs::metadata(path).map_err(|e| classify(key, e))?;
        if !meta.is_file() {
            return NotFoundSnafu { key }.fail();
        }
        Ok(ObjectMeta {
            key: key.to_string(),
            size: meta.len(),
        })
    }

    fn fetch(&self, key: &str, range: ByteRange) -> BackendResult<Bytes> {
        let path = self.object_path(key)?;
        let mut file = File::open(path).map_err(|e| classify(key, e))?;
        let size = file.metadata().map_err(|e| classify(key, e))?.len();
        let r = range.resolve(key, size)?;
        let mut buf = vec![0u8; (r.end - r.start) as usize];
        file.seek(SeekFrom::Start(r.start))
            .map_err(|e| classify(key, e))?;
        file.read_exact(&mut buf).map_err(|e| classify(key, e))?;
        Ok(Bytes::from(buf))
    }

    #[instrument(skip(self, data), fields(len = data.len()))]
    fn put(&self, key: &str, data: Bytes) -> BackendResult<ObjectMeta> {
        let path = self.object_path(key)?;
        let size = self.write_atomic(key, &path, |f| {
            f.write_all(&data)?;
            Ok(data.len() as u64)
        })?;
        Ok(ObjectMeta {
            key: key.to_string(),
            size,
        })
    }

    fn delete(&self, key: &str) -> BackendResult<()> {
        let path = self.object_path(key)?;
        match fs::remove_file(path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(classify(key, e)),
            _ => Ok(()),
        }
    }

    fn create_session(&self, key: &str) -> BackendResult<SessionId> {
        // fail early on keys we could never complete.
        self.object_path(key)?;
        let session = SessionId::generate();
        let dir = self.session_dir(&session);
        fs::create_dir_all(&dir).map_err(|e| classify(key, e))?;
        fs::write(dir.join(SESSION_KEY_FILE), key).map_err(|e| classify(key, e))?;
        debug!("staging parts of {} in {}", key, dir.display());
        Ok(session)
    }

    fn put_part(
        &self,
        key: &str,
        session: &SessionId,
        part_number: PartNumber,
        data: Bytes,
    ) -> BackendResult<PartAck> {
        let dir = self.open_session(key, session)?;
        let tmp = dir.join(format!("part-{}.tmp", part_number));
        let guard = scopeguard::guard(tmp.clone(), |p| {
            let _ = fs::remove_file(p);
        });
        fs::write(&tmp, &data).map_err(|e| classify(key, e))?;
        fs::rename(&tmp, dir.join(format!("part-{}", part_number)))
            .map_err(|e| classify(key, e))?;
        scopeguard::ScopeGuard::into_inner(guard);
        Ok(PartAck::new(part_number, &data))
    }

    #[instrument(skip(self, parts), fields(parts = parts.len()))]
    fn complete(
        &self,
        key: &str,
        session: &SessionId,
        parts: &[PartAck],
    ) -> BackendResult<ObjectMeta> {
        let dir = self.open_session(key, session)?;
        let mut staged = Vec::with_capacity(parts.len());
        for ack in parts {
            let path = dir.join(format!("part-{}", ack.part_number));
            let len = fs::metadata(&path).map(|m| m.len()).ok();
            if len != Some(ack.size) {
                return RejectedSnafu {
                    key,
                    reason: format!("part {} is missing or has another size", ack.part_number),
                }
                .fail();
            }
            staged.push(path);
        }

        let target = self.object_path(key)?;
        let size = self.write_atomic(key, &target, |f| {
            let mut total = 0;
            for path in &staged {
                let mut part = File::open(path)?;
                total += io::copy(&mut part, f)?;
            }
            Ok(total)
        })?;

        if let Err(e) = fs::remove_dir_all(&dir) {
            warn!("failed to clean staging directory {}: {}", dir.display(), e);
        }
        Ok(ObjectMeta {
            key: key.to_string(),
            size,
        })
    }

    fn abort(&self, key: &str, session: &SessionId) -> BackendResult<()> {
        match fs::remove_dir_all(self.session_dir(session)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(classify(key, e)),
            _ => Ok(()),
        }
    }
}
