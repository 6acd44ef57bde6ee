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

use bytes::Bytes;
use kiseki_common::PartNumber;
use snafu::IntoError;
use tracing::{debug, instrument};

use crate::{
    backend::{BackendRef, ObjectMeta, PartAck, SessionId},
    err::{Error, PermanentUploadSnafu, Result, TransientUploadSnafu},
    retry::{RetryError, RetryPolicy},
};

fn upload_error(key: &str, op: &'static str, e: RetryError) -> Error {
    match e {
        RetryError::Exhausted { attempts, last } => TransientUploadSnafu { key, op, attempts }.into_error(last),
        RetryError::Permanent { error, .. } => PermanentUploadSnafu { key, op }.into_error(error),
    }
}

/// PartUploader runs the write side calls of a backend under the retry
/// policy. It stores what it is given, in the order it is given, numbering
/// is the caller's business.
#[derive(Debug, Clone)]
pub struct PartUploader {
    backend: BackendRef,
    retry: RetryPolicy,
}

impl PartUploader {
    pub fn new(backend: BackendRef, retry: RetryPolicy) -> Self { Self { backend, retry } }

    pub fn backend(&self) -> &BackendRef { &self.backend }

    pub fn create_session(&self, key: &str) -> Result<SessionId> {
        self.retry
            .run("create session", |_| self.backend.create_session(key))
            .map_err(|e| upload_error(key, "create session", e))
    }

    #[instrument(skip(self, data), fields(len = data.len()))]
    pub fn upload_part(
        &self,
        key: &str,
        session: &SessionId,
        part_number: PartNumber,
        data: Bytes,
    ) -> Result<PartAck> {
        self.retry
            .run("upload part", |attempt| {
                if attempt > 1 {
                    debug!("upload part {} of {} again, attempt {}", part_number, key, attempt);
                }
                self.backend.put_part(key, session, part_number, data.clone())
            })
            .map_err(|e| upload_error(key, "upload part", e))
    }

    #[instrument(skip(self, acks), fields(parts = acks.len()))]
    pub fn complete(&self, key: &str, session: &SessionId, acks: &[PartAck]) -> Result<ObjectMeta> {
        self.retry
            .run("complete", |_| self.backend.complete(key, session, acks))
            .map_err(|e| upload_error(key, "complete", e))
    }

    pub fn abort(&self, key: &str, session: &SessionId) -> Result<()> {
        self.retry
            .run("abort", |_| self.backend.abort(key, session))
            .map_err(|e| upload_error(key, "abort", e))
    }

    /// Store a small object with one call.
    #[instrument(skip(self, data), fields(len = data.len()))]
    pub fn put(&self, key: &str, data: Bytes) -> Result<ObjectMeta> {
        self.retry
            .run("put", |_| self.backend.put(key, data.clone()))
            .map_err(|e| upload_error(key, "put", e))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        backend::testkit::{BackendOp, FailureKind, InstrumentedBackend},
        config::RetryConfig,
    };

    fn uploader(backend: Arc<InstrumentedBackend>, attempts: usize) -> PartUploader {
        PartUploader::new(backend, RetryPolicy::new(RetryConfig::no_delay(attempts)))
    }

    #[test]
    fn parts_are_retried() {
        let backend = Arc::new(InstrumentedBackend::in_memory());
        let up = uploader(backend.clone(), 3);
        let session = up.create_session("obj").unwrap();
        backend.fail_part(1, FailureKind::Transient, 2);
        let a1 = up
            .upload_part("obj", &session, 1, Bytes::from_static(b"hello "))
            .unwrap();
        assert_eq!(backend.calls(BackendOp::PutPart), 3);
        let a2 = up
            .upload_part("obj", &session, 2, Bytes::from_static(b"world"))
            .unwrap();
        let meta = up.complete("obj", &session, &[a1, a2]).unwrap();
        assert_eq!(meta.size, 11);
    }

    #[test]
    fn exhausted_and_permanent() {
        let backend = Arc::new(InstrumentedBackend::in_memory());
        let up = uploader(backend.clone(), 2);
        let session = up.create_session("obj").unwrap();

        backend.fail_part(1, FailureKind::Transient, 2);
        let e = up
            .upload_part("obj", &session, 1, Bytes::from_static(b"x"))
            .unwrap_err();
        assert!(matches!(e, Error::TransientUpload { attempts: 2, .. }));

        backend.fail(BackendOp::Put, FailureKind::Permanent, 1);
        let e = up.put("small", Bytes::from_static(b"x")).unwrap_err();
        assert!(matches!(e, Error::PermanentUpload { op: "put", .. }));
        assert_eq!(backend.calls(BackendOp::Put), 1);

        up.abort("obj", &session).unwrap();
    }
}
