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
use kiseki_utils::readable_size::ReadableSize;
use snafu::IntoError;
use tracing::{debug, error, info, warn};

use crate::{
    backend::{ObjectMeta, PartAck, SessionId},
    err::{
        Error, PartLimitExceededSnafu, PartUploadSnafu, PartialObjectSnafu, Result,
        TransferAbortedSnafu, TransferFinalizedSnafu,
    },
    session::{SessionState, TransferSession},
    uploader::PartUploader,
};

///
/// TransferOrchestrator drives one [TransferSession] through
///
/// ```text
///   open --flush_part--> open --finalize--> finalized
///     |                    |
///     +-------abort--------+--> aborted
/// ```
///
/// It hands out part numbers, makes sure the completion sees every part in
/// order, and aborts the backend upload on the first fatal error so that
/// nothing half written ever shows up at the key.
///
#[derive(Debug)]
pub struct TransferOrchestrator {
    uploader: PartUploader,
    session: TransferSession,
    max_part_count: usize,
}

impl TransferOrchestrator {
    pub fn new(uploader: PartUploader, key: impl Into<String>, max_part_count: usize) -> Self {
        Self {
            uploader,
            session: TransferSession::new(key),
            max_part_count,
        }
    }

    pub fn key(&self) -> &str { self.session.key() }

    pub fn session(&self) -> &TransferSession { &self.session }

    pub fn state(&self) -> SessionState { self.session.state() }

    pub fn part_count(&self) -> usize { self.session.part_count() }

    /// The first fatal error of this transfer.
    pub fn first_error(&self) -> Option<&str> { self.session.first_error() }

    fn check_open(&self) -> Result<()> {
        match self.session.state() {
            SessionState::Open => Ok(()),
            SessionState::Finalized => TransferFinalizedSnafu { key: self.key() }.fail(),
            SessionState::Aborted => TransferAbortedSnafu { key: self.key() }.fail(),
        }
    }

    fn backend_session(&mut self) -> Result<SessionId> {
        if let Some(session) = self.session.backend_session() {
            return Ok(session.clone());
        }
        let session = self.uploader.create_session(self.session.key())?;
        debug!("start multipart upload {} for {}", session, self.key());
        self.session.bind(session.clone());
        Ok(session)
    }

    /// Store `data` as the next part, right now.
    ///
    /// On failure the whole transfer is aborted and the error is wrapped in
    /// [Error::PartUpload].
    pub fn flush_part(&mut self, data: Bytes) -> Result<PartAck> {
        self.check_open()?;
        if self.session.part_count() >= self.max_part_count {
            let e = PartLimitExceededSnafu {
                key: self.key(),
                limit: self.max_part_count,
            }
            .build();
            return Err(self.abort_with(e));
        }
        let session = match self.backend_session() {
            Ok(session) => session,
            Err(e) => return Err(self.abort_with(e)),
        };

        let part_number = self.session.stage(data);
        let Some(payload) = self.session.start(part_number) else {
            let e = PartialObjectSnafu {
                key: self.key(),
                reason: format!("part {} has no payload to upload", part_number),
            }
            .build();
            return Err(self.abort_with(e));
        };
        let len = payload.len();
        match self
            .uploader
            .upload_part(self.session.key(), &session, part_number, payload)
        {
            Ok(ack) => {
                info!(
                    "stored part {} of {}, {}",
                    part_number,
                    self.key(),
                    ReadableSize(len as u64)
                );
                self.session.commit(part_number, ack.clone());
                Ok(ack)
            }
            Err(e) => {
                self.session.fail(part_number, e.to_string());
                let e = PartUploadSnafu {
                    key: self.key(),
                    part_number,
                }
                .into_error(e);
                Err(self.abort_with(e))
            }
        }
    }

    /// Complete the multipart upload, the object shows up at its key once
    /// this returns. Runs at most once.
    pub fn finalize(&mut self) -> Result<ObjectMeta> {
        self.check_open()?;
        let acks = match self.session.acks() {
            Ok(acks) if acks.is_empty() => {
                let e = PartialObjectSnafu {
                    key: self.key(),
                    reason: "no part was stored",
                }
                .build();
                return Err(self.abort_with(e));
            }
            Ok(acks) => acks,
            Err(e) => return Err(self.abort_with(e)),
        };
        let session = match self.session.backend_session() {
            Some(session) => session.clone(),
            None => {
                let e = PartialObjectSnafu {
                    key: self.key(),
                    reason: "no multipart upload to complete",
                }
                .build();
                return Err(self.abort_with(e));
            }
        };

        match self.uploader.complete(self.session.key(), &session, &acks) {
            Ok(meta) => {
                self.session.mark_finalized();
                info!(
                    "completed {} from {} parts, {}",
                    self.key(),
                    acks.len(),
                    ReadableSize(meta.size)
                );
                Ok(meta)
            }
            Err(e) => Err(self.abort_with(e)),
        }
    }

    /// Store the whole object with one put, for transfers that never
    /// flushed a part.
    pub fn put_whole(&mut self, data: Bytes) -> Result<ObjectMeta> {
        self.check_open()?;
        if self.session.part_count() > 0 {
            let e = PartialObjectSnafu {
                key: self.key(),
                reason: "parts were already stored",
            }
            .build();
            return Err(self.abort_with(e));
        }
        match self.uploader.put(self.session.key(), data) {
            Ok(meta) => {
                self.session.mark_finalized();
                debug!("put {} directly, {}", self.key(), ReadableSize(meta.size));
                Ok(meta)
            }
            Err(e) => Err(self.abort_with(e)),
        }
    }

    /// Drop the transfer and every stored part. Aborting twice is fine,
    /// aborting a finalized transfer is not.
    pub fn abort(&mut self) -> Result<()> {
        match self.session.state() {
            SessionState::Aborted => return Ok(()),
            SessionState::Finalized => return TransferFinalizedSnafu { key: self.key() }.fail(),
            SessionState::Open => {}
        }
        self.session.mark_aborted();
        let Some(session) = self.session.backend_session().cloned() else {
            return Ok(());
        };
        warn!("abort multipart upload {} of {}", session, self.key());
        self.uploader.abort(self.session.key(), &session)
    }

    // record `e` as the cause, abort, and give `e` back.
    fn abort_with(&mut self, e: Error) -> Error {
        error!("transfer of {} failed: {}", self.key(), e);
        self.session.record_error(e.to_string());
        if let Err(abort_err) = self.abort() {
            warn!("failed to abort the transfer of {}: {}", self.key(), abort_err);
        }
        e
    }
}
