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

use std::fmt::{Display, Formatter};

use bytes::Bytes;
use kiseki_common::PartNumber;

use crate::{
    backend::{PartAck, SessionId},
    err::{PartialObjectSnafu, Result},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartStatus {
    Pending,
    InFlight,
    Committed(PartAck),
    Failed(String),
}

/// A part cut from the outbound bytes, the payload is kept until the
/// backend confirms it.
#[derive(Debug, Clone)]
pub struct PendingPart {
    pub part_number: PartNumber,
    pub len: usize,
    pub status: PartStatus,
    payload: Option<Bytes>,
}

impl PendingPart {
    pub fn payload(&self) -> Option<&Bytes> { self.payload.as_ref() }

    pub fn is_committed(&self) -> bool { matches!(self.status, PartStatus::Committed(_)) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Finalized,
    Aborted,
}

/// TransferSession tracks every part of one logical write, it ends either
/// finalized or aborted, exactly once.
#[derive(Debug)]
pub struct TransferSession {
    key: String,
    // the multipart upload on the backend, created with the first part.
    backend_session: Option<SessionId>,
    parts: Vec<PendingPart>,
    state: SessionState,
    first_error: Option<String>,
}

impl TransferSession {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            backend_session: None,
            parts: Vec::new(),
            state: SessionState::Open,
            first_error: None,
        }
    }

    pub fn key(&self) -> &str { &self.key }

    pub fn state(&self) -> SessionState { self.state }

    pub fn is_open(&self) -> bool { self.state == SessionState::Open }

    pub fn backend_session(&self) -> Option<&SessionId> { self.backend_session.as_ref() }

    pub fn bind(&mut self, session: SessionId) { self.backend_session = Some(session); }

    pub fn parts(&self) -> &[PendingPart] { &self.parts }

    pub fn part(&self, part_number: PartNumber) -> Option<&PendingPart> {
        part_number
            .checked_sub(1)
            .and_then(|idx| self.parts.get(idx))
    }

    pub fn part_count(&self) -> usize { self.parts.len() }

    pub fn committed_bytes(&self) -> u64 {
        self.parts
            .iter()
            .filter(|p| p.is_committed())
            .map(|p| p.len as u64)
            .sum()
    }

    /// Queue a payload as the next part, numbers start at 1 and never skip.
    pub fn stage(&mut self, payload: Bytes) -> PartNumber {
        let part_number = self.parts.len() + 1;
        self.parts.push(PendingPart {
            part_number,
            len: payload.len(),
            status: PartStatus::Pending,
            payload: Some(payload),
        });
        part_number
    }

    fn part_mut(&mut self, part_number: PartNumber) -> Option<&mut PendingPart> {
        part_number
            .checked_sub(1)
            .and_then(|idx| self.parts.get_mut(idx))
    }

    /// Hand out the payload of a pending part for its upload. `None` when
    /// the part is unknown or already past pending.
    pub fn start(&mut self, part_number: PartNumber) -> Option<Bytes> {
        let part = self.part_mut(part_number)?;
        if part.status != PartStatus::Pending {
            return None;
        }
        let payload = part.payload.clone()?;
        part.status = PartStatus::InFlight;
        Some(payload)
    }

    pub fn commit(&mut self, part_number: PartNumber, ack: PartAck) {
        if let Some(part) = self.part_mut(part_number) {
            part.status = PartStatus::Committed(ack);
            part.payload = None;
        }
    }

    pub fn fail(&mut self, part_number: PartNumber, reason: String) {
        if let Some(part) = self.part_mut(part_number) {
            part.status = PartStatus::Failed(reason.clone());
            part.payload = None;
        }
        self.record_error(reason);
    }

    /// Keep the first fatal error only.
    pub fn record_error(&mut self, reason: String) {
        if self.first_error.is_none() {
            self.first_error = Some(reason);
        }
    }

    pub fn first_error(&self) -> Option<&str> { self.first_error.as_deref() }

    /// The acks to complete the object with, in part order.
    ///
    /// Every part from 1 to the last one has to be committed.
    pub fn acks(&self) -> Result<Vec<PartAck>> {
        let mut acks = Vec::with_capacity(self.parts.len());
        for (idx, part) in self.parts.iter().enumerate() {
            let expect = idx + 1;
            match &part.status {
                PartStatus::Committed(ack)
                    if part.part_number == expect && ack.part_number == expect =>
                {
                    acks.push(ack.clone())
                }
                other => {
                    return PartialObjectSnafu {
                        key: self.key.as_str(),
                        reason: format!("part {} is {:?}", expect, other),
                    }
                    .fail();
                }
            }
        }
        Ok(acks)
    }

    pub fn mark_finalized(&mut self) { self.state = SessionState::Finalized; }

    pub fn mark_aborted(&mut self) {
        self.state = SessionState::Aborted;
        for part in self.parts.iter_mut() {
            part.payload = None;
        }
    }
}

impl Display for TransferSession {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "TransferSession {{ key: {}, session: {}, parts: {}, state: {:?} }}",
            self.key,
            self.backend_session
                .as_ref()
                .map(|s| s.as_str())
                .unwrap_or("-"),
            self.parts.len(),
            self.state,
        )
    }
}
