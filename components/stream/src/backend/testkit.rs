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

//! A backend decorator for tests: counts calls and fails on demand.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use dashmap::DashMap;
use kiseki_common::{ObjectSize, PartNumber};

use super::{BackendRef, ByteRange, MemoryBackend, ObjectBackend, ObjectMeta, PartAck, SessionId};
use crate::err::{BackendError, BackendResult, RejectedSnafu, UnavailableSnafu};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendOp {
    Stat,
    Fetch,
    Put,
    Delete,
    CreateSession,
    PutPart,
    Complete,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Fails with [BackendError::Unavailable], worth a retry.
    Transient,
    /// Fails with [BackendError::Rejected].
    Permanent,
}

#[derive(Debug)]
struct Fault {
    op: BackendOp,
    // only for [BackendOp::PutPart], `None` matches every part.
    part_number: Option<PartNumber>,
    kind: FailureKind,
    remaining: usize,
}

#[derive(Debug)]
pub struct InstrumentedBackend {
    inner: BackendRef,
    calls: DashMap<BackendOp, usize>,
    faults: Mutex<Vec<Fault>>,
    fetches: Mutex<Vec<ByteRange>>,
    completions: Mutex<Vec<Vec<PartNumber>>>,
}

impl InstrumentedBackend {
    pub fn new(inner: BackendRef) -> Self {
        Self {
            inner,
            calls: DashMap::new(),
            faults: Mutex::new(Vec::new()),
            fetches: Mutex::new(Vec::new()),
            completions: Mutex::new(Vec::new()),
        }
    }

    pub fn in_memory() -> Self { Self::new(Arc::new(MemoryBackend::new())) }

    pub fn inner(&self) -> &BackendRef { &self.inner }

    /// Make the next `times` calls of `op` fail.
    pub fn fail(&self, op: BackendOp, kind: FailureKind, times: usize) {
        self.push_fault(op, None, kind, times);
    }

    /// Make the next `times` uploads of part `part_number` fail.
    pub fn fail_part(&self, part_number: PartNumber, kind: FailureKind, times: usize) {
        self.push_fault(BackendOp::PutPart, Some(part_number), kind, times);
    }

    fn push_fault(
        &self,
        op: BackendOp,
        part_number: Option<PartNumber>,
        kind: FailureKind,
        times: usize,
    ) {
        self.faults.lock().unwrap().push(Fault {
            op,
            part_number,
            kind,
            remaining: times,
        });
    }

    pub fn calls(&self, op: BackendOp) -> usize { self.calls.get(&op).map(|c| *c).unwrap_or(0) }

    /// Every range asked through [ObjectBackend::fetch], in order.
    pub fn fetch_log(&self) -> Vec<ByteRange> { self.fetches.lock().unwrap().clone() }

    /// The part numbers handed to every [ObjectBackend::complete] call.
    pub fn completions(&self) -> Vec<Vec<PartNumber>> { self.completions.lock().unwrap().clone() }

    pub fn reset_counters(&self) {
        self.calls.clear();
        self.fetches.lock().unwrap().clear();
        self.completions.lock().unwrap().clear();
    }

    fn enter(&self, op: BackendOp, key: &str, part_number: Option<PartNumber>) -> BackendResult<()> {
        *self.calls.entry(op).or_insert(0) += 1;
        let mut faults = self.faults.lock().unwrap();
        let hit = faults.iter_mut().find(|f| {
            f.op == op
                && f.remaining > 0
                && (f.part_number.is_none() || f.part_number == part_number)
        });
        let Some(fault) = hit else {
            return Ok(());
        };
        fault.remaining -= 1;
        let err: BackendError = match fault.kind {
            FailureKind::Transient => UnavailableSnafu {
                key,
                reason: format!("injected transient failure on {:?}", op),
            }
            .build(),
            FailureKind::Permanent => RejectedSnafu {
                key,
                reason: format!("injected permanent failure on {:?}", op),
            }
            .build(),
        };
        Err(err)
    }
}

impl ObjectBackend for InstrumentedBackend {
    fn name(&self) -> &'static str { "instrumented" }

    fn stat(&self, key: &str) -> BackendResult<ObjectMeta> {
        self.enter(BackendOp::Stat, key, None)?;
        self.inner.stat(key)
    }

    fn fetch(&self, key: &str, range: ByteRange) -> BackendResult<Bytes> {
        self.fetches.lock().unwrap().push(range);
        self.enter(BackendOp::Fetch, key, None)?;
        self.inner.fetch(key, range)
    }

    fn fetch_within(&self, key: &str, range: ByteRange, size: ObjectSize) -> BackendResult<Bytes> {
        self.fetches.lock().unwrap().push(range);
        self.enter(BackendOp::Fetch, key, None)?;
        self.inner.fetch_within(key, range, size)
    }

    fn put(&self, key: &str, data: Bytes) -> BackendResult<ObjectMeta> {
        self.enter(BackendOp::Put, key, None)?;
        self.inner.put(key, data)
    }

    fn delete(&self, key: &str) -> BackendResult<()> {
        self.enter(BackendOp::Delete, key, None)?;
        self.inner.delete(key)
    }

    fn create_session(&self, key: &str) -> BackendResult<SessionId> {
        self.enter(BackendOp::CreateSession, key, None)?;
        self.inner.create_session(key)
    }

    fn put_part(
        &self,
        key: &str,
        session: &SessionId,
        part_number: PartNumber,
        data: Bytes,
    ) -> BackendResult<PartAck> {
        self.enter(BackendOp::PutPart, key, Some(part_number))?;
        self.inner.put_part(key, session, part_number, data)
    }

    fn complete(
        &self,
        key: &str,
        session: &SessionId,
        parts: &[PartAck],
    ) -> BackendResult<ObjectMeta> {
        self.completions
            .lock()
            .unwrap()
            .push(parts.iter().map(|p| p.part_number).collect());
        self.enter(BackendOp::Complete, key, None)?;
        self.inner.complete(key, session, parts)
    }

    fn abort(&self, key: &str, session: &SessionId) -> BackendResult<()> {
        self.enter(BackendOp::Abort, key, None)?;
        self.inner.abort(key, session)
    }
}
