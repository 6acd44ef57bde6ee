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

use std::io::Write;

use kiseki_stream::{
    backend::{
        testkit::{BackendOp, FailureKind},
        ObjectBackend,
    },
    Error, OutputState, WriteBufferKind,
};
use kiseki_utils::readable_size::ReadableSize;

use crate::{fast_config, instrumented, pattern};

#[test]
fn ten_mib_in_two_parts() {
    let part = ReadableSize::mb(5).as_bytes_usize();
    let (backend, t) = instrumented(fast_config().with_part_size(part));
    let data = pattern(ReadableSize::mb(10).as_bytes_usize());

    let mut w = t.writer("big").unwrap();
    for chunk in data.chunks(300 << 10) {
        w.write_all(chunk).unwrap();
    }
    assert!(backend.stat("big").is_err());
    w.close().unwrap();

    assert_eq!(backend.calls(BackendOp::PutPart), 2);
    assert_eq!(backend.calls(BackendOp::Complete), 1);
    assert_eq!(backend.completions(), vec![vec![1, 2]]);
    assert_eq!(backend.calls(BackendOp::Put), 0);

    let mut r = t.reader("big").unwrap();
    assert_eq!(r.read(None).unwrap().as_ref(), data.as_slice());
}

#[test]
fn round_trip_around_threshold() {
    let part = 1000;
    for len in [0, 1, 999, 1000, 1001, 2000, 4321] {
        let (backend, t) = instrumented(fast_config().with_part_size(part).with_buffer_size(128));
        let data = pattern(len);
        let mut w = t.writer("obj").unwrap();
        w.write_all(&data).unwrap();
        w.close().unwrap();
        assert_eq!(w.tell(), len as u64);

        if len < part {
            assert_eq!(backend.calls(BackendOp::Put), 1, "len {len}");
            assert_eq!(backend.calls(BackendOp::CreateSession), 0, "len {len}");
        } else {
            assert_eq!(backend.calls(BackendOp::Put), 0, "len {len}");
            assert_eq!(
                backend.calls(BackendOp::PutPart),
                (len + part - 1) / part,
                "len {len}"
            );
        }

        let mut r = t.reader("obj").unwrap();
        assert_eq!(r.read(None).unwrap().as_ref(), data.as_slice(), "len {len}");
    }
}

#[test]
fn permanent_part_failure_leaves_nothing() {
    let (backend, t) = instrumented(fast_config().with_part_size(100));
    let n = 4;
    backend.fail_part(n, FailureKind::Permanent, 1);

    let mut w = t.writer("obj").unwrap();
    let data = pattern(100 * n + 50);
    let e = w.write_all(&data).unwrap_err();
    assert!(e.to_string().contains("part 4"));
    assert_eq!(backend.calls(BackendOp::PutPart), n);
    assert_eq!(w.state(), OutputState::Aborted);

    // close after the failure is quiet and still leaves nothing behind.
    w.close().unwrap();
    assert!(backend.stat("obj").unwrap_err().is_not_found());
    assert_eq!(backend.calls(BackendOp::Abort), 1);
    assert_eq!(backend.calls(BackendOp::Complete), 0);
}

#[test]
fn transient_part_failures_are_retried() {
    let (backend, t) = instrumented(fast_config().with_part_size(100));
    backend.fail_part(2, FailureKind::Transient, 2);
    let data = pattern(350);
    let mut w = t.writer("obj").unwrap();
    w.write_all(&data).unwrap();
    w.close().unwrap();
    assert_eq!(backend.calls(BackendOp::PutPart), 4 + 2);
    assert_eq!(backend.completions(), vec![vec![1, 2, 3, 4]]);
    assert_eq!(t.reader("obj").unwrap().read(None).unwrap().as_ref(), data.as_slice());
}

#[test]
fn failed_completion_aborts() {
    let (backend, t) = instrumented(fast_config().with_part_size(100));
    backend.fail(BackendOp::Complete, FailureKind::Permanent, 1);
    let mut w = t.writer("obj").unwrap();
    w.write_all(&pattern(250)).unwrap();
    let e = w.close().unwrap_err();
    assert!(matches!(e, Error::PermanentUpload { op: "complete", .. }));
    assert_eq!(w.state(), OutputState::Aborted);
    assert_eq!(backend.calls(BackendOp::Abort), 1);
    assert!(backend.stat("obj").is_err());
}

#[test]
fn leaving_scope_aborts() {
    let (backend, t) = instrumented(fast_config().with_part_size(100));
    {
        let mut w = t.writer("obj").unwrap();
        w.write_all(&pattern(250)).unwrap();
    }
    assert_eq!(backend.calls(BackendOp::PutPart), 2);
    assert_eq!(backend.calls(BackendOp::Abort), 1);
    assert!(backend.stat("obj").is_err());
}

#[test]
fn previous_object_survives_failed_rewrite() {
    let (backend, t) = instrumented(fast_config().with_part_size(100));
    let old = pattern(150);
    let mut w = t.writer("obj").unwrap();
    w.write_all(&old).unwrap();
    w.close().unwrap();

    backend.fail_part(2, FailureKind::Permanent, 1);
    let mut w = t.writer("obj").unwrap();
    assert!(w.write_all(&pattern(300)).is_err());
    w.close().unwrap();

    let mut r = t.reader("obj").unwrap();
    assert_eq!(r.read(None).unwrap().as_ref(), old.as_slice());
}

#[test]
fn disk_write_buffer_round_trip() {
    let (_, t) = instrumented(
        fast_config()
            .with_part_size(1 << 10)
            .with_write_buffer(WriteBufferKind::Disk),
    );
    let data = pattern(10_000);
    let mut w = t.writer("obj").unwrap();
    for chunk in data.chunks(777) {
        w.write_all(chunk).unwrap();
    }
    w.close().unwrap();
    assert_eq!(w.orchestrator().part_count(), 10);
    assert_eq!(t.reader("obj").unwrap().read(None).unwrap().as_ref(), data.as_slice());
}

#[test]
fn part_limit_aborts() {
    let mut config = fast_config().with_part_size(10);
    config.max_part_count = 3;
    let (backend, t) = instrumented(config);
    let mut w = t.writer("obj").unwrap();
    let e = w.write_bytes(&pattern(45)).unwrap_err();
    assert!(matches!(e, Error::PartLimitExceeded { limit: 3, .. }));
    assert_eq!(backend.calls(BackendOp::Abort), 1);
    assert!(backend.stat("obj").is_err());
}
