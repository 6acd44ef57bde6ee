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
use kiseki_stream::{
    backend::{
        testkit::{BackendOp, FailureKind},
        ObjectBackend,
    },
    Error, InputState, Whence,
};

use crate::{fast_config, instrumented, pattern};

#[test]
fn window_sized_fetches() {
    let (backend, t) = instrumented(fast_config().with_buffer_size(64));
    let data = pattern(100);
    backend.put("obj", Bytes::from(data.clone())).unwrap();
    backend.reset_counters();

    let mut r = t.reader("obj").unwrap();
    assert_eq!(r.read(Some(100)).unwrap().as_ref(), data.as_slice());
    assert_eq!(backend.calls(BackendOp::Fetch), 2);
    assert_eq!(r.stats().fetches, 2);
}

#[test]
fn exact_reads_until_eof() {
    let (backend, t) = instrumented(fast_config().with_buffer_size(7));
    let data = pattern(50);
    backend.put("obj", Bytes::from(data.clone())).unwrap();

    let mut r = t.reader("obj").unwrap();
    let mut got = Vec::new();
    loop {
        let chunk = r.read(Some(9)).unwrap();
        if got.len() + 9 <= data.len() {
            assert_eq!(chunk.len(), 9);
        } else {
            assert_eq!(chunk.len(), data.len() - got.len());
        }
        if chunk.is_empty() {
            break;
        }
        got.extend_from_slice(&chunk);
    }
    assert_eq!(got, data);
    assert_eq!(r.state(), InputState::Eof);

    let fetches = backend.calls(BackendOp::Fetch);
    for _ in 0..3 {
        assert!(r.read(Some(1)).unwrap().is_empty());
        assert!(r.read(None).unwrap().is_empty());
    }
    assert_eq!(backend.calls(BackendOp::Fetch), fetches);
}

#[test]
fn seek_to_current_never_fetches() {
    let (backend, t) = instrumented(fast_config().with_buffer_size(16));
    backend.put("obj", Bytes::from(pattern(100))).unwrap();

    let mut r = t.reader("obj").unwrap();
    r.read(Some(40)).unwrap();
    let fetches = backend.calls(BackendOp::Fetch);
    assert_eq!(r.seek(0, Whence::Current).unwrap(), 40);
    assert_eq!(r.seek(40, Whence::Start).unwrap(), 40);
    assert_eq!(r.seek(-60, Whence::End).unwrap(), 40);
    assert_eq!(backend.calls(BackendOp::Fetch), fetches);
    assert_eq!(r.stats().seeks, 0);
}

#[test]
fn seek_then_read_matches_sequential() {
    let data = pattern(1000);
    for defer_seek in [false, true] {
        let (backend, t) = instrumented(
            fast_config()
                .with_buffer_size(64)
                .with_defer_seek(defer_seek),
        );
        backend.put("obj", Bytes::from(data.clone())).unwrap();

        for offset in [0usize, 1, 63, 64, 65, 500, 936, 999, 1000] {
            // read and discard.
            let mut seq = t.reader("obj").unwrap();
            seq.read(Some(offset)).unwrap();
            let want = seq.read(Some(100)).unwrap();

            let mut r = t.reader("obj").unwrap();
            // wander around first so the buffer holds something else.
            r.seek(700, Whence::Start).unwrap();
            r.read(Some(10)).unwrap();
            assert_eq!(r.seek(offset as i64, Whence::Start).unwrap(), offset as u64);
            let got = r.read(Some(100)).unwrap();
            assert_eq!(got, want, "offset {offset}, defer_seek {defer_seek}");
            assert_eq!(r.tell(), (offset + got.len()) as u64);
        }
    }
}

#[test]
fn readline_is_linear() {
    let (backend, t) = instrumented(fast_config().with_buffer_size(100));
    let mut data = Vec::new();
    let k = 1000;
    for i in 0..k {
        data.extend_from_slice(format!("{}:{}\n", i, "x".repeat(i % 37)).as_bytes());
    }
    backend.put("lines", Bytes::from(data.clone())).unwrap();

    let mut r = t.reader("lines").unwrap();
    let mut lines = 0;
    while !r.readline().unwrap().is_empty() {
        lines += 1;
    }
    assert_eq!(lines, k);
    let stats = r.stats();
    assert_eq!(stats.scanned_bytes, data.len() as u64);
    assert_eq!(stats.fetched_bytes, data.len() as u64);
}

#[test]
fn crlf_lines_across_windows() {
    let (backend, t) = instrumented(
        fast_config()
            .with_buffer_size(3)
            .with_line_terminator(b"\r\n"),
    );
    backend
        .put("lines", Bytes::from_static(b"ab\r\ncd\r\n\r\nlast"))
        .unwrap();
    let mut r = t.reader("lines").unwrap();
    let mut lines = Vec::new();
    loop {
        let line = r.readline().unwrap();
        if line.is_empty() {
            break;
        }
        lines.push(line);
    }
    assert_eq!(
        lines,
        vec![
            Bytes::from_static(b"ab\r\n"),
            Bytes::from_static(b"cd\r\n"),
            Bytes::from_static(b"\r\n"),
            Bytes::from_static(b"last"),
        ]
    );
}

#[test]
fn retries_are_only_latency() {
    let (backend, t) = instrumented(fast_config().with_buffer_size(10));
    let data = pattern(30);
    backend.put("obj", Bytes::from(data.clone())).unwrap();
    let mut r = t.reader("obj").unwrap();
    backend.fail(BackendOp::Fetch, FailureKind::Transient, 2);
    assert_eq!(r.read(None).unwrap().as_ref(), data.as_slice());
    assert_eq!(r.stats().fetch_attempts, 3);
}

#[test]
fn exhausted_retries_fail_the_stream() {
    let (backend, t) = instrumented(fast_config().with_buffer_size(10));
    backend.put("obj", Bytes::from(pattern(30))).unwrap();
    let mut r = t.reader("obj").unwrap();
    r.read(Some(10)).unwrap();

    backend.fail(BackendOp::Fetch, FailureKind::Transient, 3);
    let e = r.read(Some(10)).unwrap_err();
    assert!(e.is_transient());
    assert_eq!(r.state(), InputState::Failed);
    assert!(matches!(
        r.read(Some(1)).unwrap_err(),
        Error::StreamFailed { .. }
    ));
}

#[test]
fn missing_object_is_permanent() {
    let (backend, t) = instrumented(fast_config());
    let e = t.reader("missing").unwrap_err();
    assert!(e.is_not_found());
    assert!(!e.is_transient());
    assert_eq!(backend.calls(BackendOp::Stat), 1);
    let io: std::io::Error = e.into();
    assert_eq!(io.kind(), std::io::ErrorKind::NotFound);
}
