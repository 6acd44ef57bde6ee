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
    io::{BufRead, Read, Seek, SeekFrom, Write},
    sync::Arc,
};

use kiseki_stream::{
    backend::{testkit::InstrumentedBackend, BackendRef, LocalBackend, ObjectBackend, OpenDalBackend},
    OutputState, Transfers,
};
use tracing::info;

use crate::{fast_config, pattern};

fn exercise(backend: BackendRef) {
    info!("exercise {:?}", backend);
    let t = Transfers::new(backend, fast_config().with_part_size(4096).with_buffer_size(1000))
        .unwrap();

    for (key, len) in [("small.bin", 100), ("nested/dir/large.bin", 20_000)] {
        let data = pattern(len);
        let mut w = t.writer(key).unwrap();
        w.write_all(&data).unwrap();
        w.close().unwrap();
        assert_eq!(w.object().unwrap().size, len as u64);

        let mut r = t.reader(key).unwrap();
        let mut back = Vec::new();
        r.read_to_end(&mut back).unwrap();
        assert_eq!(back, data, "{key}");

        Seek::seek(&mut r, SeekFrom::Start(len as u64 / 2)).unwrap();
        let mut half = Vec::new();
        r.read_to_end(&mut half).unwrap();
        assert_eq!(half, &data[len / 2..], "{key}");
    }

    let mut w = t.writer("text.txt").unwrap();
    for i in 0..300 {
        writeln!(w, "row {i}").unwrap();
    }
    w.close().unwrap();
    let r = t.reader("text.txt").unwrap();
    let rows = r.lines().collect::<Result<Vec<_>, _>>().unwrap();
    assert_eq!(rows.len(), 300);
    assert_eq!(rows[299], "row 299");

    // a dropped writer leaves nothing.
    {
        let mut w = t.writer("dropped.bin").unwrap();
        w.write_all(&pattern(10_000)).unwrap();
    }
    assert!(t.reader("dropped.bin").unwrap_err().is_not_found());
}

#[test]
fn local_backend() {
    let dir = tempfile::tempdir().unwrap();
    exercise(Arc::new(LocalBackend::new(dir.path()).unwrap()));
}

#[test]
fn opendal_fs_backend() {
    let dir = tempfile::tempdir().unwrap();
    exercise(Arc::new(
        OpenDalBackend::fs(dir.path().to_str().unwrap()).unwrap(),
    ));
}

#[test]
fn opendal_memory_backend() { exercise(Arc::new(OpenDalBackend::memory().unwrap())); }

#[test]
fn instrumented_over_local() {
    let dir = tempfile::tempdir().unwrap();
    let local: BackendRef = Arc::new(LocalBackend::new(dir.path()).unwrap());
    exercise(Arc::new(InstrumentedBackend::new(local)));
}

#[test]
fn opendal_fs_failed_completion_leaves_no_object() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(OpenDalBackend::fs(dir.path().to_str().unwrap()).unwrap());
    let t = Transfers::new(backend.clone(), fast_config().with_part_size(4096)).unwrap();
    backend
        .put("kept.bin", bytes::Bytes::from_static(b"previous"))
        .unwrap();

    for key in ["fresh.bin", "kept.bin"] {
        let mut w = t.writer(key).unwrap();
        w.write_all(&pattern(3 * 4096)).unwrap();
        let session = w
            .orchestrator()
            .session()
            .backend_session()
            .unwrap()
            .clone();
        // a staged part vanishes before the object is assembled.
        let staged = dir
            .path()
            .join(kiseki_common::MULTIPART_STAGING_PREFIX)
            .join(session.as_str());
        std::fs::remove_file(staged.join("part-2")).unwrap();

        w.write_all(&pattern(100)).unwrap();
        assert!(w.close().is_err());
        assert_eq!(w.state(), OutputState::Aborted);
        assert!(!staged.exists());
    }

    assert!(backend.stat("fresh.bin").unwrap_err().is_not_found());
    assert!(!dir.path().join("fresh.bin").exists());
    assert_eq!(backend.stat("kept.bin").unwrap().size, 8);
}
