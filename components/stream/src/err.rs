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

use std::io::ErrorKind;

use kiseki_common::PartNumber;
use snafu::{Location, Snafu};

/// Errors reported by an [crate::backend::ObjectBackend].
///
/// Every variant is classified as transient or permanent, the retry layer
/// only looks at [BackendError::is_transient].
#[derive(Snafu, Debug)]
#[snafu(visibility(pub))]
pub enum BackendError {
    #[snafu(display("object {key} not found"))]
    NotFound {
        key: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("access to {key} denied: {reason}"))]
    PermissionDenied {
        key: String,
        reason: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("range starting at {offset} is invalid for {key} of size {size}"))]
    InvalidRange {
        key: String,
        offset: u64,
        size: u64,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("no upload session {session} for {key}"))]
    NoSuchSession {
        key: String,
        session: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("backend unavailable for {key}: {reason}"))]
    Unavailable {
        key: String,
        reason: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("backend rejected the request for {key}: {reason}"))]
    Rejected {
        key: String,
        reason: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("io error on {key}"))]
    Io {
        key: String,
        source: std::io::Error,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("OpenDAL operator failed on {key}"))]
    OpenDal {
        key: String,
        #[snafu(source)]
        error: opendal::Error,
        #[snafu(implicit)]
        location: Location,
    },
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Unavailable { .. } => true,
            BackendError::Io { source, .. } => matches!(
                source.kind(),
                ErrorKind::Interrupted
                    | ErrorKind::TimedOut
                    | ErrorKind::WouldBlock
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
                    | ErrorKind::UnexpectedEof
            ),
            BackendError::OpenDal { error, .. } => error.is_temporary(),
            BackendError::NotFound { .. }
            | BackendError::PermissionDenied { .. }
            | BackendError::InvalidRange { .. }
            | BackendError::NoSuchSession { .. }
            | BackendError::Rejected { .. } => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            BackendError::NotFound { .. } => true,
            BackendError::Io { source, .. } => source.kind() == ErrorKind::NotFound,
            BackendError::OpenDal { error, .. } => error.kind() == opendal::ErrorKind::NotFound,
            _ => false,
        }
    }

    fn io_kind(&self) -> ErrorKind {
        if self.is_not_found() {
            return ErrorKind::NotFound;
        }
        match self {
            BackendError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            BackendError::InvalidRange { .. } => ErrorKind::InvalidInput,
            BackendError::Io { source, .. } => source.kind(),
            BackendError::OpenDal { error, .. }
                if error.kind() == opendal::ErrorKind::PermissionDenied =>
            {
                ErrorKind::PermissionDenied
            }
            _ => ErrorKind::Other,
        }
    }
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

#[derive(Snafu, Debug)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("fetch of {key} at offset {offset} still failing after {attempts} attempts"))]
    TransientFetch {
        key: String,
        offset: u64,
        attempts: usize,
        source: BackendError,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("fetch of {key} at offset {offset} failed"))]
    PermanentFetch {
        key: String,
        offset: u64,
        source: BackendError,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("{op} of {key} still failing after {attempts} attempts"))]
    TransientUpload {
        key: String,
        op: &'static str,
        attempts: usize,
        source: BackendError,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("{op} of {key} failed"))]
    PermanentUpload {
        key: String,
        op: &'static str,
        source: BackendError,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("part {part_number} of {key} could not be stored, the transfer was aborted"))]
    PartUpload {
        key: String,
        part_number: PartNumber,
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("I/O operation on closed stream"))]
    ClosedStream {
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("stream is unusable after an earlier failure: {reason}"))]
    StreamFailed {
        reason: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("transfer of {key} was aborted"))]
    TransferAborted {
        key: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("transfer of {key} was already finalized"))]
    TransferFinalized {
        key: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("cannot assemble {key}: {reason}"))]
    PartialObject {
        key: String,
        reason: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("transfer of {key} needs more than {limit} parts"))]
    PartLimitExceeded {
        key: String,
        limit: usize,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("cannot seek to negative position {target}"))]
    InvalidSeek {
        target: i128,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("invalid stream config: {reason}"))]
    InvalidConfig {
        reason: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("failed to parse stream config"))]
    ParseConfig {
        source: toml::de::Error,
        #[snafu(implicit)]
        location: Location,
    },

    UnknownIO {
        source: std::io::Error,
        #[snafu(implicit)]
        location: Location,
    },
}

impl Error {
    /// True for errors that exhausted a retry budget on a transient failure.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::TransientFetch { .. } | Error::TransientUpload { .. } => true,
            Error::PartUpload { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::TransientFetch { source, .. }
            | Error::PermanentFetch { source, .. }
            | Error::TransientUpload { source, .. }
            | Error::PermanentUpload { source, .. } => source.is_not_found(),
            Error::PartUpload { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    fn io_kind(&self) -> ErrorKind {
        match self {
            Error::TransientFetch { source, .. }
            | Error::PermanentFetch { source, .. }
            | Error::TransientUpload { source, .. }
            | Error::PermanentUpload { source, .. } => source.io_kind(),
            Error::PartUpload { source, .. } => source.io_kind(),
            Error::InvalidSeek { .. } | Error::InvalidConfig { .. } => ErrorKind::InvalidInput,
            Error::UnknownIO { source, .. } => source.kind(),
            _ => ErrorKind::Other,
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::UnknownIO { source, .. } => source,
            other => std::io::Error::new(other.io_kind(), other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
