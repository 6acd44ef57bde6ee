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

// The prefetch window of a reader.
pub const DEFAULT_BUFFER_SIZE: usize = 128 << 10; // 128 KiB

// The part threshold of a writer.
pub const DEFAULT_PART_SIZE: usize = 50 << 20; // 50 MiB

// Most object stores refuse non-final parts below this size.
pub const MIN_PART_SIZE: usize = 5 << 20; // 5 MiB

pub const MAX_PART_COUNT: usize = 10_000;

pub const DEFAULT_MAX_ATTEMPTS: usize = 3;
pub const DEFAULT_RETRY_INITIAL_DELAY_MS: u64 = 100;
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 10_000;

pub const BINARY_NEWLINE: &[u8] = b"\n";

// Staged parts are kept under this prefix until the session completes.
pub const MULTIPART_STAGING_PREFIX: &str = ".kiseki-multipart";

/// The 1-based ordinal of a part inside one transfer session.
pub type PartNumber = usize;
pub type ObjectOffset = u64;
pub type ObjectSize = u64;
