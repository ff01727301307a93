// Copyright 2022 The Engula Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::time::Duration;

pub const SEGMENT_SIZE_MAX: usize = 8 * 1024 * 1024;
pub const CACHE_MAX_SEGMENTS: usize = 6;
pub const FLUSH_FORCE_SYNC_NUM: usize = 128;
pub const FLUSH_SYNC_INTERVAL: Duration = Duration::from_millis(10);

/// When the io worker forces an fsync of batched writes.
#[derive(Debug, Clone)]
pub struct FlushPolicy {
    /// Sync once this many entries are written but not yet durable.
    ///
    /// DEFAULT: [`FLUSH_FORCE_SYNC_NUM`].
    pub force_sync_num: usize,

    /// Sync when this much time passed since the oldest unsynced
    /// write, even if the entry threshold was not reached.
    ///
    /// DEFAULT: [`FLUSH_SYNC_INTERVAL`].
    pub sync_interval: Duration,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        FlushPolicy {
            force_sync_num: FLUSH_FORCE_SYNC_NUM,
            sync_interval: FLUSH_SYNC_INTERVAL,
        }
    }
}

/// The option structure of the segmented log.
#[derive(Debug, Clone)]
pub struct LogOption {
    /// The maximum number of bytes per segment file.
    ///
    /// DEFAULT: [`SEGMENT_SIZE_MAX`].
    pub segment_size_max: usize,

    /// The maximum number of closed segments keeping their full entry
    /// bodies in memory. Segments beyond this keep index metadata
    /// only.
    ///
    /// DEFAULT: [`CACHE_MAX_SEGMENTS`].
    pub cache_max_segments: usize,

    pub flush: FlushPolicy,
}

impl Default for LogOption {
    fn default() -> Self {
        LogOption {
            segment_size_max: SEGMENT_SIZE_MAX,
            cache_max_segments: CACHE_MAX_SEGMENTS,
            flush: FlushPolicy::default(),
        }
    }
}
