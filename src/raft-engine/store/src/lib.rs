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

//! The on disk replicated log, managed as a sequence of segment files.
//!
//! The maximum segment size is 8 MiB by default. The real segment size
//! may not be exactly equal to this limit: if one entry's size exceeds
//! it, that entry is stored alone in a single segment.
//!
//! There are two kinds of segments: closed segments, named
//! `log_<start>-<end>`, and the at most one open segment, named
//! `log_inprogress_<start>`. When the open segment reaches the size
//! limit, or the log term increases, it is closed and a new open
//! segment is started. A closed segment is immutable except for
//! truncation when a follower's log diverges from the leader's.
//!
//! Closed segments are non empty and there are no gaps between
//! adjacent segments.

mod error;
mod fs;
mod log;
mod metadata;
mod opt;

pub use self::{
    error::{Error, Result},
    log::{LogFuture, SegmentedLog, ServerContext},
    metadata::Metadata,
    opt::{FlushPolicy, LogOption},
};

/// The result kind completed by the io worker. `std::io::Error` is not
/// `Clone`, so batched futures share the error kind only.
pub(crate) type IoKindResult<T> = std::result::Result<T, std::io::ErrorKind>;
