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

use std::path::{Path, PathBuf};

pub const CURRENT_DIR: &str = "current";
pub const META_FILE: &str = "raft-meta";
pub const META_TMP_FILE: &str = "raft-meta.tmp";

const CLOSED_SEGMENT_PREFIX: &str = "log_";
const OPEN_SEGMENT_PREFIX: &str = "log_inprogress_";

pub enum FileType {
    ClosedSegment { start: u64, end: u64 },
    OpenSegment { start: u64 },
    Metadata,
    Temp,
    Snapshot,
    Unknown,
}

pub fn closed_segment<P: AsRef<Path>>(dir: P, start: u64, end: u64) -> PathBuf {
    dir.as_ref()
        .join(format!("{}{}-{}", CLOSED_SEGMENT_PREFIX, start, end))
}

pub fn open_segment<P: AsRef<Path>>(dir: P, start: u64) -> PathBuf {
    dir.as_ref().join(format!("{}{}", OPEN_SEGMENT_PREFIX, start))
}

pub fn parse_file_name(name: &str) -> FileType {
    if name == META_FILE {
        return FileType::Metadata;
    }
    if name.ends_with(".tmp") {
        return FileType::Temp;
    }
    if name.starts_with("snapshot") {
        return FileType::Snapshot;
    }
    if let Some(rest) = name.strip_prefix(OPEN_SEGMENT_PREFIX) {
        return match rest.parse::<u64>() {
            Ok(start) => FileType::OpenSegment { start },
            Err(_) => FileType::Unknown,
        };
    }
    if let Some(rest) = name.strip_prefix(CLOSED_SEGMENT_PREFIX) {
        if let Some((start, end)) = rest.split_once('-') {
            if let (Ok(start), Ok(end)) = (start.parse::<u64>(), end.parse::<u64>()) {
                return FileType::ClosedSegment { start, end };
            }
        }
        return FileType::Unknown;
    }
    FileType::Unknown
}
