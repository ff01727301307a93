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

mod ext;
pub mod layout;

use std::{
    fs::File,
    path::{Path, PathBuf},
};

pub use self::ext::FileExt;
use crate::Result;

/// One segment file on disk. `end_index` is `None` for the open
/// segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentFile {
    pub path: PathBuf,
    pub start_index: u64,
    pub end_index: Option<u64>,
}

/// The storage directory of one raft log: enumerates and names the
/// files under `<root>/current/`.
#[derive(Debug, Clone)]
pub struct StorageDirectory {
    current: PathBuf,
}

impl StorageDirectory {
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let current = root.as_ref().join(layout::CURRENT_DIR);
        std::fs::create_dir_all(&current)?;
        Ok(StorageDirectory { current })
    }

    #[inline(always)]
    pub fn current_dir(&self) -> &Path {
        &self.current
    }

    pub fn meta_path(&self) -> PathBuf {
        self.current.join(layout::META_FILE)
    }

    pub fn meta_tmp_path(&self) -> PathBuf {
        self.current.join(layout::META_TMP_FILE)
    }

    pub fn closed_segment_path(&self, start: u64, end: u64) -> PathBuf {
        layout::closed_segment(&self.current, start, end)
    }

    pub fn open_segment_path(&self, start: u64) -> PathBuf {
        layout::open_segment(&self.current, start)
    }

    /// Enumerate segment files sorted by start index. Unknown file
    /// names are ignored; an empty in progress file left by a crash
    /// right after creation is removed.
    pub fn segment_files(&self) -> Result<Vec<SegmentFile>> {
        let mut segments = Vec::new();
        for dirent in std::fs::read_dir(&self.current)? {
            let path = dirent?.path();
            if !path.is_file() {
                continue;
            }
            let name = match path.file_name().and_then(|s| s.to_str()) {
                Some(name) => name,
                None => continue,
            };
            match layout::parse_file_name(name) {
                layout::FileType::ClosedSegment { start, end } => segments.push(SegmentFile {
                    path,
                    start_index: start,
                    end_index: Some(end),
                }),
                layout::FileType::OpenSegment { start } => {
                    if path.metadata()?.len() == 0 {
                        tracing::warn!("remove empty in progress segment {:?}", path);
                        std::fs::remove_file(&path)?;
                        continue;
                    }
                    segments.push(SegmentFile {
                        path,
                        start_index: start,
                        end_index: None,
                    });
                }
                _ => {}
            }
        }
        segments.sort_by_key(|s| s.start_index);
        Ok(segments)
    }

    /// See `man 2 fsync`:
    ///
    /// Calling fsync() does not necessarily ensure that the entry in
    /// the directory containing the file has also reached disk. For
    /// that an explicit fsync() on a file descriptor for the directory
    /// is also needed.
    pub fn sync(&self) -> Result<()> {
        File::open(&self.current)?.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enumerate_sorted_and_skip_unknown() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = StorageDirectory::open(dir.path())?;
        let current = storage.current_dir().to_owned();

        std::fs::write(current.join("log_10-19"), b"x")?;
        std::fs::write(current.join("log_0-9"), b"x")?;
        std::fs::write(current.join("log_inprogress_20"), b"x")?;
        std::fs::write(current.join("raft-meta"), b"x")?;
        std::fs::write(current.join("garbage"), b"x")?;

        let files = storage.segment_files()?;
        assert_eq!(files.len(), 3);
        assert_eq!(files[0].start_index, 0);
        assert_eq!(files[1].start_index, 10);
        assert_eq!(files[2].start_index, 20);
        assert_eq!(files[2].end_index, None);
        Ok(())
    }

    #[test]
    fn remove_empty_in_progress_segment() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = StorageDirectory::open(dir.path())?;
        let empty = storage.open_segment_path(5);
        std::fs::write(&empty, b"")?;

        let files = storage.segment_files()?;
        assert!(files.is_empty());
        assert!(!empty.exists());
        Ok(())
    }
}
