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

use std::{fs::File, io::Write};

use raft_engine_common::PeerId;

use crate::{fs::StorageDirectory, Error, Result};

/// The durable `(current_term, voted_for)` pair of one raft peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    pub term: u64,
    pub voted_for: Option<PeerId>,
}

/// Reads and rewrites the `raft-meta` file. Updates go through a
/// temporary file plus rename, so a crash leaves either the old or the
/// new content, never a mix.
pub(crate) struct MetaFile {
    dir: StorageDirectory,
}

impl MetaFile {
    pub fn new(dir: StorageDirectory) -> Self {
        MetaFile { dir }
    }

    pub fn load(&self) -> Result<Metadata> {
        let path = self.dir.meta_path();
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Metadata::default());
            }
            Err(err) => return Err(err.into()),
        };

        let mut meta = Metadata::default();
        for line in content.lines() {
            if let Some(term) = line.strip_prefix("term=") {
                meta.term = term
                    .trim()
                    .parse()
                    .map_err(|_| Error::Corruption(format!("bad term in {:?}", path)))?;
            } else if let Some(voted_for) = line.strip_prefix("votedFor=") {
                let voted_for = voted_for.trim();
                if !voted_for.is_empty() {
                    meta.voted_for = Some(PeerId::new(voted_for));
                }
            }
        }
        Ok(meta)
    }

    pub fn set(&self, term: u64, voted_for: Option<&PeerId>) -> Result<()> {
        let content = format!(
            "term={}\nvotedFor={}\n",
            term,
            voted_for.map(|p| p.as_str()).unwrap_or("")
        );

        let tmp = self.dir.meta_tmp_path();
        let mut file = File::create(&tmp)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&tmp, self.dir.meta_path())?;
        self.dir.sync()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_set_and_load() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = StorageDirectory::open(dir.path())?;
        let meta = MetaFile::new(storage.clone());

        // Missing file yields defaults.
        assert_eq!(meta.load()?, Metadata::default());

        let voted = PeerId::new("s2");
        meta.set(7, Some(&voted))?;
        assert_eq!(
            meta.load()?,
            Metadata {
                term: 7,
                voted_for: Some(voted)
            }
        );

        // Overwrite clears the vote.
        meta.set(8, None)?;
        let loaded = meta.load()?;
        assert_eq!(loaded.term, 8);
        assert_eq!(loaded.voted_for, None);

        // No temporary file is left behind.
        assert!(!storage.meta_tmp_path().exists());
        Ok(())
    }
}
