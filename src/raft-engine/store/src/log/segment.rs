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

use std::path::Path;

use prost::Message;
use raft_engine_common::{LogEntry, TermIndex};

use super::format::{self, RecordScanner, CHECKSUM_SIZE, SEGMENT_HEADER_SIZE};
use crate::{Error, Result};

/// Index metadata of one entry: where its payload lives in the segment
/// file. Retained even when the entry body is evicted from memory.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LogRecord {
    pub term_index: TermIndex,
    pub offset: u64,
    pub len: u32,
}

/// One contiguous run of entries backed by a single segment file.
///
/// An open segment keeps its entry bodies in memory; a closed segment
/// may keep only records, in which case bodies are reloaded from disk
/// on demand.
pub(crate) struct LogSegment {
    start_index: u64,
    is_open: bool,
    total_size: u64,
    records: Vec<LogRecord>,
    entries: Option<Vec<LogEntry>>,
}

impl LogSegment {
    pub fn create_open(start_index: u64) -> Self {
        LogSegment {
            start_index,
            is_open: true,
            total_size: SEGMENT_HEADER_SIZE as u64,
            records: Vec::new(),
            entries: Some(Vec::new()),
        }
    }

    /// Parses the segment file, invoking `consumer` for each valid
    /// entry in order.
    ///
    /// For an open segment the scan may stop early at a malformed
    /// record: the records before it are the recovered suffix and
    /// `total_size` tells where the valid bytes end. A closed segment
    /// must parse completely and match its file name exactly.
    pub fn load_segment(
        path: &Path,
        start_index: u64,
        end_index: Option<u64>,
        keep_entries: bool,
        consumer: &mut dyn FnMut(&LogEntry),
    ) -> Result<LogSegment> {
        let buf = std::fs::read(path)?;
        let mut scanner = RecordScanner::new(&buf)
            .map_err(|_| Error::Corruption(format!("bad segment header in {:?}", path)))?;

        let mut records = Vec::new();
        let mut entries = keep_entries.then(Vec::new);
        while let Some((entry, offset, len)) = scanner.next_record() {
            let expected = start_index + records.len() as u64;
            if entry.index != expected {
                return Err(Error::Corruption(format!(
                    "entry index {} found where {} was expected in {:?}",
                    entry.index, expected, path
                )));
            }
            records.push(LogRecord {
                term_index: entry.term_index(),
                offset,
                len,
            });
            consumer(&entry);
            if let Some(entries) = &mut entries {
                entries.push(entry);
            }
        }

        match end_index {
            Some(end_index) => {
                let expected = end_index - start_index + 1;
                if scanner.hit_corruption() || records.len() as u64 != expected {
                    return Err(Error::Corruption(format!(
                        "closed segment {:?} holds {} entries, name promises {}",
                        path,
                        records.len(),
                        expected
                    )));
                }
            }
            None => {
                if scanner.hit_corruption() {
                    tracing::warn!(
                        "open segment {:?} has a malformed tail, recovered {} entries",
                        path,
                        records.len()
                    );
                }
            }
        }

        Ok(LogSegment {
            start_index,
            is_open: end_index.is_none(),
            total_size: scanner.valid_offset() as u64,
            records,
            entries,
        })
    }

    #[inline(always)]
    pub fn start_index(&self) -> u64 {
        self.start_index
    }

    /// REQUIRES: the segment is non empty.
    #[inline(always)]
    pub fn end_index(&self) -> u64 {
        debug_assert!(!self.is_empty());
        self.start_index + self.records.len() as u64 - 1
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[inline(always)]
    pub fn num_entries(&self) -> usize {
        self.records.len()
    }

    #[inline(always)]
    pub fn is_open(&self) -> bool {
        self.is_open
    }

    #[inline(always)]
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    #[inline(always)]
    pub fn has_entries(&self) -> bool {
        self.entries.is_some()
    }

    pub fn last_term_index(&self) -> Option<TermIndex> {
        self.records.last().map(|r| r.term_index)
    }

    pub fn record(&self, index: u64) -> Option<&LogRecord> {
        let pos = index.checked_sub(self.start_index)?;
        self.records.get(pos as usize)
    }

    pub fn entry(&self, index: u64) -> Option<&LogEntry> {
        let entries = self.entries.as_ref()?;
        let pos = index.checked_sub(self.start_index)?;
        entries.get(pos as usize)
    }

    pub fn append_entry(&mut self, entry: &LogEntry) {
        debug_assert!(self.is_open);
        debug_assert!(
            self.is_empty() || entry.index == self.end_index() + 1,
            "entry {} does not continue segment ending at {}",
            entry.index,
            self.start_index + self.records.len() as u64 - 1,
        );

        let payload_len = entry.encoded_len();
        let delimiter_len = prost::length_delimiter_len(payload_len);
        self.records.push(LogRecord {
            term_index: entry.term_index(),
            offset: self.total_size + delimiter_len as u64,
            len: payload_len as u32,
        });
        self.total_size += (delimiter_len + payload_len + CHECKSUM_SIZE) as u64;
        if let Some(entries) = &mut self.entries {
            entries.push(entry.clone());
        }
    }

    /// Marks the open segment closed. The segment must be non empty:
    /// every closed segment contains at least one entry.
    pub fn roll(&mut self) {
        assert!(self.is_open && !self.is_empty());
        self.is_open = false;
    }

    /// Removes every entry with `index' >= index` and returns the new
    /// file size in bytes. Whole segment removal is the caller's job:
    /// `index` must be inside `(start_index, end_index]`.
    pub fn truncate(&mut self, index: u64) -> u64 {
        assert!(self.start_index < index && index <= self.end_index());
        let keep = (index - self.start_index) as usize;
        self.records.truncate(keep);
        if let Some(entries) = &mut self.entries {
            entries.truncate(keep);
        }
        let last = &self.records[keep - 1];
        self.total_size = last.offset + last.len as u64 + CHECKSUM_SIZE as u64;
        self.is_open = false;
        self.total_size
    }

    /// Drops the in memory entry bodies, keeping records only.
    pub fn evict_entries(&mut self) {
        debug_assert!(!self.is_open);
        self.entries = None;
    }

    pub fn install_entries(&mut self, entries: Vec<LogEntry>) {
        debug_assert_eq!(entries.len(), self.records.len());
        self.entries = Some(entries);
    }

    pub fn take_entries(self) -> Option<Vec<LogEntry>> {
        self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::format::SEGMENT_HEADER;

    fn write_segment(path: &Path, entries: &[LogEntry]) {
        let mut buf = SEGMENT_HEADER.to_vec();
        for entry in entries {
            format::encode_record(entry, &mut buf);
        }
        std::fs::write(path, buf).unwrap();
    }

    fn entries(term: u64, range: std::ops::Range<u64>) -> Vec<LogEntry> {
        range
            .map(|i| LogEntry::new(term, i, format!("payload-{}", i).into_bytes()))
            .collect()
    }

    #[test]
    fn load_closed_segment_with_and_without_entries() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("log_0-9");
        let expect = entries(1, 0..10);
        write_segment(&path, &expect);

        let mut replayed = Vec::new();
        let segment = LogSegment::load_segment(&path, 0, Some(9), true, &mut |e| {
            replayed.push(e.index)
        })?;
        assert_eq!(replayed, (0..10).collect::<Vec<_>>());
        assert_eq!(segment.num_entries(), 10);
        assert_eq!(segment.entry(3), Some(&expect[3]));
        assert!(!segment.is_open());

        let thin = LogSegment::load_segment(&path, 0, Some(9), false, &mut |_| {})?;
        assert!(!thin.has_entries());
        assert_eq!(thin.record(3).unwrap().term_index, TermIndex::new(1, 3));
        assert_eq!(thin.total_size(), segment.total_size());
        Ok(())
    }

    #[test]
    fn load_open_segment_recovers_valid_prefix() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("log_inprogress_0");
        write_segment(&path, &entries(1, 0..5));

        // Chop bytes off the last record to simulate a crash mid write.
        let len = std::fs::metadata(&path)?.len();
        let file = std::fs::OpenOptions::new().write(true).open(&path)?;
        file.set_len(len - 3)?;

        let segment = LogSegment::load_segment(&path, 0, None, true, &mut |_| {})?;
        assert_eq!(segment.num_entries(), 4);
        assert_eq!(segment.end_index(), 3);
        assert!(segment.total_size() < len - 3);
        Ok(())
    }

    #[test]
    fn load_closed_segment_rejects_short_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("log_0-9");
        write_segment(&path, &entries(1, 0..7));

        let result = LogSegment::load_segment(&path, 0, Some(9), false, &mut |_| {});
        assert!(matches!(result, Err(Error::Corruption(_))));
        Ok(())
    }

    #[test]
    fn append_truncate_tracks_file_size() {
        let mut segment = LogSegment::create_open(5);
        let mut on_disk = SEGMENT_HEADER.to_vec();
        for entry in entries(2, 5..10) {
            segment.append_entry(&entry);
            format::encode_record(&entry, &mut on_disk);
            assert_eq!(segment.total_size(), on_disk.len() as u64);
        }

        let keep = entries(2, 5..7);
        let mut expect = SEGMENT_HEADER.to_vec();
        for entry in &keep {
            format::encode_record(entry, &mut expect);
        }
        let new_size = segment.truncate(7);
        assert_eq!(new_size, expect.len() as u64);
        assert_eq!(segment.end_index(), 6);
        assert!(!segment.is_open());
        assert_eq!(segment.entry(7), None);
    }
}
