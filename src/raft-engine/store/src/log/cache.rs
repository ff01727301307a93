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

use raft_engine_common::{LogEntry, TermIndex};

use super::segment::LogSegment;
use crate::{Error, Result};

/// Names one segment file: `end_index` is `None` for the open segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SegmentSpan {
    pub start_index: u64,
    pub end_index: Option<u64>,
}

/// The partially truncated segment: which file to cut, where, and what
/// closed name it gets afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TruncateSpan {
    pub file: SegmentSpan,
    pub new_end_index: u64,
    pub file_size: u64,
}

/// The io worker's description of one truncation: at most one file to
/// cut plus whole files to delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TruncationSegments {
    pub to_truncate: Option<TruncateSpan>,
    pub to_delete: Vec<SegmentSpan>,
}

impl TruncationSegments {
    /// The end index of the log once this truncation is durable.
    pub fn end_index(&self) -> Option<u64> {
        match &self.to_truncate {
            Some(span) => Some(span.new_end_index),
            None => self
                .to_delete
                .iter()
                .map(|s| s.start_index)
                .min()
                .and_then(|start| start.checked_sub(1)),
        }
    }
}

/// The ordered collection of segments: all closed segments plus at
/// most one open segment. Between adjacent segments there is no gap:
/// `segments[i].end_index + 1 == segments[i + 1].start_index`.
pub(crate) struct SegmentCache {
    closed: Vec<LogSegment>,
    open: Option<LogSegment>,
    max_cached_segments: usize,
}

impl SegmentCache {
    pub fn new(max_cached_segments: usize) -> Self {
        SegmentCache {
            closed: Vec::new(),
            open: None,
            max_cached_segments,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.closed.is_empty() && self.open.as_ref().map(|s| s.is_empty()).unwrap_or(true)
    }

    pub fn start_index(&self) -> Option<u64> {
        if let Some(first) = self.closed.first() {
            return Some(first.start_index());
        }
        self.open
            .as_ref()
            .filter(|s| !s.is_empty())
            .map(|s| s.start_index())
    }

    pub fn end_index(&self) -> Option<u64> {
        if let Some(open) = &self.open {
            if !open.is_empty() {
                return Some(open.end_index());
            }
        }
        self.closed.last().map(|s| s.end_index())
    }

    pub fn has_open_segment(&self) -> bool {
        self.open.is_some()
    }

    pub fn open_segment(&self) -> Option<&LogSegment> {
        self.open.as_ref()
    }

    /// Installs a segment loaded from disk. Segments arrive in file
    /// order; a gap or an out of order file is corruption.
    pub fn install_segment(&mut self, segment: LogSegment) -> Result<()> {
        if let Some(end) = self.end_index() {
            if segment.start_index() != end + 1 {
                return Err(Error::Corruption(format!(
                    "segment starting at {} leaves a gap after {}",
                    segment.start_index(),
                    end
                )));
            }
        }
        if self.open.is_some() {
            return Err(Error::Corruption(
                "segment file found after the in progress segment".to_string(),
            ));
        }
        if segment.is_open() {
            self.open = Some(segment);
        } else {
            self.closed.push(segment);
        }
        Ok(())
    }

    pub fn add_open_segment(&mut self, start_index: u64) {
        debug_assert!(self.open.is_none());
        self.open = Some(LogSegment::create_open(start_index));
    }

    /// Marks the open segment closed and moves it among the closed
    /// segments.
    pub fn roll_open_segment(&mut self) {
        let mut segment = self.open.take().expect("no open segment to roll");
        segment.roll();
        self.closed.push(segment);
    }

    pub fn append_entry(&mut self, entry: &LogEntry) {
        let open = self.open.as_mut().expect("no open segment to append to");
        open.append_entry(entry);
    }

    pub fn get_segment(&self, index: u64) -> Option<&LogSegment> {
        if let Some(open) = &self.open {
            if !open.is_empty() && index >= open.start_index() {
                return (index <= open.end_index()).then_some(open);
            }
        }
        let pos = self
            .closed
            .partition_point(|s| s.start_index() <= index)
            .checked_sub(1)?;
        let segment = &self.closed[pos];
        (index <= segment.end_index()).then_some(segment)
    }

    pub fn get_segment_mut(&mut self, index: u64) -> Option<&mut LogSegment> {
        if let Some(open) = &self.open {
            if !open.is_empty() && index >= open.start_index() {
                if index > open.end_index() {
                    return None;
                }
                return self.open.as_mut();
            }
        }
        let pos = self
            .closed
            .partition_point(|s| s.start_index() <= index)
            .checked_sub(1)?;
        let segment = &mut self.closed[pos];
        (index <= segment.end_index()).then_some(segment)
    }

    pub fn get_term_index(&self, index: u64) -> Option<TermIndex> {
        self.get_segment(index)
            .and_then(|s| s.record(index))
            .map(|r| r.term_index)
    }

    /// Term indices of `[lo, hi]` clamped to the range the cache
    /// holds.
    pub fn term_indices(&self, lo: u64, hi: u64) -> Vec<TermIndex> {
        let (start, end) = match (self.start_index(), self.end_index()) {
            (Some(start), Some(end)) => (start.max(lo), end.min(hi)),
            _ => return Vec::new(),
        };
        if start > end {
            return Vec::new();
        }
        (start..=end)
            .map(|i| {
                self.get_term_index(i)
                    .expect("no gaps between cache segments")
            })
            .collect()
    }

    pub fn last_term_index(&self) -> Option<TermIndex> {
        if let Some(open) = &self.open {
            if let Some(ti) = open.last_term_index() {
                return Some(ti);
            }
        }
        self.closed.last().and_then(|s| s.last_term_index())
    }

    /// Removes every entry with `index' >= index`. Returns what the io
    /// worker must do on disk, or `None` when there is nothing at or
    /// beyond `index`.
    pub fn truncate(&mut self, index: u64) -> Option<TruncationSegments> {
        let end = self.end_index()?;
        if index > end {
            return None;
        }

        let mut to_delete = Vec::new();
        if let Some(open) = self.open.take() {
            if !open.is_empty() && index <= open.start_index() {
                to_delete.push(SegmentSpan {
                    start_index: open.start_index(),
                    end_index: None,
                });
            } else if !open.is_empty() {
                // Truncation point is inside the open segment: cut it
                // and let the worker rename it to a closed segment.
                let mut open = open;
                let file_size = open.truncate(index);
                let span = TruncateSpan {
                    file: SegmentSpan {
                        start_index: open.start_index(),
                        end_index: None,
                    },
                    new_end_index: open.end_index(),
                    file_size,
                };
                self.closed.push(open);
                return Some(TruncationSegments {
                    to_truncate: Some(span),
                    to_delete,
                });
            }
        }

        while let Some(last) = self.closed.last_mut() {
            if index <= last.start_index() {
                let span = SegmentSpan {
                    start_index: last.start_index(),
                    end_index: Some(last.end_index()),
                };
                to_delete.push(span);
                self.closed.pop();
            } else if index <= last.end_index() {
                let start_index = last.start_index();
                let old_end = last.end_index();
                let file_size = last.truncate(index);
                let new_end_index = last.end_index();
                return Some(TruncationSegments {
                    to_truncate: Some(TruncateSpan {
                        file: SegmentSpan {
                            start_index,
                            end_index: Some(old_end),
                        },
                        new_end_index,
                        file_size,
                    }),
                    to_delete,
                });
            } else {
                break;
            }
        }

        Some(TruncationSegments {
            to_truncate: None,
            to_delete,
        })
    }

    /// Whether more closed segments hold entry bodies than the cache
    /// budget allows.
    pub fn should_evict(&self) -> bool {
        self.num_cached_segments() > self.max_cached_segments
    }

    /// Drops entry bodies of closed segments no reader can need again:
    /// those entirely below every follower's next index, the flushed
    /// index, and the applied index.
    ///
    /// Returns the number of evicted segments; zero with an over
    /// budget cache means every cached segment is still reachable.
    pub fn evict_cache(
        &mut self,
        follower_next_indices: &[u64],
        flushed_index: u64,
        last_applied_index: u64,
    ) -> usize {
        let mut safe = flushed_index.min(last_applied_index);
        if let Some(min_next) = follower_next_indices.iter().min() {
            safe = safe.min(*min_next);
        }

        let mut evicted = 0;
        for segment in &mut self.closed {
            if segment.has_entries() && segment.end_index() < safe {
                segment.evict_entries();
                evicted += 1;
            }
        }
        evicted
    }

    pub fn num_cached_segments(&self) -> usize {
        self.closed.iter().filter(|s| s.has_entries()).count()
    }

    pub fn closed_segments_below(&self, index: u64) -> Vec<SegmentSpan> {
        self.closed
            .iter()
            .filter(|s| s.end_index() < index)
            .map(|s| SegmentSpan {
                start_index: s.start_index(),
                end_index: Some(s.end_index()),
            })
            .collect()
    }

    pub fn remove_closed_segments_below(&mut self, index: u64) {
        self.closed.retain(|s| s.end_index() >= index);
    }

    pub fn clear(&mut self) {
        self.closed.clear();
        self.open = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(term: u64, index: u64) -> LogEntry {
        LogEntry::new(term, index, format!("e{}", index).into_bytes())
    }

    fn build_cache(runs: &[(u64, std::ops::Range<u64>)], open: Option<(u64, u64)>) -> SegmentCache {
        let mut cache = SegmentCache::new(2);
        for (term, range) in runs {
            cache.add_open_segment(range.start);
            for i in range.clone() {
                cache.append_entry(&entry(*term, i));
            }
            cache.roll_open_segment();
        }
        if let Some((term, start)) = open {
            cache.add_open_segment(start);
            cache.append_entry(&entry(term, start));
        }
        cache
    }

    #[test]
    fn lookup_has_no_gaps() {
        let cache = build_cache(&[(1, 0..5), (1, 5..12), (2, 12..20)], Some((2, 20)));
        assert_eq!(cache.start_index(), Some(0));
        assert_eq!(cache.end_index(), Some(20));
        for i in 0..=20 {
            let segment = cache.get_segment(i).unwrap();
            assert!(segment.start_index() <= i && i <= segment.end_index());
            assert_eq!(cache.get_term_index(i).unwrap().index, i);
        }
        assert!(cache.get_segment(21).is_none());
    }

    #[test]
    fn term_indices_clamp_to_held_range() {
        let cache = build_cache(&[(1, 3..8)], None);
        let tis = cache.term_indices(0, 100);
        assert_eq!(tis.first().unwrap().index, 3);
        assert_eq!(tis.last().unwrap().index, 7);
        assert!(cache.term_indices(8, 9).is_empty());
    }

    #[test]
    fn truncate_inside_closed_segment() {
        let mut cache = build_cache(&[(1, 0..5), (1, 5..10)], Some((2, 10)));
        let ts = cache.truncate(7).unwrap();

        // The open segment is deleted whole, log_5-9 is cut back.
        assert_eq!(
            ts.to_delete,
            vec![SegmentSpan {
                start_index: 10,
                end_index: None
            }]
        );
        let span = ts.to_truncate.unwrap();
        assert_eq!(span.file.start_index, 5);
        assert_eq!(span.file.end_index, Some(9));
        assert_eq!(span.new_end_index, 6);
        assert_eq!(ts.end_index(), Some(6));

        assert_eq!(cache.end_index(), Some(6));
        assert!(!cache.has_open_segment());
        assert!(cache.get_segment(7).is_none());
    }

    #[test]
    fn truncate_inside_open_segment() {
        let mut cache = build_cache(&[(1, 0..5)], Some((2, 5)));
        cache.append_entry(&entry(2, 6));
        cache.append_entry(&entry(2, 7));

        let ts = cache.truncate(6).unwrap();
        assert!(ts.to_delete.is_empty());
        let span = ts.to_truncate.unwrap();
        assert_eq!(span.file.end_index, None);
        assert_eq!(span.new_end_index, 5);

        // The cut open segment became a closed one.
        assert!(!cache.has_open_segment());
        assert_eq!(cache.end_index(), Some(5));
    }

    #[test]
    fn truncate_everything() {
        let mut cache = build_cache(&[(1, 0..5)], Some((1, 5)));
        let ts = cache.truncate(0).unwrap();
        assert!(ts.to_truncate.is_none());
        assert_eq!(ts.to_delete.len(), 2);
        assert_eq!(ts.end_index(), None);
        assert!(cache.is_empty());

        assert!(cache.truncate(3).is_none());
    }

    #[test]
    fn evict_respects_reachability_floor() {
        let mut cache = build_cache(&[(1, 0..5), (1, 5..10), (1, 10..15)], None);
        assert!(cache.should_evict());

        // A slow follower still needs index 5.
        assert_eq!(cache.evict_cache(&[5, 14], 14, 14), 1);
        assert_eq!(cache.num_cached_segments(), 2);
        assert!(cache.get_segment(2).map(|s| !s.has_entries()).unwrap());

        // Once everyone advanced, the rest becomes evictable.
        assert_eq!(cache.evict_cache(&[15, 15], 15, 15), 2);
        assert_eq!(cache.num_cached_segments(), 0);
    }

    #[test]
    fn eviction_floor_includes_flushed_and_applied() {
        let mut cache = build_cache(&[(1, 0..5), (1, 5..10)], None);
        // Durability pipeline is behind: nothing may be dropped.
        assert_eq!(cache.evict_cache(&[10], 3, 10), 0);
        // State machine is behind: same.
        assert_eq!(cache.evict_cache(&[10], 10, 3), 0);
        assert_eq!(cache.evict_cache(&[10], 10, 10), 2);
    }
}
