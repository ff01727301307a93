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

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
    task::{Context, Poll},
};

use futures::channel::oneshot;
use raft_engine_common::{LogEntry, PeerId, TermIndex};

use super::{
    cache::SegmentCache,
    segment::LogSegment,
    worker::{LogWorker, OpenSegmentState},
};
use crate::{
    fs::StorageDirectory,
    metadata::{MetaFile, Metadata},
    Error, IoKindResult, LogOption, Result,
};

/// What the surrounding raft server exposes to the log: replication
/// progress for cache eviction, and a hook to fail client requests
/// attached to truncated entries.
pub trait ServerContext: Send + Sync {
    /// The next index each follower will be sent.
    fn follower_next_indices(&self) -> Vec<u64>;

    /// The highest index the state machine has applied.
    fn last_applied_index(&self) -> u64;

    /// The entry was truncated away and will never commit; any client
    /// request waiting on it must be failed.
    fn fail_client_request(&self, entry: &LogEntry);
}

/// A future tied to log durability. Completes with the task's end
/// index once the io worker made it durable; completes in index order
/// relative to every other log future.
pub struct LogFuture {
    inner: LogFutureInner,
}

enum LogFutureInner {
    Ready(Option<Result<u64>>),
    Pending(oneshot::Receiver<IoKindResult<u64>>),
}

impl LogFuture {
    pub(crate) fn ready(value: u64) -> Self {
        LogFuture {
            inner: LogFutureInner::Ready(Some(Ok(value))),
        }
    }

    pub(crate) fn pending(receiver: oneshot::Receiver<IoKindResult<u64>>) -> Self {
        LogFuture {
            inner: LogFutureInner::Pending(receiver),
        }
    }
}

impl Future for LogFuture {
    type Output = Result<u64>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().inner {
            LogFutureInner::Ready(value) => {
                Poll::Ready(value.take().expect("future polled after completion"))
            }
            LogFutureInner::Pending(receiver) => match Pin::new(receiver).poll(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(Ok(Ok(index))) => Poll::Ready(Ok(index)),
                Poll::Ready(Ok(Err(kind))) => Poll::Ready(Err(kind.into())),
                // The worker dropped the sender: the log was closed
                // while the task was queued.
                Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Closed)),
            },
        }
    }
}

/// The read and write entry point of the segmented log.
///
/// Writers are serialized by the write lock; readers share the read
/// lock. Durability work is dispatched to the io worker and surfaced
/// as [`LogFuture`]s. No file io happens while the write lock is held.
pub struct SegmentedLog {
    dir: StorageDirectory,
    opt: Arc<LogOption>,
    server: Option<Arc<dyn ServerContext>>,
    cache: RwLock<SegmentCache>,
    worker: LogWorker,
    meta: MetaFile,
    closed: AtomicBool,
}

impl SegmentedLog {
    /// Loads all segments under `<root>/current/` in order, replaying
    /// every entry with `index > last_index_in_snapshot` through
    /// `consumer`, and starts the io worker positioned at the open
    /// segment.
    ///
    /// If the log ends before `last_index_in_snapshot`, keeping it
    /// would leave a hole after the snapshot, so the whole log is
    /// dropped instead.
    pub fn open<F>(
        root: impl AsRef<std::path::Path>,
        opt: LogOption,
        server: Option<Arc<dyn ServerContext>>,
        last_index_in_snapshot: Option<u64>,
        mut consumer: F,
    ) -> Result<SegmentedLog>
    where
        F: FnMut(&LogEntry),
    {
        let opt = Arc::new(opt);
        let dir = StorageDirectory::open(root)?;

        let mut cache = SegmentCache::new(opt.cache_max_segments);
        let mut open_state = None;

        let files = dir.segment_files()?;
        let num_files = files.len();
        for (i, file) in files.into_iter().enumerate() {
            // The newest segments stay fully in memory; the open
            // segment always does.
            let keep_entries =
                file.end_index.is_none() || num_files - i <= opt.cache_max_segments;
            let segment = LogSegment::load_segment(
                &file.path,
                file.start_index,
                file.end_index,
                keep_entries,
                &mut |entry| {
                    if last_index_in_snapshot.map(|last| entry.index > last).unwrap_or(true) {
                        consumer(entry);
                    }
                },
            )?;
            if segment.is_open() {
                if segment.is_empty() {
                    // Nothing usable was recovered; a fresh segment
                    // will replace the file.
                    tracing::warn!("drop unrecoverable open segment {:?}", file.path);
                    std::fs::remove_file(&file.path)?;
                    dir.sync()?;
                    continue;
                }
                open_state = Some(OpenSegmentState {
                    start_index: segment.start_index(),
                    valid_size: segment.total_size(),
                });
            }
            cache.install_segment(segment)?;
        }

        if let (Some(last), Some(end)) = (last_index_in_snapshot, cache.end_index()) {
            if end < last {
                tracing::warn!(
                    "log end index {} is smaller than the snapshot index {}, purge the log",
                    end,
                    last
                );
                for file in dir.segment_files()? {
                    std::fs::remove_file(&file.path)?;
                }
                dir.sync()?;
                cache.clear();
                open_state = None;
            }
        }

        let last_durable = match (cache.end_index(), last_index_in_snapshot) {
            (Some(end), Some(last)) => end.max(last),
            (Some(end), None) => end,
            (None, Some(last)) => last,
            (None, None) => 0,
        };
        let worker = LogWorker::start(dir.clone(), opt.clone(), last_durable, open_state)?;

        Ok(SegmentedLog {
            meta: MetaFile::new(dir.clone()),
            dir,
            opt,
            server,
            cache: RwLock::new(cache),
            worker,
            closed: AtomicBool::new(false),
        })
    }

    fn check_state(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) || self.worker.is_failed() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    pub fn start_index(&self) -> Option<u64> {
        self.cache.read().unwrap().start_index()
    }

    pub fn end_index(&self) -> Option<u64> {
        self.cache.read().unwrap().end_index()
    }

    /// The highest index durably on disk.
    pub fn flushed_index(&self) -> u64 {
        self.worker.flushed_index()
    }

    pub fn get_term_index(&self, index: u64) -> Result<Option<TermIndex>> {
        self.check_state()?;
        Ok(self.cache.read().unwrap().get_term_index(index))
    }

    pub fn get_entries(&self, start_index: u64, end_index: u64) -> Result<Vec<TermIndex>> {
        self.check_state()?;
        Ok(self
            .cache
            .read()
            .unwrap()
            .term_indices(start_index, end_index))
    }

    pub fn get_last_entry_term_index(&self) -> Result<Option<TermIndex>> {
        self.check_state()?;
        Ok(self.cache.read().unwrap().last_term_index())
    }

    /// Returns the entry at `index`, or `None` outside the held range.
    ///
    /// The fast path serves from memory under the read lock. The slow
    /// path reloads the segment's bodies from disk without holding any
    /// lock, then installs them for later readers.
    pub fn get(&self, index: u64) -> Result<Option<LogEntry>> {
        self.check_state()?;
        let (start_index, end_index) = {
            let cache = self.cache.read().unwrap();
            match cache.get_segment(index) {
                None => return Ok(None),
                Some(segment) => {
                    if let Some(entry) = segment.entry(index) {
                        return Ok(Some(entry.clone()));
                    }
                    debug_assert!(!segment.is_open(), "the open segment is never evicted");
                    (segment.start_index(), segment.end_index())
                }
            }
        };

        self.check_and_evict_cache();

        let path = self.dir.closed_segment_path(start_index, end_index);
        let loaded = LogSegment::load_segment(
            &path,
            start_index,
            Some(end_index),
            true,
            &mut |_| {},
        )?;
        let entry = loaded.entry(index).cloned();

        if let Some(entries) = loaded.take_entries() {
            let mut cache = self.cache.write().unwrap();
            if let Some(segment) = cache.get_segment_mut(index) {
                if segment.start_index() == start_index
                    && !segment.is_open()
                    && !segment.has_entries()
                    && segment.num_entries() == entries.len()
                {
                    segment.install_entries(entries);
                }
            }
        }
        Ok(entry)
    }

    /// Appends one entry, rolling the open segment on size or term
    /// change first. Returns the durability future.
    pub fn append_entry(&self, entry: LogEntry) -> Result<LogFuture> {
        self.check_state()?;
        let receiver = {
            let mut cache = self.cache.write().unwrap();
            if let Some(last) = cache.last_term_index() {
                if entry.index != last.index + 1 {
                    return Err(Error::InvalidArgument(format!(
                        "entry index {} does not follow the log end {}",
                        entry.index, last.index
                    )));
                }
                if entry.term < last.term {
                    return Err(Error::InvalidArgument(format!(
                        "entry term {} went backward from {}",
                        entry.term, last.term
                    )));
                }
            }

            enum OpenAction {
                Start,
                Roll { start: u64, end: u64 },
                Append,
            }
            let action = match cache.open_segment() {
                None => OpenAction::Start,
                Some(open) => {
                    let roll = self.is_segment_full(open, &entry)
                        || (!open.is_empty()
                            && open
                                .last_term_index()
                                .map(|ti| ti.term != entry.term)
                                .unwrap_or_default());
                    if roll {
                        OpenAction::Roll {
                            start: open.start_index(),
                            end: open.end_index(),
                        }
                    } else {
                        OpenAction::Append
                    }
                }
            };
            match action {
                // No open segment: start a fresh one. The worker
                // creates the file before any write reaches it; errors
                // surface on the write future.
                OpenAction::Start => {
                    cache.add_open_segment(entry.index);
                    drop(self.worker.start_segment(entry.index));
                }
                // Close the full segment, then start its successor.
                OpenAction::Roll { start, end } => {
                    cache.roll_open_segment();
                    drop(self.worker.roll_segment(start, end));
                    cache.add_open_segment(entry.index);
                    drop(self.worker.start_segment(entry.index));
                }
                OpenAction::Append => {}
            }

            cache.append_entry(&entry);
            self.worker.write_entry(entry)
        };

        self.check_and_evict_cache();
        Ok(LogFuture::pending(receiver))
    }

    fn is_segment_full(&self, open: &LogSegment, entry: &LogEntry) -> bool {
        if open.total_size() >= self.opt.segment_size_max as u64 {
            return true;
        }
        let entry_size = super::format::record_size(entry) as u64;
        // An entry larger than a whole segment goes into the current
        // one; rolling first would not help it fit.
        entry_size <= self.opt.segment_size_max as u64
            && open.total_size() + entry_size > self.opt.segment_size_max as u64
    }

    /// The follower append path: walks the stored term indices against
    /// `entries`, truncates the divergent suffix when a term differs,
    /// and appends everything not already stored.
    ///
    /// Client requests attached to truncated entries are failed via
    /// [`ServerContext::fail_client_request`].
    pub fn append(&self, entries: Vec<LogEntry>) -> Result<Vec<LogFuture>> {
        self.check_state()?;
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let mut truncate_index = None;
        let mut skip = 0;
        {
            let cache = self.cache.read().unwrap();
            for entry in &entries {
                let stored = match cache.get_term_index(entry.index) {
                    Some(stored) => stored,
                    None => break,
                };
                if stored.term != entry.term {
                    // The logs diverge here: everything from this
                    // index on is a stale suffix.
                    truncate_index = Some(stored.index);
                    break;
                }
                skip += 1;
            }
        }

        if let Some(truncate_index) = truncate_index {
            self.fail_truncated_requests(truncate_index)?;
        }

        let mut futures = Vec::with_capacity(entries.len() - skip + 1);
        if let Some(truncate_index) = truncate_index {
            futures.push(self.truncate(truncate_index)?);
        }
        for entry in entries.into_iter().skip(skip) {
            futures.push(self.append_entry(entry)?);
        }
        Ok(futures)
    }

    fn fail_truncated_requests(&self, truncate_index: u64) -> Result<()> {
        let server = match &self.server {
            Some(server) => server.clone(),
            None => return Ok(()),
        };
        let end_index = match self.end_index() {
            Some(end) => end,
            None => return Ok(()),
        };
        for index in truncate_index..=end_index {
            match self.get(index) {
                Ok(Some(entry)) => server.fail_client_request(&entry),
                Ok(None) => {}
                Err(err) => {
                    tracing::error!("failed to read truncated entry {}: {}", index, err);
                }
            }
        }
        Ok(())
    }

    /// Removes every entry with `index' >= index`, durably.
    pub fn truncate(&self, index: u64) -> Result<LogFuture> {
        self.check_state()?;
        let mut cache = self.cache.write().unwrap();
        match cache.truncate(index) {
            Some(segments) => Ok(LogFuture::pending(self.worker.truncate(segments))),
            None => Ok(LogFuture::ready(index)),
        }
    }

    /// Forces an fsync up to `last_snapshot_index` and purges closed
    /// segments entirely covered by the snapshot.
    pub fn sync_with_snapshot(&self, last_snapshot_index: u64) -> Result<LogFuture> {
        self.check_state()?;
        let purge = {
            let mut cache = self.cache.write().unwrap();
            let purge = cache.closed_segments_below(last_snapshot_index);
            cache.remove_closed_segments_below(last_snapshot_index);
            purge
        };
        Ok(LogFuture::pending(
            self.worker.sync(last_snapshot_index, purge),
        ))
    }

    pub fn write_metadata(&self, term: u64, voted_for: Option<&PeerId>) -> Result<()> {
        self.check_state()?;
        self.meta.set(term, voted_for)
    }

    pub fn load_metadata(&self) -> Result<Metadata> {
        self.meta.load()
    }

    fn check_and_evict_cache(&self) {
        let server = match &self.server {
            Some(server) => server,
            None => return,
        };
        if !self.cache.read().unwrap().should_evict() {
            return;
        }
        let follower_next_indices = server.follower_next_indices();
        let flushed_index = self.worker.flushed_index();
        let last_applied = server.last_applied_index();

        let mut cache = self.cache.write().unwrap();
        let evicted = cache.evict_cache(&follower_next_indices, flushed_index, last_applied);
        if evicted == 0 && cache.should_evict() {
            tracing::warn!(
                "segment cache is over budget ({} cached) but nothing is evictable",
                cache.num_cached_segments()
            );
        }
    }

    /// Closes the log: pending tasks are drained and synced, further
    /// writes are refused.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.worker.close();
    }
}

impl Drop for SegmentedLog {
    fn drop(&mut self) {
        self.close();
    }
}
