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
    fs::{File, OpenOptions},
    io::{Seek, SeekFrom, Write},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Condvar, Mutex,
    },
    thread::JoinHandle,
    time::Instant,
};

use futures::channel::oneshot;
use raft_engine_common::LogEntry;

use super::{
    cache::{SegmentSpan, TruncationSegments},
    format,
};
use crate::{fs::FileExt, fs::StorageDirectory, IoKindResult, LogOption, Result};

/// One io task consumed by the worker, in submit order.
pub(crate) enum Task {
    /// Append the serialized entry to the open segment file. The
    /// future completes with the entry index once the batch holding it
    /// is fsynced.
    WriteEntry { entry: LogEntry },
    /// Create `log_inprogress_<index>` and write the segment header.
    StartSegment { index: u64 },
    /// Fsync and close the open file, then rename it to
    /// `log_<start>-<end>`. No later task writes to that file again.
    RollSegment { start: u64, end: u64 },
    /// Cut or delete the designated files; durable before completion.
    Truncate { segments: TruncationSegments },
    /// Force an fsync, then delete the purged segment files.
    Sync {
        index: u64,
        purge: Vec<SegmentSpan>,
    },
}

struct Request {
    task: Task,
    sender: oneshot::Sender<IoKindResult<u64>>,
}

enum QueueItem {
    Request(Request),
    Shutdown,
}

struct ChannelCore {
    items: Vec<QueueItem>,
    waiting: bool,
}

#[derive(Clone)]
struct Channel {
    core: Arc<(Mutex<ChannelCore>, Condvar)>,
}

impl Channel {
    fn new() -> Self {
        Channel {
            core: Arc::new((
                Mutex::new(ChannelCore {
                    items: Vec::new(),
                    waiting: false,
                }),
                Condvar::new(),
            )),
        }
    }

    /// Takes all queued items, waiting at most `timeout` when the
    /// queue is empty. An empty return means the timeout fired.
    fn take(&self, timeout: Option<std::time::Duration>) -> Vec<QueueItem> {
        let mut core = self.core.0.lock().unwrap();
        while core.items.is_empty() {
            core.waiting = true;
            match timeout {
                Some(timeout) => {
                    let (guard, result) = self.core.1.wait_timeout(core, timeout).unwrap();
                    core = guard;
                    if result.timed_out() {
                        core.waiting = false;
                        break;
                    }
                }
                None => {
                    core = self.core.1.wait(core).unwrap();
                }
            }
        }
        std::mem::take(&mut core.items)
    }

    fn is_empty(&self) -> bool {
        self.core.0.lock().unwrap().items.is_empty()
    }

    fn submit(&self, task: Task) -> oneshot::Receiver<IoKindResult<u64>> {
        let (sender, receiver) = oneshot::channel();
        let mut core = self.core.0.lock().unwrap();
        core.items.push(QueueItem::Request(Request { task, sender }));
        if core.waiting {
            core.waiting = false;
            self.core.1.notify_one();
        }
        receiver
    }

    fn shutdown(&self) {
        let mut core = self.core.0.lock().unwrap();
        core.items.push(QueueItem::Shutdown);
        if core.waiting {
            core.waiting = false;
            self.core.1.notify_one();
        }
    }
}

/// State the worker resumes an existing open segment with.
pub(crate) struct OpenSegmentState {
    pub start_index: u64,
    /// Bytes of the valid record prefix; a malformed crash tail past
    /// this point is cut before the file is appended to again.
    pub valid_size: u64,
}

/// Handle to the single threaded io worker.
pub(crate) struct LogWorker {
    channel: Channel,
    flushed_index: Arc<AtomicU64>,
    failed: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl LogWorker {
    /// Starts the worker. `last_durable_index` seeds the flushed
    /// index: everything loaded from disk is durable by definition.
    pub fn start(
        dir: StorageDirectory,
        opt: Arc<LogOption>,
        last_durable_index: u64,
        open_segment: Option<OpenSegmentState>,
    ) -> Result<LogWorker> {
        let writer = match open_segment {
            Some(state) => Some(Writer::resume(&dir, &state)?),
            None => None,
        };

        let channel = Channel::new();
        let flushed_index = Arc::new(AtomicU64::new(last_durable_index));
        let failed = Arc::new(AtomicBool::new(false));

        let mut worker = Worker {
            dir,
            opt,
            channel: channel.clone(),
            writer,
            pending: Vec::new(),
            pending_since: None,
            flushed_index: flushed_index.clone(),
            failed: failed.clone(),
        };
        let handle = std::thread::Builder::new()
            .name("log:worker".to_owned())
            .spawn(move || worker.run())?;

        Ok(LogWorker {
            channel,
            flushed_index,
            failed,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn write_entry(&self, entry: LogEntry) -> oneshot::Receiver<IoKindResult<u64>> {
        self.channel.submit(Task::WriteEntry { entry })
    }

    pub fn start_segment(&self, index: u64) -> oneshot::Receiver<IoKindResult<u64>> {
        self.channel.submit(Task::StartSegment { index })
    }

    pub fn roll_segment(&self, start: u64, end: u64) -> oneshot::Receiver<IoKindResult<u64>> {
        self.channel.submit(Task::RollSegment { start, end })
    }

    pub fn truncate(&self, segments: TruncationSegments) -> oneshot::Receiver<IoKindResult<u64>> {
        self.channel.submit(Task::Truncate { segments })
    }

    pub fn sync(&self, index: u64, purge: Vec<SegmentSpan>) -> oneshot::Receiver<IoKindResult<u64>> {
        self.channel.submit(Task::Sync { index, purge })
    }

    #[inline(always)]
    pub fn flushed_index(&self) -> u64 {
        self.flushed_index.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Drains queued tasks, syncs, and joins the worker thread.
    pub fn close(&self) {
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            self.channel.shutdown();
            handle.join().unwrap_or_default();
        }
    }
}

impl Drop for LogWorker {
    fn drop(&mut self) {
        self.close();
    }
}

struct Writer {
    file: File,
    start_index: u64,
    written: u64,
}

impl Writer {
    fn resume(dir: &StorageDirectory, state: &OpenSegmentState) -> Result<Writer> {
        let path = dir.open_segment_path(state.start_index);
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        // Cut whatever malformed tail a crash left behind.
        if file.metadata()?.len() != state.valid_size {
            file.set_len(state.valid_size)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::Start(state.valid_size))?;
        Ok(Writer {
            file,
            start_index: state.start_index,
            written: state.valid_size,
        })
    }

    fn create(dir: &StorageDirectory, opt: &LogOption, index: u64) -> Result<Writer> {
        let path = dir.open_segment_path(index);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.preallocate(opt.segment_size_max)?;
        file.write_all(&format::SEGMENT_HEADER)?;
        file.sync_all()?;
        dir.sync()?;
        Ok(Writer {
            file,
            start_index: index,
            written: format::SEGMENT_HEADER_SIZE as u64,
        })
    }
}

/// Fsync, cut the preallocated tail, and rename the open file to its
/// closed name.
fn close_and_rename(dir: &StorageDirectory, writer: Writer, start: u64, end: u64) -> Result<()> {
    writer.file.set_len(writer.written)?;
    writer.file.sync_all()?;
    drop(writer);

    std::fs::rename(
        dir.open_segment_path(start),
        dir.closed_segment_path(start, end),
    )?;
    dir.sync()?;
    Ok(())
}

fn apply_truncation(dir: &StorageDirectory, segments: &TruncationSegments) -> Result<()> {
    // Whole segments go first: if a crash lands between the steps the
    // log keeps a longer suffix, never a gap.
    for span in &segments.to_delete {
        std::fs::remove_file(segment_path(dir, span))?;
    }
    if let Some(span) = &segments.to_truncate {
        let path = segment_path(dir, &span.file);
        let file = OpenOptions::new().write(true).open(&path)?;
        file.set_len(span.file_size)?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(
            path,
            dir.closed_segment_path(span.file.start_index, span.new_end_index),
        )?;
    }
    dir.sync()?;
    Ok(())
}

fn purge_files(dir: &StorageDirectory, purge: &[SegmentSpan]) -> Result<()> {
    for span in purge {
        std::fs::remove_file(segment_path(dir, span))?;
    }
    if !purge.is_empty() {
        dir.sync()?;
    }
    Ok(())
}

fn segment_path(dir: &StorageDirectory, span: &SegmentSpan) -> std::path::PathBuf {
    match span.end_index {
        Some(end) => dir.closed_segment_path(span.start_index, end),
        None => dir.open_segment_path(span.start_index),
    }
}

fn error_kind(err: crate::Error) -> std::io::ErrorKind {
    match err {
        crate::Error::Io(err) => err.kind(),
        _ => std::io::ErrorKind::Other,
    }
}

struct Worker {
    dir: StorageDirectory,
    opt: Arc<LogOption>,
    channel: Channel,
    writer: Option<Writer>,
    /// Written but not yet fsynced entries, in index order.
    pending: Vec<(u64, oneshot::Sender<IoKindResult<u64>>)>,
    pending_since: Option<Instant>,
    flushed_index: Arc<AtomicU64>,
    failed: Arc<AtomicBool>,
}

impl Worker {
    fn run(&mut self) {
        let mut encode_buf = Vec::new();
        loop {
            let timeout = self.pending_since.map(|since| {
                self.opt
                    .flush
                    .sync_interval
                    .saturating_sub(since.elapsed())
            });
            let items = self.channel.take(timeout);
            if items.is_empty() {
                // Sync interval elapsed with writes still buffered.
                if let Err(kind) = self.flush() {
                    self.fail(kind);
                }
                continue;
            }

            for item in items {
                let request = match item {
                    QueueItem::Request(request) => request,
                    QueueItem::Shutdown => {
                        if let Err(kind) = self.flush() {
                            self.fail(kind);
                        }
                        return;
                    }
                };
                if self.failed.load(Ordering::Acquire) {
                    let _ = request.sender.send(Err(std::io::ErrorKind::Other));
                    continue;
                }
                if let Err(kind) = self.execute(request, &mut encode_buf) {
                    self.fail(kind);
                }
            }

            // Nothing else queued: make the batch durable now instead
            // of waiting for the timer.
            if !self.pending.is_empty() && self.channel.is_empty() {
                if let Err(kind) = self.flush() {
                    self.fail(kind);
                }
            }
        }
    }

    fn execute(&mut self, request: Request, encode_buf: &mut Vec<u8>) -> IoKindResult<()> {
        let Request { task, sender } = request;
        match task {
            Task::WriteEntry { entry } => {
                let writer = match &mut self.writer {
                    Some(writer) => writer,
                    None => {
                        tracing::error!("write entry {} without an open segment", entry.index);
                        let _ = sender.send(Err(std::io::ErrorKind::Other));
                        return Err(std::io::ErrorKind::Other);
                    }
                };
                encode_buf.clear();
                format::encode_record(&entry, encode_buf);
                if let Err(err) = writer.file.write_all(encode_buf) {
                    let kind = err.kind();
                    let _ = sender.send(Err(kind));
                    return Err(kind);
                }
                writer.written += encode_buf.len() as u64;
                self.pending.push((entry.index, sender));
                if self.pending_since.is_none() {
                    self.pending_since = Some(Instant::now());
                }
                if self.pending.len() >= self.opt.flush.force_sync_num {
                    self.flush()?;
                }
                Ok(())
            }
            Task::StartSegment { index } => {
                debug_assert!(self.writer.is_none());
                match Writer::create(&self.dir, &self.opt, index).map_err(error_kind) {
                    Ok(writer) => {
                        self.writer = Some(writer);
                        let _ = sender.send(Ok(index));
                        Ok(())
                    }
                    Err(kind) => {
                        let _ = sender.send(Err(kind));
                        Err(kind)
                    }
                }
            }
            Task::RollSegment { start, end } => {
                let result = self.roll_segment(start, end);
                let _ = sender.send(result.map(|_| end));
                result
            }
            Task::Truncate { segments } => {
                let result = self.truncate(&segments);
                let _ = sender.send(result.map(|i| i.unwrap_or(0)));
                result.map(|_| ())
            }
            Task::Sync { index, purge } => {
                let result = self.sync_and_purge(&purge);
                let _ = sender.send(result.map(|_| index));
                result
            }
        }
    }

    fn roll_segment(&mut self, start: u64, end: u64) -> IoKindResult<()> {
        self.flush()?;
        let writer = self.writer.take().ok_or(std::io::ErrorKind::Other)?;
        debug_assert_eq!(writer.start_index, start);
        // Cut the preallocated tail so the closed file covers its
        // records exactly.
        close_and_rename(&self.dir, writer, start, end).map_err(error_kind)
    }

    fn truncate(&mut self, segments: &TruncationSegments) -> IoKindResult<Option<u64>> {
        self.flush()?;
        // The open segment is either cut or deleted below; its handle
        // must not outlive the file.
        self.writer = None;

        apply_truncation(&self.dir, segments).map_err(error_kind)?;

        // The log shrank: the flushed index follows the new end.
        let end_index = segments.end_index();
        self.flushed_index
            .store(end_index.unwrap_or(0), Ordering::Release);
        Ok(end_index)
    }

    fn sync_and_purge(&mut self, purge: &[SegmentSpan]) -> IoKindResult<()> {
        self.flush()?;
        if let Some(writer) = &self.writer {
            writer.file.sync_all().map_err(|err| err.kind())?;
        }
        purge_files(&self.dir, purge).map_err(error_kind)
    }

    /// Fsyncs buffered writes and completes their futures in index
    /// order.
    fn flush(&mut self) -> IoKindResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let writer = self.writer.as_mut().ok_or(std::io::ErrorKind::Other)?;
        writer.file.sync_data().map_err(|err| err.kind())?;

        let last_index = self.pending.last().map(|(i, _)| *i).unwrap_or_default();
        self.flushed_index.store(last_index, Ordering::Release);
        self.pending_since = None;
        for (index, sender) in self.pending.drain(..) {
            let _ = sender.send(Ok(index));
        }
        Ok(())
    }

    /// An io error is fatal: every buffered and queued future is
    /// completed with the error and the worker refuses further tasks.
    fn fail(&mut self, kind: std::io::ErrorKind) {
        tracing::error!("log worker failed: {:?}", kind);
        self.failed.store(true, Ordering::Release);
        self.writer = None;
        self.pending_since = None;
        for (_, sender) in self.pending.drain(..) {
            let _ = sender.send(Err(kind));
        }
    }
}
