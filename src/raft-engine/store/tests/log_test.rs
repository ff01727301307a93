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
    path::Path,
    sync::{Arc, Mutex},
};

use raft_engine_common::{LogEntry, PeerId};
use raft_engine_store::{Error, LogOption, SegmentedLog, ServerContext};

#[derive(Default)]
struct TestServer {
    follower_next_indices: Mutex<Vec<u64>>,
    last_applied_index: Mutex<u64>,
    failed_requests: Mutex<Vec<u64>>,
}

impl ServerContext for TestServer {
    fn follower_next_indices(&self) -> Vec<u64> {
        self.follower_next_indices.lock().unwrap().clone()
    }

    fn last_applied_index(&self) -> u64 {
        *self.last_applied_index.lock().unwrap()
    }

    fn fail_client_request(&self, entry: &LogEntry) {
        self.failed_requests.lock().unwrap().push(entry.index);
    }
}

fn entry(term: u64, index: u64) -> LogEntry {
    // Roughly 50 payload bytes, so size based rolling kicks in at
    // small segment limits.
    LogEntry::new(term, index, format!("entry-{:044}", index).into_bytes())
}

fn open_log(root: &Path, opt: LogOption) -> SegmentedLog {
    SegmentedLog::open(root, opt, None, None, |_| {}).unwrap()
}

fn segment_file_names(root: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(root.join("current"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("log_"))
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn roll_by_size_keeps_indices_contiguous() {
    let dir = tempfile::tempdir().unwrap();
    let opt = LogOption {
        segment_size_max: 1024,
        ..Default::default()
    };

    let log = open_log(dir.path(), opt.clone());
    let mut futures = Vec::new();
    for i in 0..40 {
        futures.push(log.append_entry(entry(1, i)).unwrap());
    }
    for (i, future) in futures.into_iter().enumerate() {
        assert_eq!(future.await.unwrap(), i as u64);
    }
    assert_eq!(log.flushed_index(), 39);
    drop(log);

    let names = segment_file_names(dir.path());
    let closed: Vec<&String> = names
        .iter()
        .filter(|n| !n.contains("inprogress"))
        .collect();
    assert!(closed.len() >= 2, "expect at least two closed segments: {names:?}");

    // Reopen and verify the no gap property plus the segment chain.
    let mut replayed = Vec::new();
    let log = SegmentedLog::open(dir.path(), opt, None, None, |e| replayed.push(e.index)).unwrap();
    assert_eq!(replayed, (0..40).collect::<Vec<u64>>());
    assert_eq!(log.start_index(), Some(0));
    assert_eq!(log.end_index(), Some(39));
    for i in 0..40 {
        let got = log.get(i).unwrap().unwrap();
        assert_eq!(got, entry(1, i));
    }
    assert!(log.get(40).unwrap().is_none());
}

#[tokio::test]
async fn term_change_rolls_the_open_segment() {
    let dir = tempfile::tempdir().unwrap();
    let log = open_log(dir.path(), LogOption::default());

    let mut futures = Vec::new();
    for i in 0..5 {
        futures.push(log.append_entry(entry(2, i)).unwrap());
    }
    futures.push(log.append_entry(entry(3, 5)).unwrap());
    for future in futures {
        future.await.unwrap();
    }

    let names = segment_file_names(dir.path());
    assert!(names.contains(&"log_0-4".to_string()), "{names:?}");
    assert!(names.contains(&"log_inprogress_5".to_string()), "{names:?}");
}

#[tokio::test]
async fn term_going_backward_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let log = open_log(dir.path(), LogOption::default());
    log.append_entry(entry(3, 0)).unwrap().await.unwrap();
    assert!(matches!(
        log.append_entry(entry(2, 1)),
        Err(Error::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn append_truncates_divergent_suffix() {
    let dir = tempfile::tempdir().unwrap();
    let server = Arc::new(TestServer::default());
    let log = SegmentedLog::open(
        dir.path(),
        LogOption::default(),
        Some(server.clone()),
        None,
        |_| {},
    )
    .unwrap();

    let mut futures = Vec::new();
    for i in 0..10 {
        futures.push(log.append_entry(entry(1, i)).unwrap());
    }
    for future in futures {
        future.await.unwrap();
    }

    // A new leader overwrites index 9 with a higher term.
    let futures = log
        .append(vec![entry(1, 8), entry(2, 9), entry(2, 10)])
        .unwrap();
    for future in futures {
        future.await.unwrap();
    }

    assert_eq!(log.end_index(), Some(10));
    assert_eq!(log.get(8).unwrap().unwrap().term, 1);
    assert_eq!(log.get(9).unwrap().unwrap().term, 2);
    assert_eq!(log.get(10).unwrap().unwrap().term, 2);
    assert_eq!(*server.failed_requests.lock().unwrap(), vec![9]);

    // The replacement survives a restart.
    drop(log);
    let log = open_log(dir.path(), LogOption::default());
    assert_eq!(log.end_index(), Some(10));
    assert_eq!(log.get(9).unwrap().unwrap(), entry(2, 9));
}

#[tokio::test]
async fn truncate_discards_suffix_durably() {
    let dir = tempfile::tempdir().unwrap();
    let log = open_log(dir.path(), LogOption::default());
    let mut futures = Vec::new();
    for i in 0..10 {
        futures.push(log.append_entry(entry(1, i)).unwrap());
    }
    for future in futures {
        future.await.unwrap();
    }

    log.truncate(5).unwrap().await.unwrap();
    assert_eq!(log.end_index(), Some(4));
    for i in 5..10 {
        assert!(log.get(i).unwrap().is_none());
    }
    for i in 0..5 {
        assert!(log.get(i).unwrap().is_some());
    }

    drop(log);
    let log = open_log(dir.path(), LogOption::default());
    assert_eq!(log.end_index(), Some(4));
    assert!(log.get(5).unwrap().is_none());

    // The log accepts appends at the truncation point again.
    log.append_entry(entry(2, 5)).unwrap().await.unwrap();
    assert_eq!(log.get(5).unwrap().unwrap().term, 2);
}

#[tokio::test]
async fn reopen_skips_malformed_tail() {
    let dir = tempfile::tempdir().unwrap();
    let log = open_log(dir.path(), LogOption::default());
    let mut futures = Vec::new();
    for i in 0..=10 {
        futures.push(log.append_entry(entry(1, i)).unwrap());
    }
    for future in futures {
        future.await.unwrap();
    }
    drop(log);

    // Reopen once so the worker trims the open segment back to its
    // valid bytes, then close again; the file now ends exactly after
    // entry 10.
    drop(open_log(dir.path(), LogOption::default()));

    // Simulate a crash in the middle of writing entry 11: a record
    // with its tail chopped off lands at the end of the open segment.
    let open_path = dir.path().join("current").join("log_inprogress_0");
    let valid_len = std::fs::metadata(&open_path).unwrap().len();
    let mut partial = Vec::new();
    {
        use prost::Message;
        let payload = entry(1, 11).encode_to_vec();
        prost::encoding::encode_varint(payload.len() as u64, &mut partial);
        partial.extend_from_slice(&payload);
        // The crc32 never made it to disk.
    }
    partial.truncate(partial.len() - 5);
    let mut content = std::fs::read(&open_path).unwrap();
    content.extend_from_slice(&partial);
    std::fs::write(&open_path, content).unwrap();

    let mut replayed = Vec::new();
    let log = SegmentedLog::open(dir.path(), LogOption::default(), None, None, |e| {
        replayed.push(e.index)
    })
    .unwrap();
    assert_eq!(replayed, (0..=10).collect::<Vec<u64>>());
    assert_eq!(log.end_index(), Some(10));
    assert!(log.get(11).unwrap().is_none());

    // The malformed tail was cut: the next append lands at 11 and the
    // file grows from the recovered offset.
    log.append_entry(entry(1, 11)).unwrap().await.unwrap();
    assert_eq!(log.get(11).unwrap().unwrap(), entry(1, 11));
    drop(log);
    assert!(std::fs::metadata(&open_path).unwrap().len() > valid_len);

    let log = open_log(dir.path(), LogOption::default());
    assert_eq!(log.end_index(), Some(11));
}

#[tokio::test]
async fn get_reloads_evicted_segments_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let server = Arc::new(TestServer {
        follower_next_indices: Mutex::new(vec![u64::MAX]),
        last_applied_index: Mutex::new(u64::MAX),
        ..Default::default()
    });
    let opt = LogOption {
        segment_size_max: 256,
        cache_max_segments: 1,
        ..Default::default()
    };
    let log = SegmentedLog::open(dir.path(), opt, Some(server), None, |_| {}).unwrap();

    let mut futures = Vec::new();
    for i in 0..64 {
        futures.push(log.append_entry(entry(1, i)).unwrap());
    }
    for future in futures {
        future.await.unwrap();
    }

    // Old segments were evicted along the way; reads still succeed by
    // reloading bodies from disk.
    for i in 0..64 {
        assert_eq!(log.get(i).unwrap().unwrap(), entry(1, i));
    }
}

#[tokio::test]
async fn metadata_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let log = open_log(dir.path(), LogOption::default());
    assert_eq!(log.load_metadata().unwrap().term, 0);

    let voted = PeerId::new("s3");
    log.write_metadata(9, Some(&voted)).unwrap();
    drop(log);

    let log = open_log(dir.path(), LogOption::default());
    let meta = log.load_metadata().unwrap();
    assert_eq!(meta.term, 9);
    assert_eq!(meta.voted_for, Some(voted));
}

#[tokio::test]
async fn sync_with_snapshot_purges_covered_segments() {
    let dir = tempfile::tempdir().unwrap();
    let opt = LogOption {
        segment_size_max: 256,
        ..Default::default()
    };
    let log = open_log(dir.path(), opt.clone());
    let mut futures = Vec::new();
    for i in 0..64 {
        futures.push(log.append_entry(entry(1, i)).unwrap());
    }
    for future in futures {
        future.await.unwrap();
    }

    let before = segment_file_names(dir.path()).len();
    log.sync_with_snapshot(32).unwrap().await.unwrap();
    let names = segment_file_names(dir.path());
    assert!(names.len() < before, "{names:?}");

    // Every remaining file still covers an index at or after 32.
    drop(log);
    let log = open_log(dir.path(), opt);
    assert!(log.start_index().unwrap() <= 32);
    assert_eq!(log.end_index(), Some(63));
}

#[tokio::test]
async fn closed_log_refuses_writes() {
    let dir = tempfile::tempdir().unwrap();
    let log = open_log(dir.path(), LogOption::default());
    log.append_entry(entry(1, 0)).unwrap().await.unwrap();
    log.close();
    assert!(matches!(log.append_entry(entry(1, 1)), Err(Error::Closed)));
    assert!(matches!(log.get(0), Err(Error::Closed)));
}

#[tokio::test]
async fn open_purges_log_behind_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let log = open_log(dir.path(), LogOption::default());
    let mut futures = Vec::new();
    for i in 0..5 {
        futures.push(log.append_entry(entry(1, i)).unwrap());
    }
    for future in futures {
        future.await.unwrap();
    }
    drop(log);

    // A snapshot far ahead of the log: keeping the entries would leave
    // a hole, so the log starts over empty.
    let mut replayed = Vec::new();
    let log = SegmentedLog::open(dir.path(), LogOption::default(), None, Some(100), |e| {
        replayed.push(e.index)
    })
    .unwrap();
    assert!(replayed.is_empty());
    assert_eq!(log.end_index(), None);
    assert!(segment_file_names(dir.path()).is_empty());

    log.append_entry(entry(2, 101)).unwrap().await.unwrap();
    assert_eq!(log.end_index(), Some(101));
}
