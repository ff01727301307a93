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

use std::{collections::BTreeMap, sync::Mutex, time::Duration};

use futures::channel::oneshot;
use raft_engine_common::{Error, RaftClientReply, Result};
use tokio::sync::Notify;

struct PendingRequest {
    reply: Option<RaftClientReply>,
    sender: oneshot::Sender<Result<RaftClientReply>>,
}

struct WindowInner {
    /// The lowest outstanding sequence number. Requests below it have
    /// been delivered (or terminally failed).
    first_seq_num: u64,
    next_seq_num: u64,
    requests: BTreeMap<u64, PendingRequest>,
}

impl WindowInner {
    /// Completes the in order prefix of replied requests. A reply for
    /// a later sequence waits here until every earlier one completed:
    /// ordering is the property the window exists to enforce.
    fn deliver_head(&mut self) {
        // A caller that dropped its future must not block the head.
        self.requests
            .retain(|_, pending| !pending.sender.is_canceled());
        while let Some(entry) = self.requests.first_entry() {
            if entry.get().reply.is_none() {
                break;
            }
            let (_, pending) = entry.remove_entry();
            let reply = pending.reply.expect("checked above");
            let _ = pending.sender.send(Ok(reply));
        }
        self.first_seq_num = self
            .requests
            .keys()
            .next()
            .copied()
            .unwrap_or(self.next_seq_num);
    }
}

/// A per target fifo of pending requests. Sequence numbers are
/// assigned here; replies complete the callers' futures strictly in
/// sequence order, whatever order the server produced them in.
pub(crate) struct SlidingWindow {
    name: String,
    inner: Mutex<WindowInner>,
    retry_now: Notify,
}

impl SlidingWindow {
    pub fn new(name: String) -> Self {
        SlidingWindow {
            name,
            inner: Mutex::new(WindowInner {
                first_seq_num: 1,
                next_seq_num: 1,
                requests: BTreeMap::new(),
            }),
            retry_now: Notify::new(),
        }
    }

    /// Assigns the next sequence number and registers the pending
    /// request. The receiver resolves when the reply is deliverable in
    /// order, or with the request's terminal error.
    pub fn submit(&self) -> (u64, oneshot::Receiver<Result<RaftClientReply>>) {
        let (sender, receiver) = oneshot::channel();
        let mut inner = self.inner.lock().unwrap();
        let seq_num = inner.next_seq_num;
        inner.next_seq_num += 1;
        inner.requests.insert(
            seq_num,
            PendingRequest {
                reply: None,
                sender,
            },
        );
        (seq_num, receiver)
    }

    /// Whether `seq_num` still awaits a reply. Cancelled requests are
    /// purged on the way.
    pub fn is_pending(&self, seq_num: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.deliver_head();
        inner.requests.contains_key(&seq_num)
    }

    /// Records the reply for `seq_num` and delivers the completed
    /// prefix. Duplicate replies for the same sequence are dropped:
    /// the server side retry cache may answer a retried request twice,
    /// but the caller sees exactly one reply.
    pub fn receive_reply(&self, seq_num: u64, reply: RaftClientReply) {
        let mut inner = self.inner.lock().unwrap();
        match inner.requests.get_mut(&seq_num) {
            Some(pending) if pending.reply.is_none() => {
                pending.reply = Some(reply);
            }
            _ => {
                tracing::trace!("{}: drop duplicate reply for seq {}", self.name, seq_num);
                return;
            }
        }
        inner.deliver_head();
    }

    /// Terminally fails `seq_num`. The error bypasses ordering so a
    /// doomed request cannot block its successors.
    pub fn fail(&self, seq_num: u64, err: Error) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(pending) = inner.requests.remove(&seq_num) {
            let _ = pending.sender.send(Err(err));
        }
        inner.deliver_head();
    }

    /// Rewinds the window to its lowest outstanding sequence and wakes
    /// every in flight request for an immediate re-send. Safe because
    /// the server side retry cache dedupes on `(client_id, call_id)`.
    pub fn reset_first_seq_num(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.first_seq_num = inner
            .requests
            .keys()
            .next()
            .copied()
            .unwrap_or(inner.next_seq_num);
        tracing::debug!(
            "{}: reset first seq num to {}",
            self.name,
            inner.first_seq_num
        );
        drop(inner);
        self.retry_now.notify_waiters();
    }

    pub fn first_seq_num(&self) -> u64 {
        self.inner.lock().unwrap().first_seq_num
    }

    pub fn num_pending(&self) -> usize {
        self.inner.lock().unwrap().requests.len()
    }

    /// Parks a retrying request until the retry interval elapses or
    /// the window is reset.
    pub async fn wait_retry(&self, interval: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = self.retry_now.notified() => {}
        }
    }
}
