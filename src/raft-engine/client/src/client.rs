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
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    task::{Context, Poll},
};

use futures::channel::oneshot;
use rand::seq::SliceRandom;
use raft_engine_common::{
    ClientId, Error, GroupId, PeerId, RaftClientReply, RaftClientRequest, RaftGroup, RaftPeer,
    RequestType, Result,
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::{window::SlidingWindow, ClientOption, RaftClientRpc};

/// The key of the shared window routed to whoever currently leads.
const RAFT_WINDOW: &str = "RAFT";

/// The future of an async request. Resolves once the reply is
/// deliverable in sequence order, or with the request's terminal
/// error. Dropping it cancels the request and releases its permit.
pub struct PendingReply {
    receiver: oneshot::Receiver<Result<RaftClientReply>>,
    _permit: OwnedSemaphorePermit,
}

impl Future for PendingReply {
    type Output = Result<RaftClientReply>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.get_mut().receiver).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "client closed",
            )))),
        }
    }
}

/// A client that sends requests to a raft service.
///
/// Async submissions flow through per target sliding windows so the
/// replies complete in submission order and survive leader changes;
/// retried requests reuse their call id, which the server side retry
/// cache dedupes on.
#[derive(Clone)]
pub struct RaftClient {
    core: Arc<ClientCore>,
}

struct ClientCore {
    client_id: ClientId,
    group_id: GroupId,
    rpc: Arc<dyn RaftClientRpc>,
    opt: ClientOption,

    /// Copy on write snapshot: readers grab the current `Arc`, writers
    /// swap in a whole new list.
    peers: Mutex<Arc<Vec<RaftPeer>>>,
    leader_id: Mutex<Option<PeerId>>,
    next_call_id: AtomicU64,
    windows: Mutex<HashMap<String, Arc<SlidingWindow>>>,
    semaphore: Arc<Semaphore>,
}

impl RaftClient {
    pub fn new(
        group: RaftGroup,
        leader_id: Option<PeerId>,
        rpc: Arc<dyn RaftClientRpc>,
        opt: ClientOption,
    ) -> Self {
        assert!(
            !group.peers.is_empty(),
            "a raft group needs at least one peer"
        );
        let leader_id = leader_id.or_else(|| group.peers.first().map(|p| p.id.clone()));
        rpc.add_peers(&group.peers);
        RaftClient {
            core: Arc::new(ClientCore {
                client_id: ClientId::random(),
                group_id: group.id,
                rpc,
                semaphore: Arc::new(Semaphore::new(opt.max_outstanding_requests)),
                opt,
                peers: Mutex::new(Arc::new(group.peers)),
                leader_id: Mutex::new(leader_id),
                next_call_id: AtomicU64::new(1),
                windows: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn id(&self) -> ClientId {
        self.core.client_id
    }

    /// A replicated write to the current leader; retries until a reply
    /// or a terminal error.
    pub async fn send(&self, message: Vec<u8>) -> Result<RaftClientReply> {
        self.core
            .request_with_retry(None, RequestType::Write, message)
            .await
    }

    /// A linearizable read through consensus.
    pub async fn send_read_only(&self, message: Vec<u8>) -> Result<RaftClientReply> {
        self.core
            .request_with_retry(None, RequestType::Read, message)
            .await
    }

    /// A read served directly by `server`, valid once its applied
    /// index reaches `min_index`.
    pub async fn send_stale_read(
        &self,
        message: Vec<u8>,
        min_index: u64,
        server: PeerId,
    ) -> Result<RaftClientReply> {
        self.core
            .request_with_retry(Some(server), RequestType::StaleRead { min_index }, message)
            .await
    }

    pub async fn send_async(&self, message: Vec<u8>) -> Result<PendingReply> {
        self.core
            .clone()
            .submit_async(None, RequestType::Write, message)
            .await
    }

    pub async fn send_read_only_async(&self, message: Vec<u8>) -> Result<PendingReply> {
        self.core
            .clone()
            .submit_async(None, RequestType::Read, message)
            .await
    }

    pub async fn send_stale_read_async(
        &self,
        message: Vec<u8>,
        min_index: u64,
        server: PeerId,
    ) -> Result<PendingReply> {
        self.core
            .clone()
            .submit_async(Some(server), RequestType::StaleRead { min_index }, message)
            .await
    }

    /// Replaces the group membership.
    pub async fn set_configuration(&self, peers: Vec<RaftPeer>) -> Result<RaftClientReply> {
        // Refresh the rpc proxies for the new peers up front.
        self.core.rpc.add_peers(&peers);
        self.core
            .request_with_retry(None, RequestType::SetConfiguration { peers }, Vec::new())
            .await
    }

    /// Forces `server` to join `group`.
    pub async fn reinitialize(&self, group: RaftGroup, server: PeerId) -> Result<RaftClientReply> {
        self.core.rpc.add_peers(&group.peers);
        self.core
            .request_once(server, RequestType::Reinitialize { group }, Vec::new())
            .await
    }

    pub async fn server_information(&self, server: PeerId) -> Result<RaftClientReply> {
        self.core
            .request_once(server, RequestType::ServerInformation, Vec::new())
            .await
    }

    pub fn close(&self) {
        self.core.semaphore.close();
        self.core.rpc.close();
    }
}

impl ClientCore {
    fn next_call_id(&self) -> u64 {
        self.next_call_id.fetch_add(1, Ordering::Relaxed)
    }

    fn window(&self, target: Option<&PeerId>) -> Arc<SlidingWindow> {
        let key = target
            .map(|p| p.to_string())
            .unwrap_or_else(|| RAFT_WINDOW.to_string());
        let mut windows = self.windows.lock().unwrap();
        windows
            .entry(key)
            .or_insert_with_key(|key| {
                Arc::new(SlidingWindow::new(format!("{}->{}", self.client_id, key)))
            })
            .clone()
    }

    fn new_request(
        &self,
        server: Option<PeerId>,
        call_id: u64,
        seq_num: u64,
        rtype: RequestType,
        message: Vec<u8>,
    ) -> RaftClientRequest {
        let server_id = server
            .or_else(|| self.leader_id.lock().unwrap().clone())
            .or_else(|| self.peers.lock().unwrap().first().map(|p| p.id.clone()))
            .expect("the peer set is never empty");
        RaftClientRequest {
            client_id: self.client_id,
            server_id,
            group_id: self.group_id.clone(),
            call_id,
            seq_num,
            rtype,
            message,
        }
    }

    /// The direct path: build a fresh request each attempt (the leader
    /// hint may have moved) and retry until a reply or a terminal
    /// error.
    async fn request_with_retry(
        &self,
        server: Option<PeerId>,
        rtype: RequestType,
        message: Vec<u8>,
    ) -> Result<RaftClientReply> {
        let call_id = self.next_call_id();
        loop {
            let request = self.new_request(server.clone(), call_id, 0, rtype.clone(), message.clone());
            if let Some(reply) = self.send_once(&request).await? {
                return Ok(reply);
            }
            tokio::time::sleep(self.opt.retry_interval).await;
        }
    }

    /// Single attempt paths like reinitialize: no retry loop, a
    /// missing reply is an error.
    async fn request_once(
        &self,
        server: PeerId,
        rtype: RequestType,
        message: Vec<u8>,
    ) -> Result<RaftClientReply> {
        let call_id = self.next_call_id();
        let request = self.new_request(Some(server), call_id, 0, rtype, message);
        match self.send_once(&request).await? {
            Some(reply) => Ok(reply),
            None => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "no reply",
            ))),
        }
    }

    /// The windowed path: one permit per outstanding request, a fresh
    /// call id, and a driver task that re-sends under the same
    /// sequence number until the window retires it.
    async fn submit_async(
        self: Arc<Self>,
        server: Option<PeerId>,
        rtype: RequestType,
        message: Vec<u8>,
    ) -> Result<PendingReply> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "client closed",
            )))?;

        let call_id = self.next_call_id();
        let window = self.window(server.as_ref());
        let (seq_num, receiver) = window.submit();

        let core = self;
        tokio::spawn(async move {
            loop {
                if !window.is_pending(seq_num) {
                    return;
                }
                let request =
                    core.new_request(server.clone(), call_id, seq_num, rtype.clone(), message.clone());
                match core.send_once(&request).await {
                    Ok(Some(reply)) => {
                        window.receive_reply(seq_num, reply);
                        return;
                    }
                    Ok(None) => window.wait_retry(core.opt.retry_interval).await,
                    Err(err) => {
                        window.fail(seq_num, err);
                        return;
                    }
                }
            }
        });

        Ok(PendingReply {
            receiver,
            _permit: permit,
        })
    }

    /// One transport attempt. `Ok(None)` asks the caller to retry;
    /// terminal errors pass through.
    async fn send_once(&self, request: &RaftClientRequest) -> Result<Option<RaftClientReply>> {
        match self.rpc.send_request(request.clone()).await {
            Ok(reply) => Ok(reply),
            Err(err) if err.is_terminal() => Err(err),
            Err(err) => {
                let suggested = match &err {
                    Error::NotLeader {
                        peers,
                        suggested_leader,
                    } => {
                        self.refresh_peers(peers);
                        suggested_leader.clone()
                    }
                    _ => None,
                };
                self.handle_failure(request, suggested, &err);
                Ok(None)
            }
        }
    }

    fn refresh_peers(&self, peers: &[RaftPeer]) {
        if peers.is_empty() {
            return;
        }
        *self.peers.lock().unwrap() = Arc::new(peers.to_vec());
        self.rpc.add_peers(peers);
    }

    /// The retry state machine on a transient failure: rewind the
    /// window, and unless the leader was merely not ready, move the
    /// leader hint (to the suggestion, or to a random other peer when
    /// the failed peer is still recorded as leader).
    fn handle_failure(
        &self,
        request: &RaftClientRequest,
        suggested_leader: Option<PeerId>,
        err: &Error,
    ) {
        let window_target = match &request.rtype {
            RequestType::StaleRead { .. } => Some(&request.server_id),
            _ => None,
        };
        self.window(window_target).reset_first_seq_num();

        if matches!(err, Error::LeaderNotReady) {
            return;
        }

        let old_leader = &request.server_id;
        let still_leader = self.leader_id.lock().unwrap().as_ref() == Some(old_leader);
        let new_leader = match suggested_leader {
            Some(leader) => Some(leader),
            None if still_leader => self.random_other_peer(old_leader),
            None => None,
        };

        let change_leader = new_leader.is_some() && still_leader;
        if change_leader {
            debug!(
                "{}: change leader from {} to {}",
                self.client_id,
                old_leader,
                new_leader.as_ref().expect("checked above")
            );
            *self.leader_id.lock().unwrap() = new_leader;
        }
        self.rpc.handle_exception(old_leader, err, change_leader);
    }

    fn random_other_peer(&self, excluded: &PeerId) -> Option<PeerId> {
        let peers = self.peers.lock().unwrap().clone();
        let candidates: Vec<&RaftPeer> = peers.iter().filter(|p| &p.id != excluded).collect();
        candidates
            .choose(&mut rand::thread_rng())
            .map(|p| p.id.clone())
    }
}
