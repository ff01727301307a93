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

use raft_engine_common::{PeerId, RaftClientReply, RaftClientRequest, RaftPeer, Result};

/// An abstraction for the rpc layer carrying client requests to raft
/// peers.
///
/// `Ok(None)` means the request got no reply before the transport's
/// deadline; the client treats it as transient and retries. Protocol
/// failures the serving peer reported come back as `Err`.
#[async_trait::async_trait]
pub trait RaftClientRpc: Send + Sync {
    async fn send_request(&self, request: RaftClientRequest) -> Result<Option<RaftClientReply>>;

    /// Makes the transport aware of peers it may be asked to reach.
    fn add_peers(&self, peers: &[RaftPeer]);

    /// A request to `peer` failed with `err`; `change_leader` tells
    /// whether the client moved its leader hint away from that peer.
    fn handle_exception(&self, peer: &PeerId, err: &raft_engine_common::Error, change_leader: bool);

    fn close(&self);
}
