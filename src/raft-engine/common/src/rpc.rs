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

use crate::{ClientId, GroupId, PeerId, RaftGroup, RaftPeer};

/// What a client request asks the serving peer to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestType {
    /// Replicated write through consensus.
    Write,
    /// Linearizable read through consensus.
    Read,
    /// Read served directly by `server_id`, valid once its applied
    /// index reaches `min_index`.
    StaleRead { min_index: u64 },
    /// Replace the group membership.
    SetConfiguration { peers: Vec<RaftPeer> },
    /// Force the target peer to join a new group.
    Reinitialize { group: RaftGroup },
    /// Query the target peer about itself.
    ServerInformation,
}

/// A request issued by [`ClientId`].
///
/// `call_id` is unique per client process and stable across retries,
/// which is what the server side retry cache keys on. `seq_num` is
/// assigned by the sliding window the request travels through; the
/// direct (non windowed) path uses zero.
#[derive(Debug, Clone)]
pub struct RaftClientRequest {
    pub client_id: ClientId,
    pub server_id: PeerId,
    pub group_id: GroupId,
    pub call_id: u64,
    pub seq_num: u64,
    pub rtype: RequestType,
    pub message: Vec<u8>,
}

impl std::fmt::Display for RaftClientRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}->{} call {} seq {}",
            self.client_id, self.server_id, self.call_id, self.seq_num
        )
    }
}

/// The reply to a [`RaftClientRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaftClientReply {
    pub client_id: ClientId,
    pub server_id: PeerId,
    pub call_id: u64,
    pub success: bool,
    pub message: Vec<u8>,
}
