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

/// Identifier of a single raft peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_owned())
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a raft group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupId(String);

impl GroupId {
    pub fn new(id: impl Into<String>) -> Self {
        GroupId(id.into())
    }
}

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A peer and the address clients reach it at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaftPeer {
    pub id: PeerId,
    pub address: String,
}

impl RaftPeer {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        RaftPeer {
            id: PeerId::new(id),
            address: address.into(),
        }
    }
}

/// A raft group descriptor: the group id plus its member peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaftGroup {
    pub id: GroupId,
    pub peers: Vec<RaftPeer>,
}

impl RaftGroup {
    pub fn new(id: GroupId, peers: Vec<RaftPeer>) -> Self {
        RaftGroup { id, peers }
    }
}

/// Identifier of a client process. Random so that two processes never
/// collide in the server side retry cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u128);

impl ClientId {
    pub fn random() -> Self {
        ClientId(rand::random())
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client-{:032x}", self.0)
    }
}
