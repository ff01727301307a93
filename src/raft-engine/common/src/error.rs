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

use thiserror::Error;

use crate::{GroupId, PeerId, RaftPeer};

/// Protocol level errors a raft service reports to its clients.
///
/// Transient errors are absorbed by the client retry loop; terminal
/// errors complete the caller's future.
#[derive(Error, Debug)]
pub enum Error {
    /// The contacted peer is not the leader. Carries the peer list the
    /// replier knows about and, when it has one, a leader hint.
    #[error("peer is not the leader")]
    NotLeader {
        peers: Vec<RaftPeer>,
        suggested_leader: Option<PeerId>,
    },

    /// The leader has not yet caught up enough to serve requests.
    #[error("leader is not ready")]
    LeaderNotReady,

    /// The request was addressed to the wrong raft group. Terminal.
    #[error("request targets group {0}, which this peer does not serve")]
    GroupMismatch(GroupId),

    /// The state machine rejected the request. Terminal, surfaced to
    /// the caller unchanged.
    #[error("state machine: {0}")]
    StateMachine(String),

    /// A transport failure; treated as transient by the client.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Terminal errors complete the caller's future instead of being
    /// retried.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::GroupMismatch(_) | Error::StateMachine(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
