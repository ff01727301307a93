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

use prost::Message;

/// A `(term, index)` pair locating one position in the replicated log.
///
/// Within a log, `index` is strictly increasing and `term` is
/// monotonically non-decreasing.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TermIndex {
    pub term: u64,
    pub index: u64,
}

impl TermIndex {
    pub fn new(term: u64, index: u64) -> Self {
        TermIndex { term, index }
    }
}

impl std::fmt::Display for TermIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(t:{}, i:{})", self.term, self.index)
    }
}

/// The minimum unit of the replicated log. The payload is opaque to the
/// log itself; only the state machine interprets it.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LogEntry {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    #[prost(uint64, tag = "2")]
    pub index: u64,
    #[prost(bytes = "vec", tag = "3")]
    pub payload: Vec<u8>,
}

impl LogEntry {
    pub fn new(term: u64, index: u64, payload: Vec<u8>) -> Self {
        LogEntry {
            term,
            index,
            payload,
        }
    }

    #[inline(always)]
    pub fn term_index(&self) -> TermIndex {
        TermIndex::new(self.term, self.index)
    }

    /// The serialized size of this entry, used by size-based segment
    /// rolling decisions.
    #[inline(always)]
    pub fn encoded_size(&self) -> usize {
        self.encoded_len()
    }
}
