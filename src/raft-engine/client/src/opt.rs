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

use std::time::Duration;

pub const RETRY_INTERVAL: Duration = Duration::from_millis(300);
pub const MAX_OUTSTANDING_REQUESTS: usize = 100;

/// The option structure of the raft client.
#[derive(Debug, Clone)]
pub struct ClientOption {
    /// How long to wait before re-sending a request that got no reply.
    ///
    /// DEFAULT: [`RETRY_INTERVAL`].
    pub retry_interval: Duration,

    /// The maximum number of async requests in flight at once; further
    /// submissions wait for a permit.
    ///
    /// DEFAULT: [`MAX_OUTSTANDING_REQUESTS`].
    pub max_outstanding_requests: usize,
}

impl Default for ClientOption {
    fn default() -> Self {
        ClientOption {
            retry_interval: RETRY_INTERVAL,
            max_outstanding_requests: MAX_OUTSTANDING_REQUESTS,
        }
    }
}
