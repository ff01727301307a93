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

use std::{fs::File, io::Error};

pub trait FileExt {
    /// Allow caller to directly allocate disk space for the specified
    /// file; the range not containing data is initialized to zero.
    /// After a successful call, subsequent writes below the file size
    /// are guaranteed not to fail because of lack of disk space.
    fn preallocate(&mut self, len: usize) -> Result<(), Error>;
}

impl FileExt for File {
    fn preallocate(&mut self, len: usize) -> Result<(), Error> {
        #[cfg(target_os = "linux")]
        unsafe {
            use std::os::unix::io::AsRawFd;

            let retval = libc::fallocate(self.as_raw_fd(), 0, 0, len as i64);
            if retval == -1 {
                return Err(std::io::Error::last_os_error());
            }
        }

        #[cfg(not(target_os = "linux"))]
        {
            let _ = len;
        }

        Ok(())
    }
}
