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
use raft_engine_common::LogEntry;

use crate::{Error, Result};

/// Every segment file starts with this fixed magic.
pub(crate) const SEGMENT_HEADER: [u8; 8] = *b"RAFTLOG1";
pub(crate) const SEGMENT_HEADER_SIZE: usize = SEGMENT_HEADER.len();

pub(crate) const CHECKSUM_SIZE: usize = 4;

/// Append one record to `buf`:
/// `<varint payload_len><payload><crc32 of payload, le>`.
pub(crate) fn encode_record(entry: &LogEntry, buf: &mut Vec<u8>) {
    let payload = entry.encode_to_vec();
    prost::encoding::encode_varint(payload.len() as u64, buf);
    let crc32 = crc32fast::hash(&payload);
    buf.extend_from_slice(&payload);
    buf.extend_from_slice(&crc32.to_le_bytes());
}

/// The on disk size of the record encoding `entry`.
pub(crate) fn record_size(entry: &LogEntry) -> usize {
    let payload_len = entry.encoded_len();
    prost::length_delimiter_len(payload_len) + payload_len + CHECKSUM_SIZE
}

/// Scans the records of one segment file image.
///
/// The scanner stops at the first malformed record: a bad varint, a
/// length running past the buffer, a checksum mismatch, or an
/// undecodable payload. Records before the stop point are the
/// recovered suffix; [`valid_offset`] tells how many bytes of the file
/// they cover.
///
/// A zero length prefix also stops the scan: it marks the preallocated
/// tail of an open segment. A real record never encodes to zero bytes
/// because its term is always non zero.
pub(crate) struct RecordScanner<'a> {
    buf: &'a [u8],
    offset: usize,
    corrupt: bool,
}

impl<'a> RecordScanner<'a> {
    pub fn new(buf: &'a [u8]) -> Result<Self> {
        if buf.len() < SEGMENT_HEADER_SIZE || buf[..SEGMENT_HEADER_SIZE] != SEGMENT_HEADER {
            return Err(Error::Corruption("bad segment header".to_string()));
        }
        Ok(RecordScanner {
            buf,
            offset: SEGMENT_HEADER_SIZE,
            corrupt: false,
        })
    }

    /// Bytes covered by the header and every record returned so far.
    #[inline(always)]
    pub fn valid_offset(&self) -> usize {
        self.offset
    }

    /// Whether the scan stopped because of a malformed record rather
    /// than a clean end of data.
    #[inline(always)]
    pub fn hit_corruption(&self) -> bool {
        self.corrupt
    }

    /// Returns the next record and the file position of its payload.
    pub fn next_record(&mut self) -> Option<(LogEntry, u64, u32)> {
        if self.corrupt || self.offset >= self.buf.len() {
            return None;
        }

        let mut slice = &self.buf[self.offset..];
        let payload_len = match prost::decode_length_delimiter(&mut slice) {
            Ok(len) => len,
            Err(_) => {
                self.corrupt = true;
                return None;
            }
        };
        if payload_len == 0 {
            // Preallocated tail.
            return None;
        }
        let delimiter_len = prost::length_delimiter_len(payload_len);

        let payload_offset = self.offset + delimiter_len;
        let record_end = payload_offset + payload_len + CHECKSUM_SIZE;
        if record_end > self.buf.len() {
            self.corrupt = true;
            return None;
        }

        let payload = &self.buf[payload_offset..payload_offset + payload_len];
        let checksum = u32::from_le_bytes(
            self.buf[payload_offset + payload_len..record_end]
                .try_into()
                .unwrap(),
        );
        if crc32fast::hash(payload) != checksum {
            self.corrupt = true;
            return None;
        }

        let entry = match LogEntry::decode(payload) {
            Ok(entry) => entry,
            Err(_) => {
                self.corrupt = true;
                return None;
            }
        };

        self.offset = record_end;
        Some((entry, payload_offset as u64, payload_len as u32))
    }
}
