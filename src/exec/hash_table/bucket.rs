// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Bucket and duplicate-node layout for the probing hash table.
//!
//! A bucket is a small tagged record: empty, filled with one payload, or
//! filled with a chain of duplicate nodes. Duplicate nodes live in page
//! pools owned by the table and are addressed by u32 index; the matched bit
//! of a node is packed into the high bit of its next-index word.

/// Payload stored for one build row. Either a pinned in-memory row or an
/// opaque handle into a spillable row stream; the table never dereferences
/// it, the caller's row source does.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum HtData {
    Tuple(u64),
    FlatRow(u64),
}

/// Sentinel for "no duplicate node".
pub const NODE_NONE: u32 = 0x7fff_ffff;

const MATCHED_BIT: u32 = 0x8000_0000;
const NEXT_MASK: u32 = 0x7fff_ffff;

/// One entry of a bucket's duplicate chain.
#[derive(Copy, Clone, Debug)]
pub struct DuplicateNode {
    pub htdata: HtData,
    next_and_matched: u32,
}

impl DuplicateNode {
    /// A new unmatched node pointing at `next`.
    pub fn new_unmatched(htdata: HtData, next: u32) -> Self {
        debug_assert!(next <= NODE_NONE);
        Self {
            htdata,
            next_and_matched: next,
        }
    }

    pub fn next(&self) -> Option<u32> {
        let next = self.next_and_matched & NEXT_MASK;
        (next != NODE_NONE).then_some(next)
    }

    pub fn is_matched(&self) -> bool {
        self.next_and_matched & MATCHED_BIT != 0
    }

    pub fn set_matched(&mut self) {
        self.next_and_matched |= MATCHED_BIT;
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum BucketPayload {
    Empty,
    Data(HtData),
    /// Head of this bucket's duplicate chain. Once a bucket has duplicates
    /// the chain holds every payload; the bucket itself only points at it.
    Duplicates(u32),
}

/// Payload view of a filled bucket, returned by probes so callers can reuse
/// it without re-reading the bucket.
#[derive(Copy, Clone, Debug)]
pub enum BucketData {
    Data(HtData),
    Duplicates(u32),
}

#[derive(Copy, Clone, Debug)]
pub struct Bucket {
    matched: bool,
    payload: BucketPayload,
}

impl Bucket {
    pub fn empty() -> Self {
        Self {
            matched: false,
            payload: BucketPayload::Empty,
        }
    }

    pub fn is_filled(&self) -> bool {
        self.payload != BucketPayload::Empty
    }

    pub fn has_duplicates(&self) -> bool {
        matches!(self.payload, BucketPayload::Duplicates(_))
    }

    pub fn is_matched(&self) -> bool {
        self.matched
    }

    pub fn set_matched(&mut self) {
        // The matched bit is meaningless (and must stay clear) on an empty
        // bucket.
        debug_assert!(self.is_filled());
        self.matched = true;
    }

    /// Claim an empty bucket with a single payload.
    pub fn set_data(&mut self, data: HtData) {
        debug_assert!(!self.is_filled());
        debug_assert!(!self.matched);
        self.payload = BucketPayload::Data(data);
    }

    /// Point the bucket at (a new head of) its duplicate chain.
    pub fn set_duplicates_head(&mut self, node: u32) {
        debug_assert!(node < NODE_NONE);
        self.payload = BucketPayload::Duplicates(node);
    }

    pub fn data(&self) -> Option<HtData> {
        match self.payload {
            BucketPayload::Data(data) => Some(data),
            _ => None,
        }
    }

    pub fn duplicates_head(&self) -> Option<u32> {
        match self.payload {
            BucketPayload::Duplicates(head) => Some(head),
            _ => None,
        }
    }

    pub fn bucket_data(&self) -> Option<BucketData> {
        match self.payload {
            BucketPayload::Empty => None,
            BucketPayload::Data(data) => Some(BucketData::Data(data)),
            BucketPayload::Duplicates(head) => Some(BucketData::Duplicates(head)),
        }
    }
}
