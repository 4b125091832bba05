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
//! Open-addressed probing hash table used as the build side of hash joins
//! and aggregations.
//!
//! Three parallel structures of length `num_buckets` (a power of two): the
//! bucket array, a dense u32 hash array, and the probe sequence implied by
//! the hash. Probing compares the stored 32-bit hash before touching any
//! bucket payload, so misses rarely chase a pointer. Duplicate rows hang off
//! their bucket as a LIFO chain of nodes carved from page pools.
//!
//! Single-threaded per instance; no locks anywhere.

use std::sync::Arc;

use crate::exec::hash_table::bucket::{Bucket, BucketData, DuplicateNode, HtData, NODE_NONE};
use crate::exec::hash_table::ctx::{HashTableCtx, KeyRowSource};
use crate::runtime::mem_tracker::MemTracker;

/// Resize is triggered once the table is three-quarters full. Quadratic
/// probing degrades sharply past this point.
pub const MAX_FILL_FACTOR: f64 = 0.75;

pub const BUCKET_NOT_FOUND: i64 = -1;

/// Nodes per pool page. One page is a few tens of KiB, so per-insert
/// allocation cost stays amortized.
const DUPLICATE_NODES_PER_PAGE: usize = 1024;

/// Outcome of a single probe: the bucket index (or `BUCKET_NOT_FOUND` after
/// `num_buckets` steps), whether the row matched, and the payload of the
/// final bucket for reuse by the caller.
#[derive(Copy, Clone, Debug)]
pub struct ProbeResult {
    pub bucket_idx: i64,
    pub found: bool,
    pub data: Option<BucketData>,
}

/// Position of one entry: a bucket index plus, for buckets with duplicates,
/// the current node. Iterators hold no reference to the table; all movement
/// goes through table methods.
#[derive(Copy, Clone, Debug)]
pub struct HtIterator {
    bucket_idx: i64,
    node: u32,
}

impl HtIterator {
    pub fn at_end(&self) -> bool {
        self.bucket_idx == BUCKET_NOT_FOUND
    }

    pub fn bucket_idx(&self) -> i64 {
        self.bucket_idx
    }
}

pub struct HashTable {
    quadratic_probing: bool,
    stores_duplicates: bool,
    buckets: Vec<Bucket>,
    /// Parallel to `buckets`, deliberately a separate dense allocation so
    /// the compare loop scans a contiguous u32 stream.
    hash_array: Vec<u32>,
    num_buckets: i64,
    num_filled_buckets: i64,
    num_buckets_with_duplicates: i64,
    num_duplicate_nodes: i64,
    num_resizes: i64,
    node_pages: Vec<Vec<DuplicateNode>>,
    node_remaining_current_page: usize,
    /// Set once any entry is marked matched. Spilling a partially matched
    /// table would lose match state, so callers must check this.
    has_matches: bool,
    mem_tracker: Option<Arc<MemTracker>>,
    accounted_bytes: i64,
}

impl HashTable {
    pub fn new(
        quadratic_probing: bool,
        stores_duplicates: bool,
        num_buckets: i64,
    ) -> Result<Self, String> {
        if num_buckets <= 0 || num_buckets & (num_buckets - 1) != 0 {
            return Err(format!(
                "hash table bucket count must be a positive power of two, got {}",
                num_buckets
            ));
        }
        Ok(Self {
            quadratic_probing,
            stores_duplicates,
            buckets: vec![Bucket::empty(); num_buckets as usize],
            hash_array: vec![0; num_buckets as usize],
            num_buckets,
            num_filled_buckets: 0,
            num_buckets_with_duplicates: 0,
            num_duplicate_nodes: 0,
            num_resizes: 0,
            node_pages: Vec::new(),
            node_remaining_current_page: 0,
            has_matches: false,
            mem_tracker: None,
            accounted_bytes: 0,
        })
    }

    pub fn set_mem_tracker(&mut self, tracker: Arc<MemTracker>) -> Result<(), String> {
        let bytes = self.bucket_arrays_bytes(self.num_buckets) + self.node_pages_bytes();
        if !tracker.try_consume(bytes) {
            return Err(oom_message("hash table arrays", bytes, &tracker));
        }
        if let Some(old) = self.mem_tracker.take() {
            old.release(self.accounted_bytes);
        }
        self.accounted_bytes = bytes;
        self.mem_tracker = Some(tracker);
        Ok(())
    }

    fn bucket_arrays_bytes(&self, num_buckets: i64) -> i64 {
        num_buckets * (std::mem::size_of::<Bucket>() + std::mem::size_of::<u32>()) as i64
    }

    fn node_pages_bytes(&self) -> i64 {
        (self.node_pages.len() * DUPLICATE_NODES_PER_PAGE * std::mem::size_of::<DuplicateNode>())
            as i64
    }

    /// Find the bucket for `hash`, starting at `hash & (num_buckets - 1)`
    /// and stepping quadratically or linearly. Returns the first empty
    /// bucket (`found == false`), the matching filled bucket
    /// (`found == true` when `COMPARE_ROW`), or `BUCKET_NOT_FOUND` after
    /// `num_buckets` steps.
    fn probe<const INCLUSIVE_EQUALITY: bool, const COMPARE_ROW: bool>(
        &self,
        ctx: &mut HashTableCtx,
        source: &dyn KeyRowSource,
        hash: u32,
    ) -> Result<ProbeResult, String> {
        ctx.count_probe();
        let mask = self.num_buckets - 1;
        let mut bucket_idx = hash as i64 & mask;
        let mut step = 0i64;
        loop {
            let bucket = &self.buckets[bucket_idx as usize];
            if !bucket.is_filled() {
                return Ok(ProbeResult {
                    bucket_idx,
                    found: false,
                    data: None,
                });
            }
            if hash == self.hash_array[bucket_idx as usize] {
                if COMPARE_ROW {
                    let data = bucket.bucket_data();
                    let candidate = match data {
                        Some(BucketData::Duplicates(head)) => self.node(head)?.htdata,
                        Some(BucketData::Data(d)) => d,
                        None => return Err("filled bucket without payload".to_string()),
                    };
                    let key = source.key_row(candidate)?;
                    if ctx.equals::<INCLUSIVE_EQUALITY>(&key) {
                        return Ok(ProbeResult {
                            bucket_idx,
                            found: true,
                            data,
                        });
                    }
                }
                // Row equality failed, or not performed. This is a hash
                // collision. Continue searching.
                ctx.count_hash_collision();
            }
            step += 1;
            if self.quadratic_probing {
                // The i-th probe location is (hash + step * (step + 1) / 2)
                // mod num_buckets, which visits all num_buckets positions
                // when num_buckets is a power of two.
                bucket_idx = (bucket_idx + step) & mask;
            } else {
                bucket_idx = (bucket_idx + 1) & mask;
            }
            if step >= self.num_buckets {
                break;
            }
        }
        ctx.add_travel_length(step);
        Ok(ProbeResult {
            bucket_idx: BUCKET_NOT_FOUND,
            found: false,
            data: None,
        })
    }

    /// Insert the payload for the context's current row. Equal keys chain
    /// as duplicates; the chain is LIFO.
    pub fn insert(
        &mut self,
        ctx: &mut HashTableCtx,
        source: &dyn KeyRowSource,
        data: HtData,
    ) -> Result<(), String> {
        let hash = ctx.cur_hash();
        let probe = self.probe::<true, true>(ctx, source, hash)?;
        if probe.bucket_idx == BUCKET_NOT_FOUND {
            return Err("hash table has no free bucket; resize required".to_string());
        }
        if probe.found {
            debug_assert!(self.stores_duplicates);
            if !self.stores_duplicates {
                return Err(
                    "duplicate key inserted into table without duplicate support".to_string(),
                );
            }
            self.insert_duplicate_node(probe.bucket_idx as usize, data)?;
        } else {
            self.prepare_bucket_for_insert(probe.bucket_idx as usize, hash, data);
        }
        Ok(())
    }

    fn prepare_bucket_for_insert(&mut self, bucket_idx: usize, hash: u32, data: HtData) {
        self.buckets[bucket_idx].set_data(data);
        self.hash_array[bucket_idx] = hash;
        self.num_filled_buckets += 1;
    }

    fn insert_duplicate_node(&mut self, bucket_idx: usize, data: HtData) -> Result<(), String> {
        let has_duplicates = self.buckets[bucket_idx].has_duplicates();
        // One node for the new data and one for the preexisting bucket
        // payload, if this is the bucket's first duplicate.
        let needed = if has_duplicates { 1 } else { 2 };
        while self.node_remaining_current_page < needed {
            self.grow_node_array()?;
        }
        if !has_duplicates {
            let old_data = self.buckets[bucket_idx]
                .data()
                .ok_or_else(|| "filled bucket without payload".to_string())?;
            debug_assert!(!self.buckets[bucket_idx].is_matched());
            let first = self.append_node(DuplicateNode::new_unmatched(old_data, NODE_NONE));
            self.buckets[bucket_idx].set_duplicates_head(first);
            self.num_buckets_with_duplicates += 1;
        }
        let head = self.buckets[bucket_idx]
            .duplicates_head()
            .ok_or_else(|| "duplicate bucket without chain head".to_string())?;
        let node = self.append_node(DuplicateNode::new_unmatched(data, head));
        self.buckets[bucket_idx].set_duplicates_head(node);
        Ok(())
    }

    fn append_node(&mut self, node: DuplicateNode) -> u32 {
        debug_assert!(self.node_remaining_current_page > 0);
        let page_idx = self.node_pages.len() - 1;
        let page = &mut self.node_pages[page_idx];
        let idx = (page_idx * DUPLICATE_NODES_PER_PAGE + page.len()) as u32;
        page.push(node);
        self.node_remaining_current_page -= 1;
        self.num_duplicate_nodes += 1;
        idx
    }

    fn grow_node_array(&mut self) -> Result<(), String> {
        let bytes = (DUPLICATE_NODES_PER_PAGE * std::mem::size_of::<DuplicateNode>()) as i64;
        if let Some(tracker) = self.mem_tracker.as_ref() {
            if !tracker.try_consume(bytes) {
                return Err(oom_message("duplicate node page", bytes, tracker));
            }
            self.accounted_bytes += bytes;
        }
        self.node_pages.push(Vec::with_capacity(DUPLICATE_NODES_PER_PAGE));
        self.node_remaining_current_page = DUPLICATE_NODES_PER_PAGE;
        Ok(())
    }

    fn node(&self, idx: u32) -> Result<&DuplicateNode, String> {
        self.node_pages
            .get(idx as usize / DUPLICATE_NODES_PER_PAGE)
            .and_then(|page| page.get(idx as usize % DUPLICATE_NODES_PER_PAGE))
            .ok_or_else(|| format!("duplicate node index {} out of range", idx))
    }

    fn node_unchecked(&self, idx: u32) -> &DuplicateNode {
        &self.node_pages[idx as usize / DUPLICATE_NODES_PER_PAGE]
            [idx as usize % DUPLICATE_NODES_PER_PAGE]
    }

    fn node_mut(&mut self, idx: u32) -> &mut DuplicateNode {
        &mut self.node_pages[idx as usize / DUPLICATE_NODES_PER_PAGE]
            [idx as usize % DUPLICATE_NODES_PER_PAGE]
    }

    /// Probe for the context's current row with non-inclusive equality.
    /// On a hit the iterator is positioned on the first entry of the key.
    pub fn find_probe_row(
        &self,
        ctx: &mut HashTableCtx,
        source: &dyn KeyRowSource,
    ) -> Result<Option<HtIterator>, String> {
        let hash = ctx.cur_hash();
        let probe = self.probe::<false, true>(ctx, source, hash)?;
        if !probe.found {
            return Ok(None);
        }
        let node = match probe.data {
            Some(BucketData::Duplicates(head)) if self.stores_duplicates => head,
            _ => NODE_NONE,
        };
        Ok(Some(HtIterator {
            bucket_idx: probe.bucket_idx,
            node,
        }))
    }

    /// Probe with inclusive equality, as used when combining aggregation
    /// states: NULL keys group together.
    pub fn find_build_row_bucket(
        &self,
        ctx: &mut HashTableCtx,
        source: &dyn KeyRowSource,
    ) -> Result<(HtIterator, bool), String> {
        let hash = ctx.cur_hash();
        let probe = self.probe::<true, true>(ctx, source, hash)?;
        let node = match probe.data {
            Some(BucketData::Duplicates(head))
                if self.stores_duplicates && probe.bucket_idx != BUCKET_NOT_FOUND =>
            {
                head
            }
            _ => NODE_NONE,
        };
        Ok((
            HtIterator {
                bucket_idx: probe.bucket_idx,
                node,
            },
            probe.found,
        ))
    }

    /// Advance `bucket_idx` to the next filled bucket, positioning `node`
    /// at the head of its duplicate chain if it has one.
    pub fn next_filled_bucket(&self, bucket_idx: &mut i64, node: &mut u32) {
        *bucket_idx += 1;
        while *bucket_idx < self.num_buckets {
            let bucket = &self.buckets[*bucket_idx as usize];
            if bucket.is_filled() {
                *node = if self.stores_duplicates {
                    bucket.duplicates_head().unwrap_or(NODE_NONE)
                } else {
                    NODE_NONE
                };
                return;
            }
            *bucket_idx += 1;
        }
        *bucket_idx = BUCKET_NOT_FOUND;
        *node = NODE_NONE;
    }

    /// Iterator over every entry, buckets in index order, duplicate chains
    /// head first.
    pub fn begin(&self) -> HtIterator {
        let mut bucket_idx = -1i64;
        let mut node = NODE_NONE;
        self.next_filled_bucket(&mut bucket_idx, &mut node);
        HtIterator { bucket_idx, node }
    }

    /// Advance over all entries, descending into duplicate chains.
    pub fn next(&self, it: &mut HtIterator) {
        debug_assert!(!it.at_end());
        if it.at_end() {
            return;
        }
        let bucket = &self.buckets[it.bucket_idx as usize];
        if self.stores_duplicates && bucket.has_duplicates() && it.node != NODE_NONE {
            if let Some(next) = self.node_unchecked(it.node).next() {
                it.node = next;
                return;
            }
        }
        self.next_filled_bucket(&mut it.bucket_idx, &mut it.node);
    }

    /// Advance within the current duplicate chain only; ends the iterator
    /// when the chain (or a duplicate-free bucket) is exhausted.
    pub fn next_duplicate(&self, it: &mut HtIterator) {
        debug_assert!(!it.at_end());
        if it.at_end() {
            return;
        }
        let bucket = &self.buckets[it.bucket_idx as usize];
        if self.stores_duplicates && bucket.has_duplicates() && it.node != NODE_NONE {
            if let Some(next) = self.node_unchecked(it.node).next() {
                it.node = next;
                return;
            }
        }
        it.bucket_idx = BUCKET_NOT_FOUND;
        it.node = NODE_NONE;
    }

    /// Payload at the iterator's position.
    pub fn row_data(&self, it: &HtIterator) -> Option<HtData> {
        if it.at_end() {
            return None;
        }
        let bucket = &self.buckets[it.bucket_idx as usize];
        if self.stores_duplicates && bucket.has_duplicates() {
            (it.node != NODE_NONE).then(|| self.node_unchecked(it.node).htdata)
        } else {
            bucket.data()
        }
    }

    /// Mark the entry for outer-join bookkeeping. Also latches
    /// `has_matches`, which disables spilling this table.
    pub fn set_matched(&mut self, it: &HtIterator) {
        debug_assert!(!it.at_end());
        if it.at_end() {
            return;
        }
        let idx = it.bucket_idx as usize;
        if self.stores_duplicates && self.buckets[idx].has_duplicates() {
            self.node_mut(it.node).set_matched();
        } else {
            self.buckets[idx].set_matched();
        }
        self.has_matches = true;
    }

    pub fn is_matched(&self, it: &HtIterator) -> bool {
        if it.at_end() {
            return false;
        }
        let bucket = &self.buckets[it.bucket_idx as usize];
        if self.stores_duplicates && bucket.has_duplicates() {
            self.node_unchecked(it.node).is_matched()
        } else {
            bucket.is_matched()
        }
    }

    /// First entry never marked matched; used to emit the unmatched build
    /// side after an outer join.
    pub fn first_unmatched(&self) -> HtIterator {
        let mut it = self.begin();
        if it.at_end() {
            return it;
        }
        let bucket = &self.buckets[it.bucket_idx as usize];
        let has_duplicates = self.stores_duplicates && bucket.has_duplicates();
        let matched = if has_duplicates {
            self.node_unchecked(it.node).is_matched()
        } else {
            bucket.is_matched()
        };
        if matched {
            self.next_unmatched(&mut it);
        }
        it
    }

    /// Advance to the next entry whose matched bit is clear, skipping both
    /// matched buckets and matched duplicate nodes.
    pub fn next_unmatched(&self, it: &mut HtIterator) {
        debug_assert!(!it.at_end());
        if it.at_end() {
            return;
        }
        // Check the remaining duplicates of the current bucket first.
        let bucket = &self.buckets[it.bucket_idx as usize];
        if self.stores_duplicates && bucket.has_duplicates() {
            let mut next = self.node_unchecked(it.node).next();
            while let Some(n) = next {
                it.node = n;
                if !self.node_unchecked(n).is_matched() {
                    return;
                }
                next = self.node_unchecked(n).next();
            }
        }
        self.next_filled_bucket(&mut it.bucket_idx, &mut it.node);
        while it.bucket_idx != BUCKET_NOT_FOUND {
            let bucket = &self.buckets[it.bucket_idx as usize];
            if !self.stores_duplicates || !bucket.has_duplicates() {
                if !bucket.is_matched() {
                    return;
                }
            } else {
                loop {
                    if !self.node_unchecked(it.node).is_matched() {
                        return;
                    }
                    match self.node_unchecked(it.node).next() {
                        Some(next) => it.node = next,
                        None => break,
                    }
                }
            }
            self.next_filled_bucket(&mut it.bucket_idx, &mut it.node);
        }
    }

    /// Hint the cache that the bucket and hash slot for `hash` are about to
    /// be touched. Callers pipeline a few future probes behind current work.
    pub fn prefetch_bucket<const READ: bool>(&self, hash: u32) {
        let idx = (hash as i64 & (self.num_buckets - 1)) as usize;
        prefetch_locality1(self.buckets.as_ptr().wrapping_add(idx) as *const u8);
        prefetch_locality1(self.hash_array.as_ptr().wrapping_add(idx) as *const u8);
    }

    /// Rehash into `new_num_buckets` buckets by re-probing stored hashes;
    /// no rows are compared. Duplicate chains move with their buckets.
    pub fn resize_buckets(&mut self, new_num_buckets: i64) -> Result<(), String> {
        if new_num_buckets <= 0 || new_num_buckets & (new_num_buckets - 1) != 0 {
            return Err(format!(
                "hash table bucket count must be a positive power of two, got {}",
                new_num_buckets
            ));
        }
        if (new_num_buckets as f64 * MAX_FILL_FACTOR) < self.num_filled_buckets as f64 {
            return Err(format!(
                "cannot resize to {} buckets with {} filled",
                new_num_buckets, self.num_filled_buckets
            ));
        }
        let new_bytes = self.bucket_arrays_bytes(new_num_buckets);
        let old_bytes = self.bucket_arrays_bytes(self.num_buckets);
        if let Some(tracker) = self.mem_tracker.as_ref() {
            if !tracker.try_consume(new_bytes) {
                return Err(oom_message("hash table resize", new_bytes, tracker));
            }
            tracker.release(old_bytes);
            self.accounted_bytes += new_bytes - old_bytes;
        }

        let mut new_buckets = vec![Bucket::empty(); new_num_buckets as usize];
        let mut new_hashes = vec![0u32; new_num_buckets as usize];
        for idx in 0..self.num_buckets as usize {
            if !self.buckets[idx].is_filled() {
                continue;
            }
            let hash = self.hash_array[idx];
            let new_idx =
                probe_empty(&new_buckets, new_num_buckets, self.quadratic_probing, hash);
            if new_idx == BUCKET_NOT_FOUND {
                return Err("no empty bucket found while resizing".to_string());
            }
            new_buckets[new_idx as usize] = self.buckets[idx];
            new_hashes[new_idx as usize] = hash;
        }
        self.buckets = new_buckets;
        self.hash_array = new_hashes;
        self.num_buckets = new_num_buckets;
        self.num_resizes += 1;
        Ok(())
    }

    pub fn num_inserts_before_resize(&self) -> i64 {
        ((self.num_buckets as f64 * MAX_FILL_FACTOR) as i64 - self.num_filled_buckets).max(0)
    }

    pub fn current_mem_size(&self) -> i64 {
        self.num_buckets * (std::mem::size_of::<Bucket>() + std::mem::size_of::<u32>()) as i64
            + self.num_duplicate_nodes * std::mem::size_of::<DuplicateNode>() as i64
    }

    pub fn num_buckets(&self) -> i64 {
        self.num_buckets
    }

    pub fn num_filled_buckets(&self) -> i64 {
        self.num_filled_buckets
    }

    pub fn num_buckets_with_duplicates(&self) -> i64 {
        self.num_buckets_with_duplicates
    }

    pub fn num_duplicate_nodes(&self) -> i64 {
        self.num_duplicate_nodes
    }

    pub fn num_resizes(&self) -> i64 {
        self.num_resizes
    }

    pub fn has_matches(&self) -> bool {
        self.has_matches
    }

    pub fn quadratic_probing(&self) -> bool {
        self.quadratic_probing
    }

    pub fn stores_duplicates(&self) -> bool {
        self.stores_duplicates
    }

    pub fn bucket_has_duplicates(&self, bucket_idx: i64) -> bool {
        bucket_idx >= 0
            && bucket_idx < self.num_buckets
            && self.buckets[bucket_idx as usize].has_duplicates()
    }
}

impl Drop for HashTable {
    fn drop(&mut self) {
        if let Some(tracker) = self.mem_tracker.take() {
            tracker.release(self.accounted_bytes);
        }
    }
}

fn probe_empty(buckets: &[Bucket], num_buckets: i64, quadratic: bool, hash: u32) -> i64 {
    let mask = num_buckets - 1;
    let mut idx = hash as i64 & mask;
    let mut step = 0i64;
    loop {
        if !buckets[idx as usize].is_filled() {
            return idx;
        }
        step += 1;
        idx = if quadratic {
            (idx + step) & mask
        } else {
            (idx + 1) & mask
        };
        if step >= num_buckets {
            return BUCKET_NOT_FOUND;
        }
    }
}

#[inline(always)]
fn prefetch_locality1(ptr: *const u8) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        use core::arch::x86_64::{_MM_HINT_T2, _mm_prefetch};
        _mm_prefetch(ptr as *const i8, _MM_HINT_T2);
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = ptr;
    }
}

fn oom_message(what: &str, bytes: i64, tracker: &Arc<MemTracker>) -> String {
    format!(
        "memory limit exceeded allocating {} bytes for {}: tracker '{}' current={} limit={}",
        bytes,
        what,
        tracker.label(),
        tracker.current(),
        tracker.limit()
    )
}

#[cfg(test)]
mod tests {
    use super::{HashTable, MAX_FILL_FACTOR};
    use crate::exec::chunk::Chunk;
    use crate::exec::hash_table::ctx::{HashTableCtx, TupleRowStore};
    use arrow::array::{Int64Array, RecordBatch};
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    fn key_chunk(values: Vec<Option<i64>>) -> Chunk {
        let schema = Arc::new(Schema::new(vec![Field::new("k", DataType::Int64, true)]));
        let batch = RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values))])
            .expect("record batch");
        Chunk::new(batch)
    }

    fn build_table(values: Vec<Option<i64>>, num_buckets: i64) -> (HashTable, HashTableCtx, TupleRowStore) {
        let mut table = HashTable::new(true, true, num_buckets).expect("table");
        let mut ctx = HashTableCtx::new(vec![0], vec![0], true, true).expect("ctx");
        let mut store = TupleRowStore::new();
        let chunk = key_chunk(values);
        ctx.eval_and_hash_build(&chunk).expect("eval");
        for row in 0..chunk.len() {
            ctx.set_cur_row(row);
            let key = ctx.cur_key();
            let data = store.append(key.bytes, key.has_null);
            table.insert(&mut ctx, &store, data).expect("insert");
        }
        (table, ctx, store)
    }

    #[test]
    fn rejects_non_power_of_two_bucket_counts() {
        assert!(HashTable::new(true, true, 12).is_err());
        assert!(HashTable::new(true, true, 0).is_err());
        assert!(HashTable::new(true, true, 16).is_ok());
    }

    #[test]
    fn insert_then_find_each_key() {
        let (table, mut ctx, store) = build_table(vec![Some(1), Some(2), Some(3)], 16);
        assert_eq!(table.num_filled_buckets(), 3);
        let chunk = key_chunk(vec![Some(2)]);
        ctx.eval_and_hash_probe(&chunk).expect("eval");
        ctx.set_cur_row(0);
        let it = table
            .find_probe_row(&mut ctx, &store)
            .expect("probe")
            .expect("found");
        assert!(!it.at_end());

        let chunk = key_chunk(vec![Some(9)]);
        ctx.eval_and_hash_probe(&chunk).expect("eval");
        ctx.set_cur_row(0);
        assert!(table.find_probe_row(&mut ctx, &store).expect("probe").is_none());
    }

    #[test]
    fn resize_preserves_entries() {
        let (mut table, mut ctx, store) = build_table((0..10).map(|v| Some(v)).collect(), 16);
        table.resize_buckets(64).expect("resize");
        assert_eq!(table.num_buckets(), 64);
        assert_eq!(table.num_filled_buckets(), 10);
        assert_eq!(table.num_resizes(), 1);
        for key in 0..10i64 {
            let chunk = key_chunk(vec![Some(key)]);
            ctx.eval_and_hash_probe(&chunk).expect("eval");
            ctx.set_cur_row(0);
            assert!(
                table.find_probe_row(&mut ctx, &store).expect("probe").is_some(),
                "key {} lost in resize",
                key
            );
        }
    }

    #[test]
    fn resize_refuses_overfull_target() {
        let (mut table, _ctx, _store) = build_table((0..10).map(|v| Some(v)).collect(), 16);
        assert!(table.resize_buckets(8).is_err());
    }

    #[test]
    fn inserts_before_resize_tracks_fill_factor() {
        let (table, _ctx, _store) = build_table((0..12).map(|v| Some(v)).collect(), 16);
        assert_eq!(table.num_inserts_before_resize(), 0);
        assert!(table.num_filled_buckets() as f64 >= 16.0 * MAX_FILL_FACTOR);
    }
}
