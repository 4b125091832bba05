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
use arrow::array::ArrayRef;

use crate::exec::chunk::Chunk;
use crate::exec::hash_table::bucket::HtData;
use crate::exec::hash_table::key_builder::{
    EncodedRow, HASH_SEEDS, KeyRow, MAX_PARTITION_DEPTH, encode_key_rows, hash_row,
};

/// Materializes the encoded key row behind an `HtData` payload. Implemented
/// by the caller's build-row store (pinned rows) or spill stream (flat
/// rows); the table itself never owns row storage.
pub trait KeyRowSource {
    fn key_row(&self, data: HtData) -> Result<KeyRow<'_>, String>;
}

/// In-memory build-row store keyed by `HtData::Tuple` index. Backs builds
/// that keep the whole build side pinned.
#[derive(Debug, Default)]
pub struct TupleRowStore {
    rows: Vec<EncodedRow>,
}

impl TupleRowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, bytes: &[u8], has_null: bool) -> HtData {
        let idx = self.rows.len() as u64;
        self.rows.push(EncodedRow {
            bytes: bytes.to_vec(),
            has_null,
        });
        HtData::Tuple(idx)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl KeyRowSource for TupleRowStore {
    fn key_row(&self, data: HtData) -> Result<KeyRow<'_>, String> {
        let HtData::Tuple(idx) = data else {
            return Err("tuple row store cannot materialize flat rows".to_string());
        };
        let row = self
            .rows
            .get(idx as usize)
            .ok_or_else(|| format!("tuple row {} out of range (len={})", idx, self.rows.len()))?;
        Ok(KeyRow {
            bytes: &row.bytes,
            has_null: row.has_null,
        })
    }
}

/// Per-batch cache of encoded key rows and their hashes, with a cursor over
/// the current row. Refilled by `eval_and_hash_build`/`eval_and_hash_probe`.
#[derive(Debug, Default)]
struct ExprValuesCache {
    rows: Vec<EncodedRow>,
    hashes: Vec<u32>,
    cur_row: usize,
}

/// Evaluation context shared by all probes and inserts against one table
/// chain: key column sets, null modes, repartitioning level, and probe
/// statistics.
pub struct HashTableCtx {
    build_key_cols: Vec<usize>,
    probe_key_cols: Vec<usize>,
    /// Rows with a NULL key are stored at all (e.g. NULL-aware joins,
    /// grouping aggregations).
    stores_nulls: bool,
    /// A probe row with a NULL key may match stored NULLs.
    finds_nulls: bool,
    level: usize,
    cache: ExprValuesCache,
    num_probes: i64,
    num_hash_collisions: i64,
    travel_length: i64,
}

impl HashTableCtx {
    pub fn new(
        build_key_cols: Vec<usize>,
        probe_key_cols: Vec<usize>,
        stores_nulls: bool,
        finds_nulls: bool,
    ) -> Result<Self, String> {
        if build_key_cols.is_empty() {
            return Err("hash table requires at least one key column".to_string());
        }
        if build_key_cols.len() != probe_key_cols.len() {
            return Err(format!(
                "build/probe key column count mismatch: build={} probe={}",
                build_key_cols.len(),
                probe_key_cols.len()
            ));
        }
        Ok(Self {
            build_key_cols,
            probe_key_cols,
            stores_nulls,
            finds_nulls,
            level: 0,
            cache: ExprValuesCache::default(),
            num_probes: 0,
            num_hash_collisions: 0,
            travel_length: 0,
        })
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn set_level(&mut self, level: usize) -> Result<(), String> {
        if level >= MAX_PARTITION_DEPTH {
            return Err(format!(
                "partition level {} exceeds maximum depth {}",
                level, MAX_PARTITION_DEPTH
            ));
        }
        self.level = level;
        Ok(())
    }

    pub fn stores_nulls(&self) -> bool {
        self.stores_nulls
    }

    fn key_arrays(&self, chunk: &Chunk, cols: &[usize]) -> Result<Vec<ArrayRef>, String> {
        cols.iter()
            .map(|idx| chunk.column(*idx).cloned())
            .collect()
    }

    fn eval_and_hash(&mut self, chunk: &Chunk, build: bool) -> Result<(), String> {
        let cols = if build {
            &self.build_key_cols
        } else {
            &self.probe_key_cols
        };
        let arrays = self.key_arrays(chunk, cols)?;
        let rows = encode_key_rows(&arrays, chunk.len())?;
        let seed = HASH_SEEDS[self.level];
        self.cache.hashes = rows.iter().map(|row| hash_row(seed, &row.bytes)).collect();
        self.cache.rows = rows;
        self.cache.cur_row = 0;
        Ok(())
    }

    /// Evaluate and hash the build key columns of `chunk` into the cache.
    pub fn eval_and_hash_build(&mut self, chunk: &Chunk) -> Result<(), String> {
        self.eval_and_hash(chunk, true)
    }

    /// Evaluate and hash the probe key columns of `chunk` into the cache.
    pub fn eval_and_hash_probe(&mut self, chunk: &Chunk) -> Result<(), String> {
        self.eval_and_hash(chunk, false)
    }

    /// Whether the cached build row at `row` should be inserted at all.
    pub fn build_row_valid(&self, row: usize) -> bool {
        self.stores_nulls || !self.cache.rows[row].has_null
    }

    /// Whether probing for the cached row at `row` can ever find a match.
    pub fn probe_row_valid(&self, row: usize) -> bool {
        !self.cache.rows[row].has_null || (self.stores_nulls && self.finds_nulls)
    }

    pub fn num_cached_rows(&self) -> usize {
        self.cache.rows.len()
    }

    pub fn set_cur_row(&mut self, row: usize) {
        debug_assert!(row < self.cache.rows.len());
        self.cache.cur_row = row;
    }

    pub fn cur_row(&self) -> usize {
        self.cache.cur_row
    }

    pub fn cur_hash(&self) -> u32 {
        self.cache.hashes[self.cache.cur_row]
    }

    pub fn cur_key(&self) -> KeyRow<'_> {
        let row = &self.cache.rows[self.cache.cur_row];
        KeyRow {
            bytes: &row.bytes,
            has_null: row.has_null,
        }
    }

    /// Compare the current cached row against a candidate key row.
    /// `INCLUSIVE_EQUALITY` makes NULL == NULL.
    pub fn equals<const INCLUSIVE_EQUALITY: bool>(&self, candidate: &KeyRow<'_>) -> bool {
        let cur = &self.cache.rows[self.cache.cur_row];
        if !INCLUSIVE_EQUALITY && (cur.has_null || candidate.has_null) {
            return false;
        }
        cur.bytes == candidate.bytes
    }

    pub(crate) fn count_probe(&mut self) {
        self.num_probes += 1;
    }

    pub(crate) fn count_hash_collision(&mut self) {
        self.num_hash_collisions += 1;
    }

    pub(crate) fn add_travel_length(&mut self, steps: i64) {
        self.travel_length += steps;
    }

    pub fn num_probes(&self) -> i64 {
        self.num_probes
    }

    pub fn num_hash_collisions(&self) -> i64 {
        self.num_hash_collisions
    }

    pub fn travel_length(&self) -> i64 {
        self.travel_length
    }
}
