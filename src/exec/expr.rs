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
//! Row-evaluator seam between the execution fragment and client-facing
//! result buffers.
//!
//! The result sink does not interpret rows itself; it hands each delivered
//! range to its output evaluators, one per result column. Scratch memory for
//! evaluation comes from an `ExprResultPool` that the sink clears between
//! slot hand-offs so transient allocation stays bounded.

use std::io::Write;

use arrow::array::{
    Array, BooleanArray, Date32Array, Float32Array, Float64Array, Int8Array, Int16Array,
    Int32Array, Int64Array, StringArray,
};
use arrow::datatypes::DataType;
use chrono::NaiveDate;

use crate::exec::chunk::Chunk;

/// Pool of reusable scratch buffers for expression evaluation.
///
/// Buffers handed out by `alloc` are recycled back after their contents have
/// been copied into a result row; `clear` drops all retained capacity.
#[derive(Debug, Default)]
pub struct ExprResultPool {
    free: Vec<Vec<u8>>,
    total_allocs: usize,
}

impl ExprResultPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self) -> Vec<u8> {
        self.total_allocs += 1;
        match self.free.pop() {
            Some(mut buf) => {
                buf.clear();
                buf
            }
            None => Vec::new(),
        }
    }

    pub fn recycle(&mut self, buf: Vec<u8>) {
        self.free.push(buf);
    }

    pub fn clear(&mut self) {
        self.free.clear();
        self.total_allocs = 0;
    }

    pub fn retained_bytes(&self) -> usize {
        self.free.iter().map(|b| b.capacity()).sum()
    }

    pub fn total_allocs(&self) -> usize {
        self.total_allocs
    }
}

/// Serializes one cell of a chunk row into its client representation.
/// `Ok(None)` is a NULL cell.
pub trait RowEvaluator: Send + Sync {
    fn evaluate(
        &self,
        chunk: &Chunk,
        row: usize,
        pool: &mut ExprResultPool,
    ) -> Result<Option<Vec<u8>>, String>;
}

/// Renders the value of one chunk column as client text.
pub struct ColumnValueEvaluator {
    column: usize,
}

impl ColumnValueEvaluator {
    pub fn new(column: usize) -> Self {
        Self { column }
    }
}

impl RowEvaluator for ColumnValueEvaluator {
    fn evaluate(
        &self,
        chunk: &Chunk,
        row: usize,
        pool: &mut ExprResultPool,
    ) -> Result<Option<Vec<u8>>, String> {
        let array = chunk.column(self.column)?;
        if array.is_null(row) {
            return Ok(None);
        }
        let mut out = pool.alloc();
        match array.data_type() {
            DataType::Boolean => {
                let arr = downcast::<BooleanArray>(array, "Boolean")?;
                out.push(if arr.value(row) { b'1' } else { b'0' });
            }
            DataType::Int8 => {
                let arr = downcast::<Int8Array>(array, "Int8")?;
                write_display(&mut out, arr.value(row))?;
            }
            DataType::Int16 => {
                let arr = downcast::<Int16Array>(array, "Int16")?;
                write_display(&mut out, arr.value(row))?;
            }
            DataType::Int32 => {
                let arr = downcast::<Int32Array>(array, "Int32")?;
                write_display(&mut out, arr.value(row))?;
            }
            DataType::Int64 => {
                let arr = downcast::<Int64Array>(array, "Int64")?;
                write_display(&mut out, arr.value(row))?;
            }
            DataType::Float32 => {
                let arr = downcast::<Float32Array>(array, "Float32")?;
                write_display(&mut out, arr.value(row))?;
            }
            DataType::Float64 => {
                let arr = downcast::<Float64Array>(array, "Float64")?;
                write_display(&mut out, arr.value(row))?;
            }
            DataType::Utf8 => {
                let arr = downcast::<StringArray>(array, "Utf8")?;
                out.extend_from_slice(arr.value(row).as_bytes());
            }
            DataType::Date32 => {
                let arr = downcast::<Date32Array>(array, "Date32")?;
                let days = arr.value(row);
                let date = epoch_date()
                    .checked_add_signed(chrono::Duration::days(days as i64))
                    .ok_or_else(|| format!("date32 value out of range: {}", days))?;
                write_display(&mut out, date.format("%Y-%m-%d"))?;
            }
            other => {
                pool.recycle(out);
                return Err(format!(
                    "unsupported result column type {:?} at column {}",
                    other, self.column
                ));
            }
        }
        Ok(Some(out))
    }
}

fn epoch_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).expect("epoch date")
}

fn downcast<'a, T: 'static>(
    array: &'a arrow::array::ArrayRef,
    expected: &str,
) -> Result<&'a T, String> {
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| format!("column type mismatch, expected {}", expected))
}

fn write_display(out: &mut Vec<u8>, value: impl std::fmt::Display) -> Result<(), String> {
    write!(out, "{}", value).map_err(|e| format!("format value: {}", e))
}

#[cfg(test)]
mod tests {
    use super::{ColumnValueEvaluator, ExprResultPool, RowEvaluator};
    use crate::exec::chunk::Chunk;
    use arrow::array::{Int64Array, RecordBatch, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    fn two_column_chunk() -> Chunk {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, true),
            Field::new("name", DataType::Utf8, true),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![Some(7), None])),
                Arc::new(StringArray::from(vec![Some("alpha"), Some("beta")])),
            ],
        )
        .expect("record batch");
        Chunk::new(batch)
    }

    #[test]
    fn renders_int_and_string_cells() {
        let chunk = two_column_chunk();
        let mut pool = ExprResultPool::new();
        let id = ColumnValueEvaluator::new(0);
        let name = ColumnValueEvaluator::new(1);
        assert_eq!(
            id.evaluate(&chunk, 0, &mut pool).expect("eval"),
            Some(b"7".to_vec())
        );
        assert_eq!(
            name.evaluate(&chunk, 1, &mut pool).expect("eval"),
            Some(b"beta".to_vec())
        );
    }

    #[test]
    fn null_cell_evaluates_to_none() {
        let chunk = two_column_chunk();
        let mut pool = ExprResultPool::new();
        let id = ColumnValueEvaluator::new(0);
        assert_eq!(id.evaluate(&chunk, 1, &mut pool).expect("eval"), None);
    }

    #[test]
    fn pool_reuses_recycled_capacity() {
        let mut pool = ExprResultPool::new();
        let mut buf = pool.alloc();
        buf.extend_from_slice(b"0123456789");
        let cap = buf.capacity();
        pool.recycle(buf);
        let reused = pool.alloc();
        assert!(reused.is_empty());
        assert_eq!(reused.capacity(), cap);
        pool.clear();
        assert_eq!(pool.retained_bytes(), 0);
    }
}
