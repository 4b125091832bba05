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
//! Key encoding and hashing for the probing hash table.
//!
//! Key expression values are flattened into one byte row per input row: a
//! flag byte per column (0 = null), then the value in a fixed or
//! length-prefixed little-endian form. Byte equality of two encoded rows is
//! value equality with NULL == NULL, which is exactly the inclusive-equality
//! mode of the table; non-inclusive comparisons consult the null flag
//! carried next to the bytes.

use arrow::array::{
    Array, ArrayRef, BooleanArray, Date32Array, Decimal128Array, Float32Array, Float64Array,
    Int8Array, Int16Array, Int32Array, Int64Array, StringArray,
};
use arrow::datatypes::DataType;

/// One fully encoded key row.
#[derive(Clone, Debug, Default)]
pub struct EncodedRow {
    pub bytes: Vec<u8>,
    pub has_null: bool,
}

/// Borrowed view of an encoded key row, as handed back by a row source.
#[derive(Copy, Clone, Debug)]
pub struct KeyRow<'a> {
    pub bytes: &'a [u8],
    pub has_null: bool,
}

/// Seeds for the 32-bit row hash, one per repartitioning level. Tables at
/// different levels must disagree on bucket placement or repartitioning
/// would not split anything.
pub const HASH_SEEDS: [u32; 8] = [
    0x9747_b28c,
    0x1b87_3593,
    0xdead_beef,
    0xc70f_6907,
    0x5bd1_e995,
    0x52dc_e729,
    0x3858_0929,
    0x16a8_8000,
];

pub const MAX_PARTITION_DEPTH: usize = HASH_SEEDS.len();

pub fn hash_row(seed: u32, bytes: &[u8]) -> u32 {
    crc32c::crc32c_append(seed, bytes)
}

fn canonical_f64_bits(value: f64) -> u64 {
    if value == 0.0 {
        // +0.0 and -0.0 compare equal and must encode identically.
        0
    } else if value.is_nan() {
        f64::NAN.to_bits()
    } else {
        value.to_bits()
    }
}

fn canonical_f32_bits(value: f32) -> u32 {
    if value == 0.0 {
        0
    } else if value.is_nan() {
        f32::NAN.to_bits()
    } else {
        value.to_bits()
    }
}

/// Append one cell to `row`, recording whether it was null.
fn encode_cell(array: &ArrayRef, row_idx: usize, row: &mut EncodedRow) -> Result<(), String> {
    if array.is_null(row_idx) {
        row.bytes.push(0);
        row.has_null = true;
        return Ok(());
    }
    row.bytes.push(1);
    let out = &mut row.bytes;
    match array.data_type() {
        DataType::Boolean => {
            let arr = downcast::<BooleanArray>(array, "Boolean")?;
            out.push(arr.value(row_idx) as u8);
        }
        DataType::Int8 => {
            let arr = downcast::<Int8Array>(array, "Int8")?;
            out.extend_from_slice(&arr.value(row_idx).to_le_bytes());
        }
        DataType::Int16 => {
            let arr = downcast::<Int16Array>(array, "Int16")?;
            out.extend_from_slice(&arr.value(row_idx).to_le_bytes());
        }
        DataType::Int32 => {
            let arr = downcast::<Int32Array>(array, "Int32")?;
            out.extend_from_slice(&arr.value(row_idx).to_le_bytes());
        }
        DataType::Int64 => {
            let arr = downcast::<Int64Array>(array, "Int64")?;
            out.extend_from_slice(&arr.value(row_idx).to_le_bytes());
        }
        DataType::Float32 => {
            let arr = downcast::<Float32Array>(array, "Float32")?;
            out.extend_from_slice(&canonical_f32_bits(arr.value(row_idx)).to_le_bytes());
        }
        DataType::Float64 => {
            let arr = downcast::<Float64Array>(array, "Float64")?;
            out.extend_from_slice(&canonical_f64_bits(arr.value(row_idx)).to_le_bytes());
        }
        DataType::Date32 => {
            let arr = downcast::<Date32Array>(array, "Date32")?;
            out.extend_from_slice(&arr.value(row_idx).to_le_bytes());
        }
        DataType::Decimal128(_, _) => {
            let arr = downcast::<Decimal128Array>(array, "Decimal128")?;
            out.extend_from_slice(&arr.value(row_idx).to_le_bytes());
        }
        DataType::Utf8 => {
            let arr = downcast::<StringArray>(array, "Utf8")?;
            let value = arr.value(row_idx).as_bytes();
            let len = u32::try_from(value.len())
                .map_err(|_| "key string length overflow".to_string())?;
            out.extend_from_slice(&len.to_le_bytes());
            out.extend_from_slice(value);
        }
        other => {
            return Err(format!("unsupported hash table key type {:?}", other));
        }
    }
    Ok(())
}

/// Encode `num_rows` key rows from the given key columns.
pub fn encode_key_rows(arrays: &[ArrayRef], num_rows: usize) -> Result<Vec<EncodedRow>, String> {
    for (idx, array) in arrays.iter().enumerate() {
        if array.len() < num_rows {
            return Err(format!(
                "key column {} shorter than batch: len={} num_rows={}",
                idx,
                array.len(),
                num_rows
            ));
        }
    }
    let mut rows = Vec::with_capacity(num_rows);
    for row_idx in 0..num_rows {
        let mut row = EncodedRow::default();
        for array in arrays {
            encode_cell(array, row_idx, &mut row)?;
        }
        rows.push(row);
    }
    Ok(rows)
}

fn downcast<'a, T: 'static>(array: &'a ArrayRef, expected: &str) -> Result<&'a T, String> {
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| format!("key column type mismatch, expected {}", expected))
}
