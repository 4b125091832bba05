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
pub mod bucket;
pub mod ctx;
pub mod key_builder;
pub mod table;

pub use bucket::{BucketData, DuplicateNode, HtData, NODE_NONE};
pub use ctx::{HashTableCtx, KeyRowSource, TupleRowStore};
pub use key_builder::{EncodedRow, HASH_SEEDS, KeyRow, MAX_PARTITION_DEPTH};
pub use table::{BUCKET_NOT_FOUND, HashTable, HtIterator, MAX_FILL_FACTOR, ProbeResult};
