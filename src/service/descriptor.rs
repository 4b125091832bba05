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
use serde::{Deserialize, Serialize};

use crate::common::types::NetworkAddress;

/// Executor-group membership carried inside a backend descriptor.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExecutorGroupDesc {
    pub name: String,
    pub min_size: i64,
}

/// Everything a backend announces about itself over the membership topic.
///
/// `id` is globally unique. `ip_address` is resolved by the backend that
/// owns the descriptor and transmitted with it; descriptors with an empty
/// IP are malformed and dropped on receipt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackendDescriptor {
    pub id: String,
    pub address: NetworkAddress,
    pub ip_address: String,
    #[serde(default)]
    pub is_coordinator: bool,
    #[serde(default)]
    pub is_executor: bool,
    #[serde(default)]
    pub is_quiescing: bool,
    #[serde(default)]
    pub executor_groups: Vec<ExecutorGroupDesc>,
}

/// Wire codec for backend descriptors. The transport hands the manager
/// opaque bytes; the codec is injected so the membership logic stays
/// independent of the serialization in use.
pub trait DescriptorCodec: Send + Sync {
    fn encode(&self, desc: &BackendDescriptor) -> Result<Vec<u8>, String>;
    fn decode(&self, bytes: &[u8]) -> Result<BackendDescriptor, String>;
}

/// JSON rendering of descriptors.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonDescriptorCodec;

impl DescriptorCodec for JsonDescriptorCodec {
    fn encode(&self, desc: &BackendDescriptor) -> Result<Vec<u8>, String> {
        serde_json::to_vec(desc).map_err(|e| format!("encode backend descriptor: {}", e))
    }

    fn decode(&self, bytes: &[u8]) -> Result<BackendDescriptor, String> {
        serde_json::from_slice(bytes).map_err(|e| format!("decode backend descriptor: {}", e))
    }
}
