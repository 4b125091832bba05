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
//! Topic model of the out-of-process statestore.
//!
//! Only the subscriber contract lives here: the gossip transport delivers
//! topic deltas through a registered callback and collects outbound updates
//! from the same call. Everything else about the statestore is someone
//! else's problem.

use std::collections::HashMap;

/// Topic carrying backend descriptors for cluster membership.
pub const MEMBERSHIP_TOPIC: &str = "antler-membership";

#[derive(Clone, Debug, Default)]
pub struct TopicItem {
    pub key: String,
    /// Serialized payload, decoded by an injected codec.
    pub value: Vec<u8>,
    pub deleted: bool,
}

#[derive(Clone, Debug, Default)]
pub struct TopicDelta {
    pub topic_name: String,
    /// False means a full topic transmit: the receiver must rebuild its
    /// state from scratch.
    pub is_delta: bool,
    pub topic_entries: Vec<TopicItem>,
}

pub type TopicDeltaMap = HashMap<String, TopicDelta>;

/// Callback invoked by the transport with incoming deltas; outbound updates
/// appended to the second argument are transmitted back to the statestore.
pub type UpdateCallback = Box<dyn Fn(&TopicDeltaMap, &mut Vec<TopicDelta>) + Send + Sync>;

/// The slice of the statestore subscriber the membership manager relies on.
pub trait StatestoreSubscriber: Send + Sync {
    fn add_topic(
        &self,
        topic_name: &str,
        is_transient: bool,
        callback: UpdateCallback,
    ) -> Result<(), String>;

    /// True while the statestore has reconnected but its post-recovery
    /// grace period has not yet elapsed; snapshots built during this window
    /// must not be published.
    fn is_in_post_recovery_grace_period(&self) -> bool;
}
