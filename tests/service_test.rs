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
//! Gossip-driven scenarios against the cluster membership manager.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use antler::common::types::NetworkAddress;
use antler::runtime::profile::RuntimeProfile;
use antler::service::descriptor::{
    BackendDescriptor, DescriptorCodec, ExecutorGroupDesc, JsonDescriptorCodec,
};
use antler::service::membership::{ClusterMembershipMgr, Snapshot};
use antler::service::statestore::{
    MEMBERSHIP_TOPIC, StatestoreSubscriber, TopicDelta, TopicDeltaMap, TopicItem, UpdateCallback,
};

fn executor(id: &str, port: u16, quiescing: bool, groups: &[&str]) -> BackendDescriptor {
    BackendDescriptor {
        id: id.to_string(),
        address: NetworkAddress::new(format!("host-{}", id), port),
        ip_address: format!("10.1.0.{}", port % 250),
        is_coordinator: false,
        is_executor: true,
        is_quiescing: quiescing,
        executor_groups: groups
            .iter()
            .map(|name| ExecutorGroupDesc {
                name: name.to_string(),
                min_size: 1,
            })
            .collect(),
    }
}

fn upsert(codec: &JsonDescriptorCodec, desc: &BackendDescriptor) -> TopicItem {
    TopicItem {
        key: desc.id.clone(),
        value: codec.encode(desc).expect("encode"),
        deleted: false,
    }
}

fn delete(id: &str) -> TopicItem {
    TopicItem {
        key: id.to_string(),
        value: Vec::new(),
        deleted: true,
    }
}

fn deltas(entries: Vec<TopicItem>, is_delta: bool) -> TopicDeltaMap {
    let mut map = HashMap::new();
    map.insert(
        MEMBERSHIP_TOPIC.to_string(),
        TopicDelta {
            topic_name: MEMBERSHIP_TOPIC.to_string(),
            is_delta,
            topic_entries: entries,
        },
    );
    map
}

fn new_mgr(local_id: &str) -> Arc<ClusterMembershipMgr> {
    Arc::new(ClusterMembershipMgr::new(
        local_id,
        None,
        Arc::new(JsonDescriptorCodec),
        Duration::from_millis(50),
        &RuntimeProfile::new("test"),
    ))
}

/// The published-snapshot invariant: every group member appears in
/// `current_backends` with matching flags and is not blacklisted.
fn assert_snapshot_consistent(snapshot: &Snapshot) {
    for (group_name, group) in &snapshot.executor_groups {
        for member in group.get_all_executor_descriptors() {
            assert!(member.is_executor, "group {} member not executor", group_name);
            assert!(!member.is_quiescing, "group {} member quiescing", group_name);
            let current = snapshot
                .current_backends
                .values()
                .find(|be| be.address == member.address)
                .unwrap_or_else(|| panic!("group {} member missing from backends", group_name));
            assert_eq!(current.is_executor, member.is_executor);
            assert_eq!(current.is_quiescing, member.is_quiescing);
            assert!(
                !snapshot.executor_blacklist.is_blacklisted(member),
                "group {} member blacklisted",
                group_name
            );
        }
    }
}

#[test]
fn delta_update_applies_deletes_updates_and_inserts() {
    let codec = JsonDescriptorCodec;
    let mgr = new_mgr("local");
    let mut outbound = Vec::new();

    let a = executor("a", 21000, false, &["g1"]);
    let b = executor("b", 21001, false, &["g1"]);
    mgr.update_membership(&deltas(vec![upsert(&codec, &a), upsert(&codec, &b)], false), &mut outbound);

    let snapshot = mgr.get_snapshot();
    assert_eq!(snapshot.version, 1);
    assert_eq!(snapshot.current_backends.len(), 2);
    assert_eq!(snapshot.executor_groups["g1"].num_executors(), 2);
    assert_snapshot_consistent(&snapshot);

    // Delete a, quiesce b, add c.
    let b_quiescing = executor("b", 21001, true, &["g1"]);
    let c = executor("c", 21002, false, &["g1"]);
    mgr.update_membership(
        &deltas(
            vec![delete("a"), upsert(&codec, &b_quiescing), upsert(&codec, &c)],
            true,
        ),
        &mut outbound,
    );

    let snapshot = mgr.get_snapshot();
    assert_eq!(snapshot.version, 2);
    let mut ids: Vec<&str> = snapshot.current_backends.keys().map(|s| s.as_str()).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec!["b", "c"]);
    assert!(snapshot.current_backends["b"].is_quiescing);
    let g1 = &snapshot.executor_groups["g1"];
    assert_eq!(g1.num_executors(), 1);
    assert!(g1.look_up_backend_desc(&c.address).is_some());
    assert_snapshot_consistent(&snapshot);
}

#[test]
fn blacklist_then_gossip_removal_clears_the_entry() {
    let codec = JsonDescriptorCodec;
    let mgr = new_mgr("local");
    let mut outbound = Vec::new();

    let frontend_calls = Arc::new(AtomicUsize::new(0));
    let server_calls = Arc::new(AtomicUsize::new(0));
    {
        let frontend_calls = Arc::clone(&frontend_calls);
        mgr.set_update_frontend_fn(Box::new(move |_update| {
            frontend_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        let server_calls = Arc::clone(&server_calls);
        mgr.set_update_local_server_fn(Box::new(move |_addresses| {
            server_calls.fetch_add(1, Ordering::SeqCst);
        }));
    }

    let b = executor("b", 21001, false, &["g1"]);
    let c = executor("c", 21002, false, &["g1"]);
    mgr.update_membership(&deltas(vec![upsert(&codec, &b), upsert(&codec, &c)], false), &mut outbound);
    let calls_before = (
        frontend_calls.load(Ordering::SeqCst),
        server_calls.load(Ordering::SeqCst),
    );

    // Locally decided blacklisting publishes without notifying listeners.
    mgr.blacklist_executor(&c);
    let snapshot = mgr.get_snapshot();
    assert_eq!(snapshot.executor_groups["g1"].num_executors(), 1);
    assert!(snapshot.executor_blacklist.is_blacklisted(&c));
    assert_snapshot_consistent(&snapshot);
    assert_eq!(
        (
            frontend_calls.load(Ordering::SeqCst),
            server_calls.load(Ordering::SeqCst)
        ),
        calls_before
    );
    let version_after_blacklist = snapshot.version;
    assert!(version_after_blacklist > 1);

    // Blacklisting is idempotent; the backend is already out of its groups.
    mgr.blacklist_executor(&c);
    assert_eq!(mgr.get_snapshot().version, version_after_blacklist);

    // The statestore eventually removes the backend; listeners fire now and
    // the blacklist forgets the entry.
    mgr.update_membership(&deltas(vec![delete("c")], true), &mut outbound);
    let snapshot = mgr.get_snapshot();
    assert!(snapshot.version > version_after_blacklist);
    assert_eq!(snapshot.current_backends.len(), 1);
    assert!(snapshot.current_backends.contains_key("b"));
    assert_eq!(snapshot.executor_groups["g1"].num_executors(), 1);
    assert!(snapshot.executor_blacklist.is_empty());
    assert!(frontend_calls.load(Ordering::SeqCst) > calls_before.0);
    assert!(server_calls.load(Ordering::SeqCst) > calls_before.1);
    assert_snapshot_consistent(&snapshot);
}

#[test]
fn blacklist_maintenance_restores_probated_executors() {
    let codec = JsonDescriptorCodec;
    let mgr = new_mgr("local");
    let mut outbound = Vec::new();

    let c = executor("c", 21002, false, &["g1"]);
    mgr.update_membership(&deltas(vec![upsert(&codec, &c)], false), &mut outbound);
    mgr.blacklist_executor(&c);
    assert_eq!(mgr.get_snapshot().executor_groups["g1"].num_executors(), 0);

    // After the timeout, an otherwise-empty delta triggers maintenance.
    thread::sleep(Duration::from_millis(80));
    mgr.update_membership(&deltas(Vec::new(), true), &mut outbound);
    let snapshot = mgr.get_snapshot();
    assert_eq!(snapshot.executor_groups["g1"].num_executors(), 1);
    assert!(snapshot.executor_blacklist.is_on_probation(&c));
    assert!(!snapshot.executor_blacklist.is_blacklisted(&c));
    assert_snapshot_consistent(&snapshot);
}

#[test]
fn version_strictly_increases_across_publications() {
    let codec = JsonDescriptorCodec;
    let mgr = new_mgr("local");
    let mut outbound = Vec::new();
    let mut last_version = mgr.get_snapshot().version;

    for round in 0..5u16 {
        let be = executor(&format!("be-{}", round), 21010 + round, false, &["g1"]);
        mgr.update_membership(&deltas(vec![upsert(&codec, &be)], round != 0), &mut outbound);
        let version = mgr.get_snapshot().version;
        assert!(version > last_version, "round {}", round);
        last_version = version;
    }

    // A no-op delta publishes nothing and burns no version.
    mgr.update_membership(&deltas(Vec::new(), true), &mut outbound);
    assert_eq!(mgr.get_snapshot().version, last_version);
}

#[test]
fn malformed_entries_are_dropped_without_stalling_the_update() {
    let codec = JsonDescriptorCodec;
    let mgr = new_mgr("local");
    let mut outbound = Vec::new();

    let mut no_ip = executor("noip", 21003, false, &["g1"]);
    no_ip.ip_address = String::new();
    let good = executor("good", 21004, false, &["g1"]);
    let entries = vec![
        TopicItem {
            key: "garbage".to_string(),
            value: b"not a descriptor".to_vec(),
            deleted: false,
        },
        upsert(&codec, &no_ip),
        upsert(&codec, &good),
    ];
    mgr.update_membership(&deltas(entries, false), &mut outbound);

    let snapshot = mgr.get_snapshot();
    assert_eq!(snapshot.current_backends.len(), 1);
    assert!(snapshot.current_backends.contains_key("good"));
    assert_snapshot_consistent(&snapshot);
}

#[test]
fn local_backend_is_republished_to_the_statestore() {
    let codec = JsonDescriptorCodec;
    let mgr = new_mgr("local");
    let local = Arc::new(executor("local", 21000, false, &["g1"]));
    {
        let local = Arc::clone(&local);
        mgr.set_local_be_desc_fn(Box::new(move || Some(Arc::clone(&local))));
    }

    let mut outbound = Vec::new();
    mgr.update_membership(&deltas(Vec::new(), true), &mut outbound);

    // The local descriptor diverged from the (empty) snapshot, so it was
    // added and queued for republication.
    let snapshot = mgr.get_snapshot();
    assert!(snapshot.current_backends.contains_key("local"));
    assert_eq!(snapshot.executor_groups["g1"].num_executors(), 1);
    assert_snapshot_consistent(&snapshot);

    assert_eq!(outbound.len(), 1);
    assert_eq!(outbound[0].topic_name, MEMBERSHIP_TOPIC);
    assert!(outbound[0].is_delta);
    assert_eq!(outbound[0].topic_entries.len(), 1);
    let item = &outbound[0].topic_entries[0];
    assert_eq!(item.key, "local");
    let decoded = codec.decode(&item.value).expect("decode");
    assert_eq!(decoded, *local);

    // The local backend cannot be blacklisted.
    mgr.blacklist_executor(&local);
    let snapshot = mgr.get_snapshot();
    assert!(snapshot.executor_blacklist.is_empty());
    assert_eq!(snapshot.executor_groups["g1"].num_executors(), 1);
}

#[test]
fn metrics_reflect_the_published_snapshot() {
    let codec = JsonDescriptorCodec;
    let mgr = new_mgr("local");
    let mut outbound = Vec::new();

    let a = executor("a", 21000, false, &["g1"]);
    let b = executor("b", 21001, false, &["g2"]);
    mgr.update_membership(&deltas(vec![upsert(&codec, &a), upsert(&codec, &b)], false), &mut outbound);
    assert_eq!(mgr.metric_values(), (2, 2, 2));

    mgr.update_membership(&deltas(vec![delete("b")], true), &mut outbound);
    // g2 still exists but has no hosts left: neither live nor healthy.
    assert_eq!(mgr.metric_values(), (1, 1, 1));
}

struct StubStatestore {
    in_grace_period: AtomicBool,
    registered_topics: Mutex<Vec<String>>,
}

impl StubStatestore {
    fn new() -> Self {
        Self {
            in_grace_period: AtomicBool::new(false),
            registered_topics: Mutex::new(Vec::new()),
        }
    }
}

impl StatestoreSubscriber for StubStatestore {
    fn add_topic(
        &self,
        topic_name: &str,
        _is_transient: bool,
        _callback: UpdateCallback,
    ) -> Result<(), String> {
        self.registered_topics
            .lock()
            .expect("topics lock")
            .push(topic_name.to_string());
        Ok(())
    }

    fn is_in_post_recovery_grace_period(&self) -> bool {
        self.in_grace_period.load(Ordering::SeqCst)
    }
}

#[test]
fn init_registers_the_membership_topic() {
    let subscriber = Arc::new(StubStatestore::new());
    let mgr = Arc::new(ClusterMembershipMgr::new(
        "local",
        Some(Arc::clone(&subscriber) as Arc<dyn StatestoreSubscriber>),
        Arc::new(JsonDescriptorCodec),
        Duration::from_secs(60),
        &RuntimeProfile::new("test"),
    ));
    ClusterMembershipMgr::init(&mgr).expect("init");
    assert_eq!(
        *subscriber.registered_topics.lock().expect("topics lock"),
        vec![MEMBERSHIP_TOPIC.to_string()]
    );
}

#[test]
fn updates_during_recovery_grace_period_stay_unpublished() {
    let codec = JsonDescriptorCodec;
    let subscriber = Arc::new(StubStatestore::new());
    let mgr = Arc::new(ClusterMembershipMgr::new(
        "local",
        Some(Arc::clone(&subscriber) as Arc<dyn StatestoreSubscriber>),
        Arc::new(JsonDescriptorCodec),
        Duration::from_secs(60),
        &RuntimeProfile::new("test"),
    ));

    let server_calls = Arc::new(AtomicUsize::new(0));
    {
        let server_calls = Arc::clone(&server_calls);
        mgr.set_update_local_server_fn(Box::new(move |_addresses| {
            server_calls.fetch_add(1, Ordering::SeqCst);
        }));
    }

    subscriber.in_grace_period.store(true, Ordering::SeqCst);
    let a = executor("a", 21000, false, &["g1"]);
    let mut outbound = Vec::new();
    mgr.update_membership(&deltas(vec![upsert(&codec, &a)], true), &mut outbound);

    // Nothing published while the statestore recovers.
    let snapshot = mgr.get_snapshot();
    assert_eq!(snapshot.version, 0);
    assert!(snapshot.current_backends.is_empty());
    assert_eq!(server_calls.load(Ordering::SeqCst), 0);

    // Once the grace period ends, even an empty delta publishes the
    // accumulated state and notifies the local server.
    subscriber.in_grace_period.store(false, Ordering::SeqCst);
    mgr.update_membership(&deltas(Vec::new(), true), &mut outbound);
    let snapshot = mgr.get_snapshot();
    assert!(snapshot.current_backends.contains_key("a"));
    assert!(snapshot.version >= 2);
    assert_eq!(server_calls.load(Ordering::SeqCst), 1);
    assert_snapshot_consistent(&snapshot);
}
