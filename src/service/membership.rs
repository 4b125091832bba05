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
//! Cluster membership manager.
//!
//! Owns the canonical snapshot of the cluster topology. Gossip updates are
//! applied copy-on-write: mutation is serialized by one lock, readers take
//! shared references to immutable published snapshots and never block on
//! the update path. While the statestore is inside its post-recovery grace
//! period, updates accumulate in an owned, unpublished snapshot.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::common::config;
use crate::common::logging::{debug, info, log_every_n, warn};
use crate::common::types::NetworkAddress;
use crate::runtime::profile::{CounterRef, RuntimeProfile, TUnit};
use crate::service::descriptor::{BackendDescriptor, DescriptorCodec, ExecutorGroupDesc};
use crate::service::executor_blacklist::{BlacklistState, ExecutorBlacklist};
use crate::service::executor_group::ExecutorGroup;
use crate::service::statestore::{
    MEMBERSHIP_TOPIC, StatestoreSubscriber, TopicDelta, TopicDeltaMap, TopicItem,
};

const LIVE_EXEC_GROUP_KEY: &str = "cluster-membership.executor-groups.total";
const HEALTHY_EXEC_GROUP_KEY: &str = "cluster-membership.executor-groups.total-healthy";
const TOTAL_BACKENDS_KEY: &str = "cluster-membership.backends.total";

const WARN_EVERY_N: u64 = 30;

static DECODE_WARN_COUNT: AtomicU64 = AtomicU64::new(0);
static EMPTY_IP_WARN_COUNT: AtomicU64 = AtomicU64::new(0);
static LOCAL_ID_WARN_COUNT: AtomicU64 = AtomicU64::new(0);

/// One observable state of the cluster. Immutable after publication;
/// readers share it by reference count and need no further
/// synchronization.
#[derive(Clone, Debug)]
pub struct Snapshot {
    /// Strictly increases with every publication.
    pub version: u64,
    pub local_be_desc: Option<Arc<BackendDescriptor>>,
    /// All known backends, keyed by backend id. Always reflects the full
    /// gossip membership, including blacklisted backends.
    pub current_backends: HashMap<String, BackendDescriptor>,
    /// Executor groups by name. Only live, non-quiescing, non-blacklisted
    /// executors appear here.
    pub executor_groups: HashMap<String, ExecutorGroup>,
    pub executor_blacklist: ExecutorBlacklist,
}

pub type SnapshotRef = Arc<Snapshot>;

/// Payload of the frontend notification; built from `current_backends`
/// only, and handed to the callback by reference.
#[derive(Clone, Debug, Default)]
pub struct ExecutorMembershipUpdate {
    pub hostnames: HashSet<String>,
    pub ip_addresses: HashSet<String>,
    pub num_executors: i64,
}

pub type BackendDescriptorFn = Box<dyn Fn() -> Option<Arc<BackendDescriptor>> + Send + Sync>;
pub type UpdateLocalServerFn = Box<dyn Fn(&HashSet<NetworkAddress>) + Send + Sync>;
pub type UpdateFrontendFn =
    Box<dyn Fn(&ExecutorMembershipUpdate) -> Result<(), String> + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    local_be_desc_fn: Option<BackendDescriptorFn>,
    update_local_server_fn: Option<UpdateLocalServerFn>,
    update_frontend_fn: Option<UpdateFrontendFn>,
}

/// State guarded by the update-serialization lock. The recovering snapshot
/// is owned, not shared: nothing can observe it before publication.
#[derive(Default)]
struct UpdateState {
    recovering_membership: Option<Snapshot>,
}

struct MembershipMetrics {
    total_live_executor_groups: CounterRef,
    total_healthy_executor_groups: CounterRef,
    total_backends: CounterRef,
}

pub struct ClusterMembershipMgr {
    local_backend_id: String,
    subscriber: Option<Arc<dyn StatestoreSubscriber>>,
    codec: Arc<dyn DescriptorCodec>,
    blacklist_timeout: Duration,
    /// Publication pointer; held only long enough to swap or clone the Arc.
    current_membership: Mutex<SnapshotRef>,
    /// Serializes all mutation.
    update_state: Mutex<UpdateState>,
    callbacks: Mutex<Callbacks>,
    metrics: MembershipMetrics,
}

fn find_or_insert_executor_group<'a>(
    group: &ExecutorGroupDesc,
    executor_groups: &'a mut HashMap<String, ExecutorGroup>,
) -> &'a mut ExecutorGroup {
    executor_groups
        .entry(group.name.clone())
        .or_insert_with(|| ExecutorGroup::from_desc(group))
}

impl ClusterMembershipMgr {
    pub fn new(
        local_backend_id: impl Into<String>,
        subscriber: Option<Arc<dyn StatestoreSubscriber>>,
        codec: Arc<dyn DescriptorCodec>,
        blacklist_timeout: Duration,
        metrics: &RuntimeProfile,
    ) -> Self {
        let metric_grp = metrics.child("cluster-membership");
        let metrics = MembershipMetrics {
            total_live_executor_groups: metric_grp.add_counter(LIVE_EXEC_GROUP_KEY, TUnit::Unit),
            total_healthy_executor_groups: metric_grp
                .add_counter(HEALTHY_EXEC_GROUP_KEY, TUnit::Unit),
            total_backends: metric_grp.add_counter(TOTAL_BACKENDS_KEY, TUnit::Unit),
        };
        let blacklist_timeout = if blacklist_timeout.is_zero() {
            Duration::from_secs(1)
        } else {
            blacklist_timeout
        };
        let initial = Snapshot {
            version: 0,
            local_be_desc: None,
            current_backends: HashMap::new(),
            executor_groups: HashMap::new(),
            executor_blacklist: ExecutorBlacklist::new(blacklist_timeout),
        };
        Self {
            local_backend_id: local_backend_id.into(),
            subscriber,
            codec,
            blacklist_timeout,
            current_membership: Mutex::new(Arc::new(initial)),
            update_state: Mutex::new(UpdateState::default()),
            callbacks: Mutex::new(Callbacks::default()),
            metrics,
        }
    }

    /// Register the gossip callback. Without a subscriber (tests), updates
    /// must be delivered by calling `update_membership` directly.
    pub fn init(mgr: &Arc<Self>) -> Result<(), String> {
        info!("Starting cluster membership manager");
        let Some(subscriber) = mgr.subscriber.clone() else {
            return Ok(());
        };
        let weak = Arc::downgrade(mgr);
        subscriber
            .add_topic(
                MEMBERSHIP_TOPIC,
                /* is_transient= */ true,
                Box::new(move |deltas, outbound| {
                    if let Some(mgr) = weak.upgrade() {
                        mgr.update_membership(deltas, outbound);
                    }
                }),
            )
            .map_err(|e| format!("membership manager failed to register topic: {}", e))
    }

    pub fn set_local_be_desc_fn(&self, f: BackendDescriptorFn) {
        let mut callbacks = self.callbacks.lock().expect("membership callback lock");
        debug_assert!(callbacks.local_be_desc_fn.is_none());
        callbacks.local_be_desc_fn = Some(f);
    }

    pub fn set_update_local_server_fn(&self, f: UpdateLocalServerFn) {
        let mut callbacks = self.callbacks.lock().expect("membership callback lock");
        debug_assert!(callbacks.update_local_server_fn.is_none());
        callbacks.update_local_server_fn = Some(f);
    }

    pub fn set_update_frontend_fn(&self, f: UpdateFrontendFn) {
        let mut callbacks = self.callbacks.lock().expect("membership callback lock");
        debug_assert!(callbacks.update_frontend_fn.is_none());
        callbacks.update_frontend_fn = Some(f);
    }

    /// O(1); takes the publication lock only to clone the Arc, never the
    /// update lock.
    pub fn get_snapshot(&self) -> SnapshotRef {
        let guard = self
            .current_membership
            .lock()
            .expect("membership publication lock");
        Arc::clone(&guard)
    }

    /// Gossip callback: apply the membership topic of `incoming_topic_deltas`
    /// and publish a new snapshot if anything observable changed.
    pub fn update_membership(
        &self,
        incoming_topic_deltas: &TopicDeltaMap,
        subscriber_topic_updates: &mut Vec<TopicDelta>,
    ) {
        let mut update_state = self.update_state.lock().expect("membership update lock");

        // Ignore spurious messages.
        let Some(update) = incoming_topic_deltas.get(MEMBERSHIP_TOPIC) else {
            return;
        };

        // An empty delta carries no statestore changes.
        let no_ss_update = update.is_delta && update.topic_entries.is_empty();

        let current = self.get_snapshot();
        let local_be_desc = self.get_local_backend_descriptor();

        let (base_version, needs_local_be_update, needs_blacklist_maintenance) = {
            let base_snapshot: &Snapshot = update_state
                .recovering_membership
                .as_ref()
                .unwrap_or_else(|| current.as_ref());
            (
                base_snapshot.version,
                self.needs_local_backend_update(base_snapshot, &local_be_desc),
                base_snapshot.executor_blacklist.needs_maintenance(),
            )
        };

        // The statestore counts as recovering until its post-recovery grace
        // period has elapsed.
        let ss_is_recovering = self
            .subscriber
            .as_ref()
            .is_some_and(|s| s.is_in_post_recovery_grace_period());

        // Holding a recovering membership while the statestore is healthy
        // again means the local server has catching up to do.
        let mut update_local_server =
            update_state.recovering_membership.is_some() && !ss_is_recovering;

        if no_ss_update
            && !needs_local_be_update
            && !update_local_server
            && !needs_blacklist_maintenance
        {
            return;
        }

        if !no_ss_update {
            debug!("Processing statestore update");
        }
        if needs_local_be_update {
            debug!("Local backend membership needs update");
        }
        if update_local_server {
            debug!("Local server needs update");
        }
        if needs_blacklist_maintenance {
            debug!("Removing executors from the blacklist");
        }
        if ss_is_recovering {
            debug!("Statestore subscriber is in post-recovery grace period");
        }

        let mut new_state: Snapshot = if !update.is_delta {
            debug!("Received full membership update");
            // A full update could remove backends, so the local server must
            // be told either way.
            update_local_server = true;
            self.empty_snapshot()
        } else {
            debug!("Received delta membership update");
            match update_state.recovering_membership.take() {
                // The recovering membership has never been published, so it
                // can be modified in place.
                Some(recovering) => recovering,
                None => (*current).clone(),
            }
        };
        if let Some(desc) = local_be_desc.as_ref() {
            new_state.local_be_desc = Some(Arc::clone(desc));
        }
        new_state.version = base_version + 1;

        // Apply removed, new, and updated entries to the backend map and
        // the executor groups.
        for item in &update.topic_entries {
            if item.deleted {
                if let Some(be_desc) = new_state.current_backends.get(&item.key).cloned() {
                    let blacklisted = new_state.executor_blacklist.find_and_remove(&be_desc)
                        == BlacklistState::Blacklisted;
                    // A quiescing or blacklisted backend has already left
                    // its groups.
                    if be_desc.is_executor && !be_desc.is_quiescing && !blacklisted {
                        for group in &be_desc.executor_groups {
                            debug!(
                                "Removing backend {} from group {} (deleted)",
                                item.key, group.name
                            );
                            find_or_insert_executor_group(group, &mut new_state.executor_groups)
                                .remove_executor(&be_desc);
                        }
                    }
                    new_state.current_backends.remove(&item.key);
                    update_local_server = true;
                }
                continue;
            }

            let be_desc = match self.codec.decode(&item.value) {
                Ok(desc) => desc,
                Err(e) => {
                    if log_every_n(&DECODE_WARN_COUNT, WARN_EVERY_N) {
                        warn!(
                            "Error deserializing membership topic item with key {}: {}",
                            item.key, e
                        );
                    }
                    continue;
                }
            };
            if be_desc.ip_address.is_empty() {
                // Each backend resolves its own IP and transmits it inside
                // its descriptor; an empty one is a malformed packet.
                if log_every_n(&EMPTY_IP_WARN_COUNT, WARN_EVERY_N) {
                    warn!(
                        "Ignoring subscription request with empty IP address from subscriber: {}",
                        be_desc.address
                    );
                }
                continue;
            }
            if item.key == self.local_backend_id {
                match local_be_desc.as_ref() {
                    None => {
                        if log_every_n(&LOCAL_ID_WARN_COUNT, WARN_EVERY_N) {
                            warn!(
                                "Another host registered itself with the local backend id ({}), but the local backend has not started yet. The offending address is: {}",
                                item.key, be_desc.address
                            );
                        }
                    }
                    Some(local) if be_desc.address != local.address => {
                        // Someone else registered our id with a different
                        // address; we re-register below, but the cluster is
                        // likely misconfigured.
                        if log_every_n(&LOCAL_ID_WARN_COUNT, WARN_EVERY_N) {
                            warn!(
                                "Duplicate subscriber registration from address: {} (we are: {}, backend id: {})",
                                be_desc.address, local.address, item.key
                            );
                        }
                    }
                    Some(_) => {}
                }
                // The local backend is always set explicitly below.
                continue;
            }

            if let Some(existing) = new_state.current_backends.get_mut(&item.key) {
                let blacklisted = new_state.executor_blacklist.find_and_remove(&be_desc)
                    == BlacklistState::Blacklisted;
                if be_desc.is_quiescing
                    && !existing.is_quiescing
                    && existing.is_executor
                    && !blacklisted
                {
                    for group in &be_desc.executor_groups {
                        debug!(
                            "Removing backend {} from group {} (quiescing)",
                            item.key, group.name
                        );
                        find_or_insert_executor_group(group, &mut new_state.executor_groups)
                            .remove_executor(&be_desc);
                    }
                }
                *existing = be_desc;
            } else {
                #[cfg(debug_assertions)]
                {
                    // A backend seen for the first time cannot already be
                    // blacklisted or on probation.
                    assert_eq!(
                        new_state.executor_blacklist.find_and_remove(&be_desc),
                        BlacklistState::NotBlacklisted
                    );
                }
                if !be_desc.is_quiescing && be_desc.is_executor {
                    for group in &be_desc.executor_groups {
                        debug!("Adding backend {} to group {}", item.key, group.name);
                        find_or_insert_executor_group(group, &mut new_state.executor_groups)
                            .add_executor(&be_desc);
                    }
                }
                new_state.current_backends.insert(item.key.clone(), be_desc);
            }
            debug_assert!(Self::check_consistency(&new_state));
        }

        if needs_blacklist_maintenance {
            // Backends coming off the blacklist onto probation go back into
            // their groups.
            let probation_list = new_state.executor_blacklist.maintenance();
            for be_desc in probation_list {
                for group in &be_desc.executor_groups {
                    debug!(
                        "Adding backend {} to group {} (passed blacklist timeout)",
                        be_desc.address, group.name
                    );
                    find_or_insert_executor_group(group, &mut new_state.executor_groups)
                        .add_executor(&be_desc);
                }
            }
            debug_assert!(Self::check_consistency(&new_state));
        }

        // Re-check against new_state here; a full update resets it above.
        if self.needs_local_backend_update(&new_state, &local_be_desc) {
            if let Some(local) = local_be_desc.as_ref() {
                new_state
                    .current_backends
                    .insert(self.local_backend_id.clone(), (**local).clone());
                for group in &local.executor_groups {
                    if local.is_quiescing {
                        debug!("Removing local backend from group {}", group.name);
                        find_or_insert_executor_group(group, &mut new_state.executor_groups)
                            .remove_executor(local);
                    } else if local.is_executor {
                        debug!("Adding local backend to group {}", group.name);
                        find_or_insert_executor_group(group, &mut new_state.executor_groups)
                            .add_executor(local);
                    }
                }
                self.add_local_backend_to_statestore(local, subscriber_topic_updates);
                debug_assert!(Self::check_consistency(&new_state));
            }
        }

        self.update_metrics(&new_state);

        // Neither publish nor notify while the statestore is still in its
        // post-recovery grace period.
        if ss_is_recovering {
            update_state.recovering_membership = Some(new_state);
            return;
        }

        if update_local_server {
            self.notify_local_server(&new_state.current_backends);
        }
        self.update_frontend_executor_membership(&new_state.current_backends);

        self.set_state(Arc::new(new_state));
        update_state.recovering_membership = None;
    }

    /// Locally decided removal of an executor from scheduling. Idempotent.
    ///
    /// Deliberately does not invoke the listener callbacks: queries already
    /// running on the backend may still succeed, and the next gossip tick
    /// propagates the change to the frontend anyway.
    pub fn blacklist_executor(&self, be_desc: &BackendDescriptor) {
        if !blacklisting_enabled() {
            return;
        }
        let mut update_state = self.update_state.lock().expect("membership update lock");
        let current = self.get_snapshot();

        // Never blacklist the local backend; query roots scheduled on the
        // coordinator would fail forever.
        if let Some(local) = current.local_be_desc.as_ref() {
            if be_desc.ip_address == local.ip_address
                && be_desc.address.port == local.address.port
            {
                return;
            }
        }

        let recovering = update_state.recovering_membership.is_some();
        let exists = {
            let base_snapshot: &Snapshot = update_state
                .recovering_membership
                .as_ref()
                .unwrap_or_else(|| current.as_ref());
            be_desc.executor_groups.iter().any(|group| {
                base_snapshot
                    .executor_groups
                    .get(&group.name)
                    .and_then(|g| g.look_up_backend_desc(&be_desc.address))
                    .is_some()
            })
        };
        if !exists {
            // Already gone from every group, e.g. removed by a statestore
            // update before the coordinator decided to blacklist it, or
            // quiescing.
            return;
        }

        let mut new_state: Snapshot = match update_state.recovering_membership.take() {
            Some(recovering_snapshot) => recovering_snapshot,
            None => (*current).clone(),
        };
        new_state.version = new_state.version.max(current.version) + 1;

        for group in &be_desc.executor_groups {
            debug!(
                "Removing backend {} from group {} (blacklisted)",
                be_desc.address, group.name
            );
            find_or_insert_executor_group(group, &mut new_state.executor_groups)
                .remove_executor(be_desc);
        }
        new_state.executor_blacklist.blacklist(be_desc);

        // Published once the statestore leaves recovery.
        if recovering {
            update_state.recovering_membership = Some(new_state);
            return;
        }

        self.set_state(Arc::new(new_state));
    }

    fn empty_snapshot(&self) -> Snapshot {
        Snapshot {
            version: 0,
            local_be_desc: None,
            current_backends: HashMap::new(),
            executor_groups: HashMap::new(),
            executor_blacklist: ExecutorBlacklist::new(self.blacklist_timeout),
        }
    }

    fn add_local_backend_to_statestore(
        &self,
        local_be_desc: &BackendDescriptor,
        subscriber_topic_updates: &mut Vec<TopicDelta>,
    ) {
        debug!("Sending local backend to statestore");
        let value = match self.codec.encode(local_be_desc) {
            Ok(value) => value,
            // A local descriptor that cannot be serialized is a programming
            // error; nothing sensible can continue from here.
            Err(e) => panic!("Failed to serialize local backend descriptor for statestore topic: {}", e),
        };
        subscriber_topic_updates.push(TopicDelta {
            topic_name: MEMBERSHIP_TOPIC.to_string(),
            // Marked as a delta so the resulting update can be fed to other
            // membership managers unmodified in tests.
            is_delta: true,
            topic_entries: vec![TopicItem {
                key: self.local_backend_id.clone(),
                value,
                deleted: false,
            }],
        });
    }

    fn get_local_backend_descriptor(&self) -> Option<Arc<BackendDescriptor>> {
        let callbacks = self.callbacks.lock().expect("membership callback lock");
        callbacks.local_be_desc_fn.as_ref().and_then(|f| f())
    }

    fn notify_local_server(&self, current_backends: &HashMap<String, BackendDescriptor>) {
        debug!("Notifying local server of membership changes");
        let callbacks = self.callbacks.lock().expect("membership callback lock");
        let Some(update_fn) = callbacks.update_local_server_fn.as_ref() else {
            return;
        };
        let current_backend_set: HashSet<NetworkAddress> = current_backends
            .values()
            .map(|desc| desc.address.clone())
            .collect();
        update_fn(&current_backend_set);
    }

    fn update_frontend_executor_membership(
        &self,
        current_backends: &HashMap<String, BackendDescriptor>,
    ) {
        let callbacks = self.callbacks.lock().expect("membership callback lock");
        let Some(update_fn) = callbacks.update_frontend_fn.as_ref() else {
            return;
        };
        let mut update_req = ExecutorMembershipUpdate::default();
        for backend in current_backends.values() {
            if backend.is_executor {
                update_req.hostnames.insert(backend.address.hostname.clone());
                update_req.ip_addresses.insert(backend.ip_address.clone());
                update_req.num_executors += 1;
            }
        }
        if let Err(e) = update_fn(&update_req) {
            warn!("Error updating frontend membership snapshot: {}", e);
        }
    }

    fn set_state(&self, new_state: SnapshotRef) {
        let mut guard = self
            .current_membership
            .lock()
            .expect("membership publication lock");
        *guard = new_state;
    }

    fn needs_local_backend_update(
        &self,
        state: &Snapshot,
        local_be_desc: &Option<Arc<BackendDescriptor>>,
    ) -> bool {
        let Some(local) = local_be_desc.as_ref() else {
            return false;
        };
        if state.local_be_desc.is_none() {
            return true;
        }
        match state.current_backends.get(&self.local_backend_id) {
            None => true,
            Some(existing) => existing.is_quiescing != local.is_quiescing,
        }
    }

    /// Every backend in any group must appear in `current_backends` with
    /// matching executor/quiescing flags and must not be blacklisted.
    fn check_consistency(state: &Snapshot) -> bool {
        let mut address_to_backend: HashMap<&NetworkAddress, &BackendDescriptor> = HashMap::new();
        for backend in state.current_backends.values() {
            address_to_backend.insert(&backend.address, backend);
        }

        for (group_name, group) in &state.executor_groups {
            for group_be in group.get_all_executor_descriptors() {
                if !group_be.is_executor {
                    warn!(
                        "Backend {} in group {} is not an executor",
                        group_be.address, group_name
                    );
                    return false;
                }
                if group_be.is_quiescing {
                    warn!(
                        "Backend {} in group {} is quiescing",
                        group_be.address, group_name
                    );
                    return false;
                }
                let Some(current_be) = address_to_backend.get(&group_be.address) else {
                    warn!(
                        "Backend {} is in group {} but not in current set of backends",
                        group_be.address, group_name
                    );
                    return false;
                };
                if current_be.is_quiescing != group_be.is_quiescing
                    || current_be.is_executor != group_be.is_executor
                {
                    warn!(
                        "Backend {} in group {} differs from backend in current set of backends",
                        group_be.address, group_name
                    );
                    return false;
                }
                if state.executor_blacklist.is_blacklisted(group_be) {
                    warn!(
                        "Backend {} in group {} is blacklisted",
                        group_be.address, group_name
                    );
                    return false;
                }
            }
        }
        true
    }

    fn update_metrics(&self, state: &Snapshot) {
        let mut total_live_executor_groups = 0i64;
        let mut total_healthy_executor_groups = 0i64;
        for group in state.executor_groups.values() {
            if group.is_healthy() {
                total_live_executor_groups += 1;
                total_healthy_executor_groups += 1;
            } else if group.num_hosts() > 0 {
                total_live_executor_groups += 1;
            }
        }
        debug_assert!(total_live_executor_groups >= total_healthy_executor_groups);
        self.metrics
            .total_live_executor_groups
            .set(total_live_executor_groups);
        self.metrics
            .total_healthy_executor_groups
            .set(total_healthy_executor_groups);
        self.metrics
            .total_backends
            .set(state.current_backends.len() as i64);
    }

    pub fn local_backend_id(&self) -> &str {
        &self.local_backend_id
    }

    pub fn metric_values(&self) -> (i64, i64, i64) {
        (
            self.metrics.total_backends.value(),
            self.metrics.total_live_executor_groups.value(),
            self.metrics.total_healthy_executor_groups.value(),
        )
    }
}

fn blacklisting_enabled() -> bool {
    config::config()
        .map(|cfg| cfg.membership.blacklisting_enabled)
        .unwrap_or(true)
}
