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
use std::collections::BTreeMap;

use crate::common::logging::warn;
use crate::common::types::NetworkAddress;
use crate::service::descriptor::{BackendDescriptor, ExecutorGroupDesc};

/// A named set of backends that may jointly execute a query.
///
/// Executors are grouped per IP address; several backends may share a host.
/// Invariant (enforced by the membership manager, checked in debug builds):
/// every member has `is_executor`, is not quiescing, and is not
/// blacklisted.
#[derive(Clone, Debug)]
pub struct ExecutorGroup {
    name: String,
    min_size: i64,
    /// IP address -> backends on that host, ordered for deterministic
    /// iteration.
    executor_map: BTreeMap<String, Vec<BackendDescriptor>>,
    /// Hostname -> IP address of the executors above.
    executor_ip_map: BTreeMap<String, String>,
}

impl ExecutorGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_min_size(name, 1)
    }

    pub fn with_min_size(name: impl Into<String>, min_size: i64) -> Self {
        debug_assert!(min_size > 0);
        Self {
            name: name.into(),
            min_size: min_size.max(1),
            executor_map: BTreeMap::new(),
            executor_ip_map: BTreeMap::new(),
        }
    }

    pub fn from_desc(desc: &ExecutorGroupDesc) -> Self {
        Self::with_min_size(desc.name.clone(), desc.min_size)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn min_size(&self) -> i64 {
        self.min_size
    }

    pub fn add_executor(&mut self, be_desc: &BackendDescriptor) {
        // is_executor can be false for the local backend when scheduling
        // query roots on the coordinator host.
        debug_assert!(!be_desc.ip_address.is_empty());
        // IP addresses already match within a host entry, so the port is
        // enough to identify a backend. The duplicate check comes before the
        // consistency check.
        let is_duplicate = self
            .executor_map
            .get(&be_desc.ip_address)
            .is_some_and(|be_descs| {
                be_descs
                    .iter()
                    .any(|existing| existing.address.port == be_desc.address.port)
            });
        if is_duplicate {
            warn!(
                "Tried to add existing backend to executor group {}: {}",
                self.name, be_desc.address
            );
            return;
        }
        if !self.check_consistency_or_warn(be_desc) {
            warn!(
                "Ignoring inconsistent backend for executor group {}: {}",
                self.name, be_desc.address
            );
            return;
        }
        let be_descs = self.executor_map.entry(be_desc.ip_address.clone()).or_default();
        be_descs.push(be_desc.clone());
        self.executor_ip_map
            .insert(be_desc.address.hostname.clone(), be_desc.ip_address.clone());
    }

    pub fn remove_executor(&mut self, be_desc: &BackendDescriptor) {
        let Some(be_descs) = self.executor_map.get_mut(&be_desc.ip_address) else {
            warn!(
                "Tried to remove a backend from non-existing host in group {}: {}",
                self.name, be_desc.address
            );
            return;
        };
        let Some(pos) = be_descs
            .iter()
            .position(|existing| existing.address.port == be_desc.address.port)
        else {
            warn!(
                "Tried to remove non-existing backend from per-host list in group {}: {}",
                self.name, be_desc.address
            );
            return;
        };
        be_descs.remove(pos);
        if be_descs.is_empty() {
            self.executor_map.remove(&be_desc.ip_address);
            self.executor_ip_map.remove(&be_desc.address.hostname);
        }
    }

    /// Resolve `hostname` to the IP of an executor in this group. Hostnames
    /// that already are a member IP resolve to themselves.
    pub fn look_up_executor_ip(&self, hostname: &str) -> Option<String> {
        if self.executor_map.contains_key(hostname) {
            return Some(hostname.to_string());
        }
        self.executor_ip_map.get(hostname).cloned()
    }

    pub fn look_up_backend_desc(&self, host: &NetworkAddress) -> Option<&BackendDescriptor> {
        let ip = self.look_up_executor_ip(&host.hostname)?;
        self.executor_map
            .get(&ip)?
            .iter()
            .find(|desc| desc.address == *host)
    }

    pub fn get_all_executor_descriptors(&self) -> Vec<&BackendDescriptor> {
        self.executor_map.values().flatten().collect()
    }

    pub fn get_all_executor_ips(&self) -> Vec<String> {
        self.executor_map.keys().cloned().collect()
    }

    pub fn num_executors(&self) -> usize {
        self.executor_map.values().map(|descs| descs.len()).sum()
    }

    pub fn num_hosts(&self) -> usize {
        self.executor_map.len()
    }

    pub fn is_healthy(&self) -> bool {
        let num_executors = self.num_executors() as i64;
        if num_executors < self.min_size {
            warn!(
                "Executor group {} is unhealthy: {} out of {} are available.",
                self.name, num_executors, self.min_size
            );
            return false;
        }
        true
    }

    /// A backend that names this group must agree on the group's minimum
    /// size. Backends that don't mention the group at all are accepted;
    /// coordinator-only scheduling adds backends to unrelated groups.
    fn check_consistency_or_warn(&self, be_desc: &BackendDescriptor) -> bool {
        for desc in &be_desc.executor_groups {
            if desc.name == self.name {
                if desc.min_size == self.min_size {
                    return true;
                }
                warn!(
                    "Backend {} is configured for executor group {} with min size {} but group has minimum size {}",
                    be_desc.address, desc.name, desc.min_size, self.min_size
                );
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::ExecutorGroup;
    use crate::common::types::NetworkAddress;
    use crate::service::descriptor::{BackendDescriptor, ExecutorGroupDesc};
    use std::sync::{Arc, Mutex};

    /// Collects formatted log lines so tests can assert on which warning
    /// fired.
    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl LogBuffer {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().expect("log buffer lock")).into_owned()
        }
    }

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0
                .lock()
                .expect("log buffer lock")
                .extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogBuffer {
        type Writer = LogBuffer;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn executor(id: &str, host: &str, ip: &str, port: u16) -> BackendDescriptor {
        BackendDescriptor {
            id: id.to_string(),
            address: NetworkAddress::new(host, port),
            ip_address: ip.to_string(),
            is_coordinator: false,
            is_executor: true,
            is_quiescing: false,
            executor_groups: vec![ExecutorGroupDesc {
                name: "g1".to_string(),
                min_size: 1,
            }],
        }
    }

    #[test]
    fn add_remove_and_lookup() {
        let mut group = ExecutorGroup::new("g1");
        let a = executor("a", "host-a", "10.0.0.1", 22000);
        let b = executor("b", "host-b", "10.0.0.2", 22000);
        group.add_executor(&a);
        group.add_executor(&b);
        assert_eq!(group.num_executors(), 2);
        assert_eq!(group.num_hosts(), 2);
        assert!(group.look_up_backend_desc(&a.address).is_some());
        assert_eq!(
            group.look_up_executor_ip("host-b").as_deref(),
            Some("10.0.0.2")
        );

        group.remove_executor(&a);
        assert_eq!(group.num_executors(), 1);
        assert!(group.look_up_backend_desc(&a.address).is_none());
        assert!(group.look_up_executor_ip("host-a").is_none());
    }

    #[test]
    fn duplicate_add_is_ignored() {
        let mut group = ExecutorGroup::new("g1");
        let a = executor("a", "host-a", "10.0.0.1", 22000);
        group.add_executor(&a);
        group.add_executor(&a);
        assert_eq!(group.num_executors(), 1);
    }

    #[test]
    fn two_backends_on_one_host_count_once_per_ip() {
        let mut group = ExecutorGroup::new("g1");
        group.add_executor(&executor("a", "host-a", "10.0.0.1", 22000));
        group.add_executor(&executor("a2", "host-a", "10.0.0.1", 22001));
        assert_eq!(group.num_executors(), 2);
        assert_eq!(group.num_hosts(), 1);
    }

    #[test]
    fn duplicate_check_runs_before_consistency_check() {
        let mut group = ExecutorGroup::new("g1");
        let a = executor("a", "host-a", "10.0.0.1", 22000);
        group.add_executor(&a);

        // Same address as an existing member, but now also claiming an
        // inconsistent minimum size: the duplicate warning must fire, not
        // the consistency one.
        let mut dup = a.clone();
        dup.executor_groups[0].min_size = 9;

        let buf = LogBuffer::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(buf.clone())
            .with_ansi(false)
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            group.add_executor(&dup);
        });

        assert_eq!(group.num_executors(), 1);
        let logs = buf.contents();
        assert!(
            logs.contains("Tried to add existing backend"),
            "logs={}",
            logs
        );
        assert!(!logs.contains("inconsistent backend"), "logs={}", logs);
    }

    #[test]
    fn inconsistent_min_size_is_rejected() {
        let mut group = ExecutorGroup::with_min_size("g1", 3);
        let a = executor("a", "host-a", "10.0.0.1", 22000);
        group.add_executor(&a);
        assert_eq!(group.num_executors(), 0);
        assert!(!group.is_healthy());
    }
}
