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
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::service::descriptor::BackendDescriptor;

/// Probation lasts this many blacklist timeouts before an entry is
/// forgotten entirely.
const PROBATION_TIMEOUT_MULTIPLIER: u32 = 5;

pub const DEFAULT_BLACKLIST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BlacklistState {
    NotBlacklisted,
    Blacklisted,
    OnProbation,
}

#[derive(Clone, Debug)]
struct Entry {
    be_desc: BackendDescriptor,
    state: BlacklistState,
    /// When the entry entered its current state.
    since: Instant,
}

/// Backends the local coordinator refuses to schedule on, independent of
/// gossip. Blacklisted entries age onto probation after the timeout; a
/// probated backend that misbehaves again is simply re-blacklisted.
#[derive(Clone, Debug)]
pub struct ExecutorBlacklist {
    entries: HashMap<String, Entry>,
    blacklist_timeout: Duration,
}

impl Default for ExecutorBlacklist {
    fn default() -> Self {
        Self::new(DEFAULT_BLACKLIST_TIMEOUT)
    }
}

impl ExecutorBlacklist {
    pub fn new(blacklist_timeout: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            blacklist_timeout,
        }
    }

    pub fn blacklist(&mut self, be_desc: &BackendDescriptor) {
        self.entries.insert(
            be_desc.id.clone(),
            Entry {
                be_desc: be_desc.clone(),
                state: BlacklistState::Blacklisted,
                since: Instant::now(),
            },
        );
    }

    /// Remove any entry for the backend and report the state it was in.
    pub fn find_and_remove(&mut self, be_desc: &BackendDescriptor) -> BlacklistState {
        match self.entries.remove(&be_desc.id) {
            Some(entry) => entry.state,
            None => BlacklistState::NotBlacklisted,
        }
    }

    pub fn is_blacklisted(&self, be_desc: &BackendDescriptor) -> bool {
        matches!(
            self.entries.get(&be_desc.id).map(|e| e.state),
            Some(BlacklistState::Blacklisted)
        )
    }

    pub fn is_on_probation(&self, be_desc: &BackendDescriptor) -> bool {
        matches!(
            self.entries.get(&be_desc.id).map(|e| e.state),
            Some(BlacklistState::OnProbation)
        )
    }

    /// True when `maintenance` would change anything: a blacklisted entry
    /// has outlived the timeout, or a probation entry its window.
    pub fn needs_maintenance(&self) -> bool {
        let now = Instant::now();
        self.entries.values().any(|entry| self.entry_expired(entry, now))
    }

    fn entry_expired(&self, entry: &Entry, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(entry.since);
        match entry.state {
            BlacklistState::Blacklisted => elapsed >= self.blacklist_timeout,
            BlacklistState::OnProbation => {
                elapsed >= self.blacklist_timeout * PROBATION_TIMEOUT_MULTIPLIER
            }
            BlacklistState::NotBlacklisted => false,
        }
    }

    /// Age timed-out blacklist entries onto probation and drop expired
    /// probation entries. Returns the descriptors newly put on probation so
    /// the caller can restore them to their executor groups.
    pub fn maintenance(&mut self) -> Vec<BackendDescriptor> {
        let now = Instant::now();
        let mut probation_list = Vec::new();
        let mut expired_probation = Vec::new();
        for (id, entry) in self.entries.iter_mut() {
            if !self.blacklist_timeout.is_zero()
                && now.saturating_duration_since(entry.since)
                    >= self.blacklist_timeout * PROBATION_TIMEOUT_MULTIPLIER
                && entry.state == BlacklistState::OnProbation
            {
                expired_probation.push(id.clone());
                continue;
            }
            if entry.state == BlacklistState::Blacklisted
                && now.saturating_duration_since(entry.since) >= self.blacklist_timeout
            {
                entry.state = BlacklistState::OnProbation;
                entry.since = now;
                probation_list.push(entry.be_desc.clone());
            }
        }
        for id in expired_probation {
            self.entries.remove(&id);
        }
        probation_list
    }

    pub fn num_blacklisted(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.state == BlacklistState::Blacklisted)
            .count()
    }

    pub fn num_on_probation(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.state == BlacklistState::OnProbation)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
