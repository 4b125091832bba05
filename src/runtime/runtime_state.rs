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
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use crate::common::types::UniqueId;
use crate::runtime::mem_tracker::MemTracker;

/// RuntimeState is the per-fragment-instance execution context.
///
/// The result sink polls `is_cancelled` on every condition-variable wakeup;
/// anything that cancels the fragment must call `cancel` before notifying
/// the sink, or waiters will go back to sleep.
#[derive(Debug)]
pub struct RuntimeState {
    fragment_instance_id: Option<UniqueId>,
    cancelled: AtomicBool,
    cancel_reason: Mutex<Option<String>>,
    error_state: Arc<RuntimeErrorState>,
    num_rows_produced: AtomicI64,
    rows_produced_limit: Option<i64>,
    chunk_size: usize,
    mem_tracker: Option<Arc<MemTracker>>,
}

#[derive(Debug, Default)]
pub struct RuntimeErrorState {
    error: Mutex<Option<String>>,
}

impl RuntimeErrorState {
    pub fn set_error(&self, err: String) {
        let mut guard = self.error.lock().expect("runtime error lock");
        if guard.is_none() {
            *guard = Some(err);
        }
    }

    pub fn error(&self) -> Option<String> {
        self.error.lock().expect("runtime error lock").clone()
    }
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self {
            fragment_instance_id: None,
            cancelled: AtomicBool::new(false),
            cancel_reason: Mutex::new(None),
            error_state: Arc::new(RuntimeErrorState::default()),
            num_rows_produced: AtomicI64::new(0),
            rows_produced_limit: None,
            chunk_size: 4096,
            mem_tracker: None,
        }
    }
}

impl RuntimeState {
    pub fn new(
        fragment_instance_id: Option<UniqueId>,
        rows_produced_limit: Option<i64>,
        mem_tracker: Option<Arc<MemTracker>>,
    ) -> Self {
        Self {
            fragment_instance_id,
            rows_produced_limit: rows_produced_limit.filter(|v| *v > 0),
            mem_tracker,
            ..Self::default()
        }
    }

    pub fn fragment_instance_id(&self) -> Option<UniqueId> {
        self.fragment_instance_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Mark the fragment cancelled. The first reason wins.
    pub fn cancel(&self, reason: impl Into<String>) {
        let mut guard = self.cancel_reason.lock().expect("cancel reason lock");
        if guard.is_none() {
            *guard = Some(reason.into());
        }
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn cancel_reason(&self) -> Option<String> {
        self.cancel_reason
            .lock()
            .expect("cancel reason lock")
            .clone()
    }

    /// Account `rows` produced by the root of this fragment and check the
    /// configured cap. Returns the total produced so far, or the limit that
    /// was breached.
    pub fn check_rows_produced_limit(&self, rows: i64) -> Result<i64, i64> {
        let total = self.num_rows_produced.fetch_add(rows, Ordering::AcqRel) + rows;
        match self.rows_produced_limit {
            Some(limit) if total > limit => Err(limit),
            _ => Ok(total),
        }
    }

    pub fn num_rows_produced(&self) -> i64 {
        self.num_rows_produced.load(Ordering::Acquire)
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn error_state(&self) -> Arc<RuntimeErrorState> {
        Arc::clone(&self.error_state)
    }

    pub fn error(&self) -> Option<String> {
        self.error_state.error()
    }

    pub fn mem_tracker(&self) -> Option<Arc<MemTracker>> {
        self.mem_tracker.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::RuntimeState;

    #[test]
    fn first_cancel_reason_wins() {
        let state = RuntimeState::default();
        assert!(!state.is_cancelled());
        state.cancel("user requested");
        state.cancel("timeout");
        assert!(state.is_cancelled());
        assert_eq!(state.cancel_reason().as_deref(), Some("user requested"));
    }

    #[test]
    fn rows_produced_limit_trips_once_exceeded() {
        let state = RuntimeState::new(None, Some(10), None);
        assert_eq!(state.check_rows_produced_limit(6), Ok(6));
        assert_eq!(state.check_rows_produced_limit(4), Ok(10));
        assert_eq!(state.check_rows_produced_limit(1), Err(10));
    }

    #[test]
    fn error_latch_keeps_first_error() {
        let state = RuntimeState::default();
        state.error_state().set_error("boom".to_string());
        state.error_state().set_error("later".to_string());
        assert_eq!(state.error().as_deref(), Some("boom"));
    }
}
