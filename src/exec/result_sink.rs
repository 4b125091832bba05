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
//! Blocking result sink between a fragment's producer thread and the client
//! fetch loop.
//!
//! One producer calls `send` per output batch and `flush_final` after the
//! last one; one consumer calls `get_next` with a buffer to fill. The sink
//! holds a single slot: the producer blocks until the consumer presents a
//! buffer, the consumer blocks until the producer fills it or ends the
//! stream. Cancellation wakes both sides; each re-checks the fragment state
//! before doing anything else.

use std::sync::{Arc, Condvar, Mutex};

use crate::exec::chunk::Chunk;
use crate::exec::expr::{ExprResultPool, RowEvaluator};
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::profile::{CounterRef, RuntimeProfile, ScopedTimer, TUnit};
use crate::runtime::runtime_state::RuntimeState;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SinkErrorKind {
    Cancelled,
    RowsProducedLimitExceeded,
    OutOfMemory,
    Internal,
}

#[derive(Clone, Debug)]
pub struct SinkError {
    pub kind: SinkErrorKind,
    pub message: String,
}

impl SinkError {
    pub fn cancelled(state: &RuntimeState) -> Self {
        Self {
            kind: SinkErrorKind::Cancelled,
            message: state
                .cancel_reason()
                .unwrap_or_else(|| "Cancelled".to_string()),
        }
    }

    pub fn rows_exceeded(limit: i64, produced: i64) -> Self {
        Self {
            kind: SinkErrorKind::RowsProducedLimitExceeded,
            message: format!(
                "rows produced limit exceeded: limit={} produced={}",
                limit, produced
            ),
        }
    }

    pub fn oom(message: impl Into<String>) -> Self {
        Self {
            kind: SinkErrorKind::OutOfMemory,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: SinkErrorKind::Internal,
            message: message.into(),
        }
    }
}

/// Consumer-owned collector the producer fills through the sink. Interior
/// mutability lets the consumer keep its handle while the producer appends.
pub trait ResultBuffer: Send + Sync {
    fn append_rows(
        &self,
        evals: &[Arc<dyn RowEvaluator>],
        pool: &mut ExprResultPool,
        batch: &Chunk,
        start: usize,
        num_rows: usize,
    ) -> Result<(), SinkError>;
}

/// Accumulates rows as self-delimiting records: per cell a null flag byte,
/// then a little-endian u32 length and the client text bytes.
pub struct SerializedResultBuffer {
    rows: Mutex<Vec<Vec<u8>>>,
    mem_tracker: Option<Arc<MemTracker>>,
}

impl SerializedResultBuffer {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
            mem_tracker: None,
        }
    }

    pub fn with_mem_tracker(tracker: Arc<MemTracker>) -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
            mem_tracker: Some(tracker),
        }
    }

    pub fn num_rows(&self) -> usize {
        self.rows.lock().expect("result buffer lock").len()
    }

    pub fn take_rows(&self) -> Vec<Vec<u8>> {
        let mut guard = self.rows.lock().expect("result buffer lock");
        std::mem::take(&mut *guard)
    }
}

impl Default for SerializedResultBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultBuffer for SerializedResultBuffer {
    fn append_rows(
        &self,
        evals: &[Arc<dyn RowEvaluator>],
        pool: &mut ExprResultPool,
        batch: &Chunk,
        start: usize,
        num_rows: usize,
    ) -> Result<(), SinkError> {
        let mut appended = Vec::with_capacity(num_rows);
        let mut appended_bytes = 0i64;
        for row in start..start + num_rows {
            let mut record = Vec::new();
            for eval in evals {
                match eval
                    .evaluate(batch, row, pool)
                    .map_err(SinkError::internal)?
                {
                    None => record.push(0),
                    Some(cell) => {
                        record.push(1);
                        let len = u32::try_from(cell.len())
                            .map_err(|_| SinkError::internal("result cell length overflow"))?;
                        record.extend_from_slice(&len.to_le_bytes());
                        record.extend_from_slice(&cell);
                        pool.recycle(cell);
                    }
                }
            }
            appended_bytes += record.len() as i64;
            appended.push(record);
        }
        if let Some(tracker) = self.mem_tracker.as_ref() {
            if !tracker.try_consume(appended_bytes) {
                return Err(SinkError::oom(format!(
                    "result buffer memory limit exceeded: requested={} current={} limit={}",
                    appended_bytes,
                    tracker.current(),
                    tracker.limit()
                )));
            }
        }
        let mut guard = self.rows.lock().expect("result buffer lock");
        guard.append(&mut appended);
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum SenderState {
    RowsPending,
    Eos,
    ClosedNotEos,
}

struct SinkShared {
    /// Non-null exactly while a consumer is waiting for rows.
    results: Option<Arc<dyn ResultBuffer>>,
    /// <= 0 means "as many rows as are available".
    num_rows_requested: i64,
    sender_state: SenderState,
    expr_results_pool: ExprResultPool,
}

pub struct BlockingResultSink {
    lock: Mutex<SinkShared>,
    sender_cv: Condvar,
    consumer_cv: Condvar,
    output_evals: Vec<Arc<dyn RowEvaluator>>,
    total_timer: CounterRef,
    inactive_timer: CounterRef,
    rows_sent: CounterRef,
}

impl BlockingResultSink {
    pub fn new(output_evals: Vec<Arc<dyn RowEvaluator>>, profile: &RuntimeProfile) -> Self {
        Self {
            lock: Mutex::new(SinkShared {
                results: None,
                num_rows_requested: 0,
                sender_state: SenderState::RowsPending,
                expr_results_pool: ExprResultPool::new(),
            }),
            sender_cv: Condvar::new(),
            consumer_cv: Condvar::new(),
            output_evals,
            total_timer: profile.add_timer("TotalTime"),
            inactive_timer: profile.add_timer("InactiveTotalTime"),
            rows_sent: profile.add_counter("RowsSent", TUnit::Unit),
        }
    }

    /// Deliver one batch to the consumer, blocking until every row has been
    /// copied out. Zero-row batches return without touching the rendezvous;
    /// clients do not cope with empty result sets mid-stream.
    pub fn send(&self, state: &RuntimeState, batch: &Chunk) -> Result<(), SinkError> {
        let _total = ScopedTimer::new(Arc::clone(&self.total_timer));
        if let Err(limit) = state.check_rows_produced_limit(batch.len() as i64) {
            return Err(SinkError::rows_exceeded(limit, state.num_rows_produced()));
        }
        let mut current_batch_row = 0usize;
        while current_batch_row < batch.len() {
            let mut shared = self.lock.lock().expect("result sink lock");
            // Wait until the consumer gives us a buffer to fill in, or the
            // fragment instance has been cancelled.
            while shared.results.is_none() && !state.is_cancelled() {
                let _inactive = ScopedTimer::new(Arc::clone(&self.inactive_timer));
                shared = self.sender_cv.wait(shared).expect("result sink wait");
            }
            if state.is_cancelled() {
                return Err(SinkError::cancelled(state));
            }

            let mut num_to_fetch = batch.len() - current_batch_row;
            if shared.num_rows_requested > 0 {
                num_to_fetch = num_to_fetch.min(shared.num_rows_requested as usize);
            }
            let SinkShared {
                results,
                expr_results_pool,
                ..
            } = &mut *shared;
            let Some(buffer) = results.as_ref() else {
                return Err(SinkError::internal("result sink slot empty after wakeup"));
            };
            buffer.append_rows(
                &self.output_evals,
                expr_results_pool,
                batch,
                current_batch_row,
                num_to_fetch,
            )?;
            current_batch_row += num_to_fetch;
            // Prevent expr result allocations from accumulating.
            shared.expr_results_pool.clear();
            // Hand the buffer back and signal the consumer.
            shared.results = None;
            self.rows_sent.add(num_to_fetch as i64);
            self.consumer_cv.notify_all();
        }
        Ok(())
    }

    /// All rows have been sent. Wakes the consumer so it can observe eos.
    pub fn flush_final(&self, _state: &RuntimeState) -> Result<(), SinkError> {
        let _total = ScopedTimer::new(Arc::clone(&self.total_timer));
        let mut shared = self.lock.lock().expect("result sink lock");
        shared.sender_state = SenderState::Eos;
        self.consumer_cv.notify_all();
        Ok(())
    }

    /// Producer-side teardown. `flush_final` won't have been called when the
    /// fragment hits an error before sending all rows.
    pub fn close(&self, _state: &RuntimeState) {
        let _total = ScopedTimer::new(Arc::clone(&self.total_timer));
        let mut shared = self.lock.lock().expect("result sink lock");
        if shared.sender_state == SenderState::RowsPending {
            shared.sender_state = SenderState::ClosedNotEos;
        }
        self.consumer_cv.notify_all();
    }

    /// Wake both sides after the fragment state has been cancelled. No sink
    /// state changes; waiters re-check the cancellation flag themselves.
    pub fn cancel(&self, state: &RuntimeState) {
        debug_assert!(state.is_cancelled());
        self.sender_cv.notify_all();
        self.consumer_cv.notify_all();
    }

    /// Present `results` to the producer and block until it has been filled,
    /// the stream has ended, or the fragment is cancelled. Returns eos.
    pub fn get_next(
        &self,
        state: &RuntimeState,
        results: &Arc<dyn ResultBuffer>,
        num_results: i64,
    ) -> Result<bool, SinkError> {
        let mut shared = self.lock.lock().expect("result sink lock");
        shared.results = Some(Arc::clone(results));
        shared.num_rows_requested = num_results;
        self.sender_cv.notify_all();

        // Wait while the sender is still producing rows and hasn't filled in
        // the current buffer.
        while shared.sender_state == SenderState::RowsPending
            && shared.results.is_some()
            && !state.is_cancelled()
        {
            shared = self.consumer_cv.wait(shared).expect("result sink wait");
        }

        // The slot must not outlive this call; on cancel or close the
        // consumer discards its buffer.
        shared.results = None;
        let eos = shared.sender_state == SenderState::Eos;
        drop(shared);

        if state.is_cancelled() {
            return Err(SinkError::cancelled(state));
        }
        if let Some(err) = state.error() {
            return Err(SinkError::internal(err));
        }
        Ok(eos)
    }
}
