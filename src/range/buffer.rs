//! Ordered reassembly buffer between the range workers and the
//! delivery loop.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Mutex, Notify};
use tokio::time::{timeout_at, Instant};

use crate::error_handling::RangeError;

struct BufferState {
    chunks: BTreeMap<u64, Bytes>,
    buffered_bytes: usize,
    expected: u64,
    aborted: bool,
}

/// Chunks land here keyed by their absolute offset; the delivery side
/// drains them strictly in order. Total buffered bytes are capped so a
/// fast origin cannot run ahead of a slow client without bound.
pub struct ChunkBuffer {
    state: Mutex<BufferState>,
    arrival: Notify,
    drained: Notify,
    ceiling: usize,
}

impl ChunkBuffer {
    pub fn new(expected: u64, ceiling: usize) -> Self {
        ChunkBuffer {
            state: Mutex::new(BufferState {
                chunks: BTreeMap::new(),
                buffered_bytes: 0,
                expected,
                aborted: false,
            }),
            arrival: Notify::new(),
            drained: Notify::new(),
            ceiling,
        }
    }

    /// Accepts a chunk starting at `start`. A chunk behind the delivery
    /// cursor means the ordering contract broke, which poisons the whole
    /// transfer; a duplicate of a buffered offset is dropped.
    pub async fn offer(&self, start: u64, data: Bytes) -> Result<(), RangeError> {
        let mut state = self.state.lock().await;
        if state.aborted {
            return Err(RangeError::Aborted);
        }
        if start < state.expected {
            state.aborted = true;
            self.arrival.notify_waiters();
            self.drained.notify_waiters();
            return Err(RangeError::StaleOffset {
                start,
                expected: state.expected,
            });
        }
        if state.chunks.contains_key(&start) {
            return Ok(());
        }
        state.buffered_bytes += data.len();
        state.chunks.insert(start, data);
        self.arrival.notify_one();
        Ok(())
    }

    /// Waits for the chunk at the delivery cursor and advances past it.
    /// No arrival within `wait` aborts the transfer as stalled.
    pub async fn take(&self, wait: Duration) -> Result<Bytes, RangeError> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.arrival.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let offset;
            {
                let mut state = self.state.lock().await;
                if state.aborted {
                    return Err(RangeError::Aborted);
                }
                offset = state.expected;
                if let Some(data) = state.chunks.remove(&offset) {
                    state.buffered_bytes -= data.len();
                    state.expected = offset + data.len() as u64;
                    self.drained.notify_waiters();
                    return Ok(data);
                }
            }
            if timeout_at(deadline, notified).await.is_err() {
                let mut state = self.state.lock().await;
                state.aborted = true;
                self.arrival.notify_waiters();
                self.drained.notify_waiters();
                return Err(RangeError::Stalled {
                    offset,
                    waited: wait,
                });
            }
        }
    }

    /// Blocks while the buffer sits above its ceiling. Workers call this
    /// before pulling another job so delivery can catch up.
    pub async fn below_ceiling(&self) -> Result<(), RangeError> {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.state.lock().await;
                if state.aborted {
                    return Err(RangeError::Aborted);
                }
                if state.buffered_bytes <= self.ceiling {
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    pub async fn abort(&self) {
        let mut state = self.state.lock().await;
        state.aborted = true;
        self.arrival.notify_waiters();
        self.drained.notify_waiters();
    }
}
