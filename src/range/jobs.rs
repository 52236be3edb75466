//! Pending-job bookkeeping for a ranged transfer.

use std::collections::BTreeMap;

use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use super::source::RangeSlice;

/// One sub-range to fetch. `end` is inclusive. The seed job carries the
/// response that triggered the ranged transfer so its bytes are not
/// fetched twice.
pub struct RangeJob {
    pub start: u64,
    pub end: u64,
    pub seed: Option<RangeSlice>,
}

impl RangeJob {
    pub fn new(start: u64, end: u64) -> Self {
        RangeJob {
            start,
            end,
            seed: None,
        }
    }
}

/// Splits `[next, length)` into jobs of at most `maxsize` bytes.
pub fn split_jobs(next: u64, length: u64, maxsize: u64) -> Vec<RangeJob> {
    let mut jobs = Vec::new();
    let mut begin = next;
    while begin < length {
        let end = (begin + maxsize - 1).min(length - 1);
        jobs.push(RangeJob::new(begin, end));
        begin = end + 1;
    }
    jobs
}

/// Shared queue the workers pull from, lowest offset first so the
/// chunk the delivery loop is waiting on gets fetched soonest.
pub struct JobQueue {
    pending: Mutex<BTreeMap<u64, RangeJob>>,
    arrival: Notify,
    stop: CancellationToken,
}

impl JobQueue {
    pub fn new(stop: CancellationToken) -> Self {
        JobQueue {
            pending: Mutex::new(BTreeMap::new()),
            arrival: Notify::new(),
            stop,
        }
    }

    pub async fn push(&self, job: RangeJob) {
        self.pending.lock().await.insert(job.start, job);
        self.arrival.notify_one();
    }

    /// Pops the lowest-offset job, waiting until one shows up.
    /// Returns `None` once the transfer is cancelled.
    pub async fn pop(&self) -> Option<RangeJob> {
        loop {
            if self.stop.is_cancelled() {
                return None;
            }
            let notified = self.arrival.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some((_, job)) = self.pending.lock().await.pop_first() {
                // Wake the next waiter in case more jobs are queued.
                self.arrival.notify_one();
                return Some(job);
            }
            tokio::select! {
                _ = notified => {}
                _ = self.stop.cancelled() => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_after_seed() {
        let jobs = split_jobs(1024, 1_000_000, 4 * 1024 * 1024);
        assert_eq!(jobs.len(), 1);
        assert_eq!((jobs[0].start, jobs[0].end), (1024, 999_999));
    }

    #[test]
    fn splits_into_bounded_jobs() {
        let jobs = split_jobs(1024, 1_000_000, 100);
        assert_eq!(jobs.len(), 9_990);
        for job in &jobs {
            assert!(job.end - job.start + 1 <= 100);
        }
        assert_eq!(jobs[0].start, 1024);
        assert_eq!(jobs.last().map(|j| j.end), Some(999_999));
        for pair in jobs.windows(2) {
            assert_eq!(pair[0].end + 1, pair[1].start);
        }
    }

    #[test]
    fn split_of_nothing_is_empty() {
        assert!(split_jobs(500, 500, 100).is_empty());
    }

    #[tokio::test]
    async fn pops_lowest_offset_first() {
        let queue = JobQueue::new(CancellationToken::new());
        queue.push(RangeJob::new(200, 299)).await;
        queue.push(RangeJob::new(0, 99)).await;
        queue.push(RangeJob::new(100, 199)).await;

        assert_eq!(queue.pop().await.map(|j| j.start), Some(0));
        assert_eq!(queue.pop().await.map(|j| j.start), Some(100));
        assert_eq!(queue.pop().await.map(|j| j.start), Some(200));
    }

    #[tokio::test]
    async fn pop_returns_none_after_cancel() {
        let stop = CancellationToken::new();
        let queue = JobQueue::new(stop.clone());
        let waiter = tokio::spawn(async move { queue.pop().await.map(|j| j.start) });
        stop.cancel();
        assert_eq!(waiter.await.ok().flatten(), None);
    }
}
