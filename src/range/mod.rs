//! Parallel range reassembly.
//!
//! A single large download is split into fixed-size byte-range jobs,
//! fetched concurrently through the relay, and stitched back together
//! in strict offset order for the client. The response that revealed
//! the origin supports ranges is consumed as the first job rather than
//! thrown away. Failed or partial jobs are re-enqueued for the
//! remaining span; the client only ever sees a contiguous stream.

pub mod buffer;
pub mod jobs;
pub mod source;

pub use source::{
    parse_content_range, ContentRange, RangeSlice, RangeSource, TunnelRangeSource,
};

use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_LENGTH, CONTENT_RANGE};
use http::StatusCode;
use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::RangeConfig;
use crate::error_handling::RangeError;
use crate::http::write_response_head;
use buffer::ChunkBuffer;
use jobs::{split_jobs, JobQueue, RangeJob};

/// Drives one ranged transfer: seeds the job queue, runs the worker
/// pool, and streams ordered chunks to the client.
pub struct RangeFetch<S> {
    source: Arc<S>,
    url: Arc<RwLock<String>>,
    cfg: RangeConfig,
}

struct WorkerCtx<S> {
    source: Arc<S>,
    queue: Arc<JobQueue>,
    buffer: Arc<ChunkBuffer>,
    url: Arc<RwLock<String>>,
    stop: CancellationToken,
    bufsize: usize,
}

impl<S: RangeSource + 'static> RangeFetch<S> {
    pub fn new(source: Arc<S>, url: &str, cfg: RangeConfig) -> Self {
        RangeFetch {
            source,
            url: Arc::new(RwLock::new(url.to_string())),
            cfg,
        }
    }

    /// Replays `seed` as the first job and fetches the rest of the
    /// entity in parallel, writing a single ordered response to
    /// `client`. The seed must carry a content range.
    pub async fn run<W>(&self, seed: RangeSlice, client: &mut W) -> Result<(), RangeError>
    where
        W: AsyncWrite + Unpin,
    {
        let Some(range) = seed.content_range else {
            return Err(RangeError::Aborted);
        };
        let (start, end, length) = (range.start, range.end, range.total);
        info!("range fetch {start}-{end}/{length}");

        let mut headers = seed.headers.clone();
        let status = if start == 0 {
            headers.remove(CONTENT_RANGE);
            headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
            StatusCode::OK
        } else {
            headers.insert(CONTENT_RANGE, range_value(start, length - 1, length));
            headers.insert(CONTENT_LENGTH, HeaderValue::from(length - start));
            StatusCode::PARTIAL_CONTENT
        };
        client
            .write_all(&write_response_head(status, &headers))
            .await
            .map_err(RangeError::ClientWrite)?;

        let stop = CancellationToken::new();
        let queue = Arc::new(JobQueue::new(stop.clone()));
        let chunks = Arc::new(ChunkBuffer::new(start, self.cfg.buffer_ceiling));

        queue
            .push(RangeJob {
                start,
                end,
                seed: Some(seed),
            })
            .await;
        for job in split_jobs(end + 1, length, self.cfg.maxsize) {
            queue.push(job).await;
        }

        for id in 0..self.cfg.workers {
            let ctx = WorkerCtx {
                source: self.source.clone(),
                queue: queue.clone(),
                buffer: chunks.clone(),
                url: self.url.clone(),
                stop: stop.clone(),
                bufsize: self.cfg.bufsize,
            };
            tokio::spawn(worker(ctx, id));
        }

        let result = self.deliver(start, length, &chunks, client).await;
        stop.cancel();
        chunks.abort().await;
        result
    }

    async fn deliver<W>(
        &self,
        start: u64,
        length: u64,
        chunks: &ChunkBuffer,
        client: &mut W,
    ) -> Result<(), RangeError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut delivered = start;
        while delivered < length {
            let data = chunks.take(self.cfg.stall_timeout).await?;
            client
                .write_all(&data)
                .await
                .map_err(RangeError::ClientWrite)?;
            delivered += data.len() as u64;
        }
        client.flush().await.map_err(RangeError::ClientWrite)?;
        debug!("range fetch delivered {} bytes", length - start);
        Ok(())
    }
}

/// Pulls jobs until cancelled. Every unusable outcome puts the
/// untouched span back on the queue; bytes that did arrive are offered
/// to the reassembly buffer as they are read.
async fn worker<S: RangeSource + 'static>(ctx: WorkerCtx<S>, id: usize) {
    loop {
        if ctx.stop.is_cancelled() {
            return;
        }
        if ctx.buffer.below_ceiling().await.is_err() {
            return;
        }
        let Some(mut job) = ctx.queue.pop().await else {
            return;
        };

        let fetched = match job.seed.take() {
            Some(slice) => Ok(slice),
            None => {
                let url = ctx.url.read().await.clone();
                ctx.source.fetch_range(&url, job.start, job.end).await
            }
        };
        let slice = match fetched {
            Ok(slice) => slice,
            Err(err) => {
                warn!("worker {id}: range {}-{}: {err}", job.start, job.end);
                ctx.queue.push(RangeJob::new(job.start, job.end)).await;
                continue;
            }
        };

        if slice.relay_status != StatusCode::OK {
            warn!(
                "worker {id}: relay answered {} for range {}-{}",
                slice.relay_status, job.start, job.end
            );
            ctx.queue.push(RangeJob::new(job.start, job.end)).await;
            continue;
        }
        if let Some(location) = slice.location.as_deref() {
            info!("worker {id}: origin moved to {location}");
            *ctx.url.write().await = location.to_string();
            ctx.queue.push(RangeJob::new(job.start, job.end)).await;
            continue;
        }
        if !slice.status.is_success() {
            warn!(
                "worker {id}: origin answered {} for range {}-{}",
                slice.status, job.start, job.end
            );
            ctx.queue.push(RangeJob::new(job.start, job.end)).await;
            continue;
        }
        if slice.content_range.is_none() {
            warn!(
                "worker {id}: no content range on response for {}-{}",
                job.start, job.end
            );
            ctx.queue.push(RangeJob::new(job.start, job.end)).await;
            continue;
        }

        let mut body = slice.body;
        let mut offset = job.start;
        loop {
            let mut chunk = vec![0u8; ctx.bufsize];
            match body.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    chunk.truncate(n);
                    if ctx.buffer.offer(offset, Bytes::from(chunk)).await.is_err() {
                        return;
                    }
                    offset += n as u64;
                }
                Err(err) => {
                    debug!("worker {id}: body read at {offset} failed: {err}");
                    break;
                }
            }
        }
        if offset <= job.end {
            debug!(
                "worker {id}: requeueing {}-{} after short body",
                offset, job.end
            );
            ctx.queue.push(RangeJob::new(offset, job.end)).await;
        }
    }
}

fn range_value(start: u64, end: u64, total: u64) -> HeaderValue {
    HeaderValue::try_from(format!("bytes {start}-{end}/{total}"))
        .unwrap_or(HeaderValue::from_static("bytes */*"))
}
