//! Read-ahead over a ranged fetch operation.
//!
//! [`PrefetchBuffer`] turns "fetch bytes `[start, end)`" into a sequential
//! stream of fixed-size blocks. Up to `max_queued_blocks` fetches run in the
//! background while the consumer works on earlier blocks; blocks are handed
//! out strictly in offset order. The consumer applies backpressure simply by
//! not polling: once the queue is at its watermark no further fetch is issued
//! until the front block has been taken.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use futures_util::Stream;
use futures_util::future::BoxFuture;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::error::{Error, Result};

type FetchFn = dyn Fn(u64, u64) -> BoxFuture<'static, Result<Bytes>> + Send + Sync;

/// One fetched or in-flight block.
struct PrefetchTask {
    start: u64,
    end: u64,
    handle: JoinHandle<Result<Bytes>>,
}

/// A finite, single-pass stream of blocks covering `[0, total_size)`.
pub struct PrefetchBuffer {
    fetch: Arc<FetchFn>,
    total_size: u64,
    block_size: u64,
    max_queued_blocks: usize,
    next_offset: u64,
    queue: VecDeque<PrefetchTask>,
    finished: bool,
}

impl PrefetchBuffer {
    pub fn new<F, Fut>(total_size: u64, block_size: u64, max_queued_blocks: usize, fetch: F) -> Self
    where
        F: Fn(u64, u64) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes>> + Send + 'static,
    {
        let fetch: Arc<FetchFn> = Arc::new(move |start, end| Box::pin(fetch(start, end)));
        Self {
            fetch,
            total_size,
            block_size: block_size.max(1),
            max_queued_blocks: max_queued_blocks.max(1),
            next_offset: 0,
            queue: VecDeque::new(),
            finished: total_size == 0,
        }
    }

    /// Blocks fetched or being fetched but not yet handed to the consumer.
    pub fn queued_blocks(&self) -> usize {
        self.queue.len()
    }

    /// Stop fetching and drop everything still queued.
    pub fn abort(&mut self) {
        for task in self.queue.drain(..) {
            task.handle.abort();
        }
        self.finished = true;
    }

    fn fill_queue(&mut self) {
        while !self.finished
            && self.queue.len() < self.max_queued_blocks
            && self.next_offset < self.total_size
        {
            let start = self.next_offset;
            let end = start.saturating_add(self.block_size).min(self.total_size);
            trace!(start, end, queued = self.queue.len(), "prefetching block");
            let handle = tokio::spawn((self.fetch)(start, end));
            self.queue.push_back(PrefetchTask { start, end, handle });
            self.next_offset = end;
        }
    }
}

impl Stream for PrefetchBuffer {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        this.fill_queue();

        let Some(front) = this.queue.front_mut() else {
            this.finished = true;
            return Poll::Ready(None);
        };
        let joined = ready!(Pin::new(&mut front.handle).poll(cx));
        let Some(task) = this.queue.pop_front() else {
            return Poll::Ready(None);
        };

        let block = match joined {
            Ok(Ok(bytes)) if bytes.len() as u64 == task.end - task.start => Ok(bytes),
            Ok(Ok(bytes)) => Err(Error::TransientNetwork {
                message: format!(
                    "block [{}, {}) returned {} bytes",
                    task.start,
                    task.end,
                    bytes.len()
                ),
            }),
            Ok(Err(e)) => Err(e),
            Err(join) => Err(Error::permanent(format!("prefetch task failed: {join}"))),
        };
        match block {
            Ok(bytes) => {
                this.fill_queue();
                Poll::Ready(Some(Ok(bytes)))
            }
            Err(e) => {
                this.abort();
                Poll::Ready(Some(Err(e)))
            }
        }
    }
}

impl Drop for PrefetchBuffer {
    fn drop(&mut self) {
        self.abort();
    }
}
