use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::{sleep, Instant};
use tracing::warn;

use crate::errors::AppResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Succeeded,
    Skipped(String),
}

/// Running tally for one batch. Threaded through the runner by value so the
/// caller owns the accumulator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchCounters {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl BatchCounters {
    pub fn record_success(&mut self) {
        self.processed += 1;
        self.succeeded += 1;
    }

    pub fn record_failure(&mut self) {
        self.processed += 1;
        self.failed += 1;
    }

    pub fn record_skip(&mut self) {
        self.processed += 1;
        self.skipped += 1;
    }

    pub fn is_balanced(&self) -> bool {
        self.processed == self.succeeded + self.failed + self.skipped
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchProgress {
    pub counters: BatchCounters,
    pub remaining: usize,
}

/// Pagination state for fetch-until-exhausted loops. Pages are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PageCursor {
    pub page: usize,
    pub page_size: usize,
    pub fetched: usize,
    max_pages: Option<usize>,
    exhausted: bool,
}

impl PageCursor {
    pub fn new(page_size: usize, max_pages: Option<usize>) -> Self {
        Self {
            page: 1,
            page_size: page_size.max(1),
            fetched: 0,
            max_pages,
            exhausted: false,
        }
    }

    /// Whether another page should be requested.
    pub fn has_next(&self) -> bool {
        if self.exhausted {
            return false;
        }
        match self.max_pages {
            Some(cap) => self.page <= cap,
            None => true,
        }
    }

    /// Records a fetched page and moves to the next one. An empty page, a
    /// reached total, or the last reported page ends the iteration.
    pub fn advance(&mut self, page_len: usize, total: usize, total_pages: usize) {
        self.fetched += page_len;
        let reached_total = total > 0 && self.fetched >= total;
        let reached_last_page = total_pages > 0 && self.page >= total_pages;
        if page_len == 0 || reached_total || reached_last_page {
            self.exhausted = true;
        }
        self.page += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchRunState {
    pub counters: BatchCounters,
    pub cursor: PageCursor,
}

impl BatchRunState {
    pub fn new(page_size: usize, max_pages: Option<usize>) -> Self {
        Self {
            counters: BatchCounters::default(),
            cursor: PageCursor::new(page_size, max_pages),
        }
    }
}

/// Runs an async action over a list, one item at a time, with a fixed pause
/// between items. The pause spans calls to [`BatchRunner::run`], so a paged
/// job that runs once per page is paced the same as a single list.
#[derive(Clone)]
pub struct BatchRunner {
    delay: Duration,
    stop: Arc<AtomicBool>,
    last_finished: Arc<Mutex<Option<Instant>>>,
}

impl BatchRunner {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            stop: Arc::new(AtomicBool::new(false)),
            last_finished: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    // Time already spent since the previous item (a page fetch, say) counts
    // toward the pause.
    async fn pace(&self) {
        if self.delay.is_zero() {
            return;
        }
        let previous = *self.last_finished.lock();
        if let Some(prev) = previous {
            let elapsed = prev.elapsed();
            if elapsed < self.delay {
                sleep(self.delay - elapsed).await;
            }
        }
    }

    /// Items are processed strictly in order; an `Err` from the action counts
    /// as a failure and the loop carries on. The stop flag is only checked
    /// between items.
    pub async fn run<T, F, Fut>(
        &self,
        mut counters: BatchCounters,
        items: Vec<T>,
        mut action: F,
        observer: Option<&(dyn Fn(BatchProgress) + Send + Sync)>,
    ) -> BatchCounters
    where
        F: FnMut(T) -> Fut,
        Fut: Future<Output = AppResult<ItemOutcome>>,
    {
        let total = items.len();
        for (index, item) in items.into_iter().enumerate() {
            if self.stop_requested() {
                warn!(remaining = total - index, "batch stopped before completion");
                break;
            }
            self.pace().await;

            let outcome = action(item).await;
            *self.last_finished.lock() = Some(Instant::now());
            match outcome {
                Ok(ItemOutcome::Succeeded) => counters.record_success(),
                Ok(ItemOutcome::Skipped(_)) => counters.record_skip(),
                Err(err) => {
                    warn!(?err, index, "batch item failed");
                    counters.record_failure();
                }
            }

            if let Some(callback) = observer {
                callback(BatchProgress {
                    counters,
                    remaining: total - index - 1,
                });
            }
        }
        counters
    }
}
