//! Request deadline and bounded fan-out.
//!
//! Every stage that fans out goes through [`collect_until`]: sub-operations
//! run with at most `limit` in flight, results are tagged with their input
//! index, and whatever finished before the deadline is returned sorted by
//! that index. Merges downstream therefore never depend on arrival order.

use futures::stream::{self, StreamExt};
use std::future::Future;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};

/// One overall deadline for a request.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
        }
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    /// Run `fut` until the deadline. `None` means the deadline hit first.
    pub async fn run<F: Future>(&self, fut: F) -> Option<F::Output> {
        timeout_at(self.at, fut).await.ok()
    }
}

/// Results of a fan-out, in input order.
#[derive(Debug)]
pub struct Collected<T> {
    pub items: Vec<(usize, T)>,
    /// Some tasks were still running when the deadline passed.
    pub timed_out: bool,
}

/// Run `tasks` concurrently (at most `limit` at a time) until done or the
/// deadline passes.
pub async fn collect_until<I, F, T>(deadline: &Deadline, limit: usize, tasks: I) -> Collected<T>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = T>,
{
    let mut indexed = Vec::new();
    for (i, fut) in tasks.into_iter().enumerate() {
        indexed.push(async move { (i, fut.await) });
    }
    let mut pending = stream::iter(indexed).buffer_unordered(limit.max(1));

    let mut items = Vec::new();
    let mut timed_out = false;
    loop {
        match deadline.run(pending.next()).await {
            Some(Some(item)) => items.push(item),
            Some(None) => break,
            None => {
                timed_out = true;
                break;
            }
        }
    }
    items.sort_by_key(|(i, _)| *i);
    Collected { items, timed_out }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn results_sorted_by_input_index() {
        let deadline = Deadline::after(Duration::from_secs(5));
        let tasks = (0..5u64).map(|i| async move {
            tokio::time::sleep(Duration::from_millis(50 - i * 10)).await;
            i * 2
        });
        let out = collect_until(&deadline, 5, tasks).await;
        assert!(!out.timed_out);
        let values: Vec<(usize, u64)> = out.items;
        assert_eq!(values, vec![(0, 0), (1, 2), (2, 4), (3, 6), (4, 8)]);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_keeps_completed_results() {
        let deadline = Deadline::after(Duration::from_secs(1));
        let tasks = [10u64, 5_000, 20].into_iter().map(|ms| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            ms
        });
        let out = collect_until(&deadline, 3, tasks).await;
        assert!(out.timed_out);
        assert_eq!(out.items, vec![(0, 10), (2, 20)]);
    }

    #[tokio::test(start_paused = true)]
    async fn run_returns_none_after_deadline() {
        let deadline = Deadline::after(Duration::from_millis(100));
        let slow = deadline.run(tokio::time::sleep(Duration::from_secs(1))).await;
        assert!(slow.is_none());
        assert!(deadline.expired());
    }
}
