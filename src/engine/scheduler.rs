use std::future::Future;
use std::time::Duration;

use log::{error, info, warn};
use tokio::time::{Instant, sleep_until};

use crate::config::FeedSpec;
use crate::engine::downloader::AssetFetcher;
use crate::engine::models::CycleReport;
use crate::engine::pipeline::Pipeline;
use crate::engine::pruner::InUse;
use crate::engine::source::ManifestSource;
use crate::error::Result;

/// Anything that can run one cycle of a feed.
pub trait FeedCycle {
    async fn run_cycle(&self, feed: &FeedSpec) -> Result<CycleReport>;
}

impl<S, A, U> FeedCycle for Pipeline<S, A, U>
where
    S: ManifestSource,
    A: AssetFetcher,
    U: InUse,
{
    async fn run_cycle(&self, feed: &FeedSpec) -> Result<CycleReport> {
        Pipeline::run_cycle(self, feed).await
    }
}

/// Single-threaded poll loop over every feed. Each feed keeps its own due
/// time, so a failing feed only delays itself.
pub struct Scheduler {
    interval: Duration,
    retry_delay: Duration,
}

impl Scheduler {
    pub fn new(interval: Duration, retry_delay: Duration) -> Self {
        Self {
            interval,
            retry_delay,
        }
    }

    /// Normal interval after a clean cycle, the short fallback after an abort.
    pub fn next_delay(&self, feed: &FeedSpec, outcome: &Result<CycleReport>) -> Duration {
        match outcome {
            Ok(_) => feed.interval(self.interval),
            Err(_) => self.retry_delay,
        }
    }

    /// Run until `shutdown` resolves. A cycle in progress is never cut short;
    /// shutdown is only observed between cycles.
    pub async fn run<C, F>(&self, runner: &C, feeds: &[FeedSpec], shutdown: F)
    where
        C: FeedCycle,
        F: Future<Output = ()>,
    {
        if feeds.is_empty() {
            info!("scheduler: no feeds configured");
            return;
        }
        tokio::pin!(shutdown);
        let mut due = vec![Instant::now(); feeds.len()];
        loop {
            let (index, when) = due
                .iter()
                .copied()
                .enumerate()
                .min_by_key(|(_, when)| *when)
                .unwrap_or((0, Instant::now()));
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("scheduler: shutdown requested");
                    return;
                }
                _ = sleep_until(when) => {}
            }

            let feed = &feeds[index];
            let outcome = runner.run_cycle(feed).await;
            let delay = self.next_delay(feed, &outcome);
            match &outcome {
                Err(err) if err.is_transient() => warn!(
                    "feed[{}]: {err}; retrying in {}s",
                    feed.name,
                    delay.as_secs()
                ),
                Err(err) => error!(
                    "feed[{}]: cycle aborted: {err}; retrying in {}s",
                    feed.name,
                    delay.as_secs()
                ),
                Ok(_) => {}
            }
            due[index] = Instant::now() + delay;
        }
    }
}
