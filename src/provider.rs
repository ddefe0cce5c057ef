//! Collaborators the scrape core consumes or feeds.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, UNIX_EPOCH};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::time::Instant;
use tracing::warn;

use crate::error::{ApiError, RegisterError};
use crate::model::{
    AccountRef, MetricDataPage, MetricDataRequest, MetricDataResult, MetricQuery, Sample,
    SampleFamily, ScrapeKey, TimeWindow,
};
use crate::task::ScrapeTask;

/// Source of the monitored account fleet.
pub trait AccountProvider: Send + Sync {
    fn accounts(&self) -> BoxFuture<'_, Result<Vec<AccountRef>, ApiError>>;
}

/// Resolves the queries one task should issue.
pub trait QueryProvider: Send + Sync {
    fn queries_for(&self, key: &ScrapeKey) -> Vec<MetricQuery>;
}

/// Turns one per-query result into output samples.
pub trait SampleBuilder: Send + Sync {
    fn build(&self, query: &MetricQuery, result: &MetricDataResult) -> Vec<Sample>;
}

/// The monitored API's paginated batch-query call.
pub trait MetricsApi: Send + Sync {
    fn get_metric_data(
        &self,
        request: MetricDataRequest,
    ) -> BoxFuture<'_, Result<MetricDataPage, ApiError>>;
}

/// Computes the query window for a region.
pub trait TimeWindows: Send + Sync {
    fn window(&self, region: &str, interval: Duration, delay: Duration) -> TimeWindow;
}

/// Where tasks are registered for collection by the exposition layer.
pub trait CollectorRegistry: Send + Sync {
    /// # Errors
    ///
    /// Implementations may refuse a registration; the task is then not scheduled.
    fn register(&self, task: Arc<ScrapeTask>) -> Result<(), RegisterError>;
    fn unregister(&self, key: &ScrapeKey);
}

/// Wall-clock windows with the end aligned down to a period boundary.
///
/// The monitoring API reports in UTC for every region, so the region does not shift the window.
#[derive(Debug, Clone, Copy)]
pub struct AlignedWindows {
    pub align_secs: u64,
}

impl Default for AlignedWindows {
    fn default() -> Self {
        AlignedWindows { align_secs: 60 }
    }
}

impl AlignedWindows {
    #[must_use]
    pub const fn window_at(&self, now_secs: u64, interval: Duration, delay: Duration) -> TimeWindow {
        let raw = TimeWindow::trailing(now_secs, interval.as_secs(), delay.as_secs());
        let Some(offset) = raw.end_secs.checked_rem(self.align_secs) else {
            return raw;
        };
        let end_secs = raw.end_secs.saturating_sub(offset);

        TimeWindow { start_secs: end_secs.saturating_sub(interval.as_secs()), end_secs }
    }
}

impl TimeWindows for AlignedWindows {
    fn window(&self, _: &str, interval: Duration, delay: Duration) -> TimeWindow {
        let now_secs = UNIX_EPOCH.elapsed().unwrap_or_default().as_secs();

        self.window_at(now_secs, interval, delay)
    }
}

/// Time-bounded cache in front of an [`AccountProvider`].
///
/// Serves the previous snapshot, with a warning, when a refresh fails.
pub struct CachedAccounts<P> {
    inner: P,
    ttl: Duration,
    cached: tokio::sync::Mutex<Option<(Instant, Arc<Vec<AccountRef>>)>>,
}

impl<P> CachedAccounts<P>
where
    P: AccountProvider,
{
    pub fn new(inner: P, ttl: Duration) -> Self {
        CachedAccounts { inner, ttl, cached: tokio::sync::Mutex::new(None) }
    }

    async fn get(&self) -> Result<Vec<AccountRef>, ApiError> {
        let mut cached = self.cached.lock().await;
        if let Some((fetched_at, accounts)) = cached.as_ref() {
            if fetched_at.elapsed() < self.ttl {
                return Ok(accounts.as_ref().clone());
            }
        }

        match self.inner.accounts().await {
            Ok(accounts) => {
                *cached = Some((Instant::now(), Arc::new(accounts.clone())));

                Ok(accounts)
            }
            Err(err) => match cached.as_ref() {
                Some((_, stale)) => {
                    warn!(%err, "Account refresh failed, serving stale snapshot");

                    Ok(stale.as_ref().clone())
                }
                None => Err(err),
            },
        }
    }
}

impl<P> AccountProvider for CachedAccounts<P>
where
    P: AccountProvider,
{
    fn accounts(&self) -> BoxFuture<'_, Result<Vec<AccountRef>, ApiError>> {
        self.get().boxed()
    }
}

/// In-process [`CollectorRegistry`] the exposition layer can read from.
#[derive(Default)]
pub struct TaskCollectors {
    tasks: Mutex<BTreeMap<ScrapeKey, Arc<ScrapeTask>>>,
}

impl TaskCollectors {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn keys(&self) -> Vec<ScrapeKey> {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Last published snapshot of every registered task, merged by metric name.
    #[must_use]
    pub fn collect(&self) -> Vec<SampleFamily> {
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut merged: BTreeMap<String, Vec<Sample>> = BTreeMap::new();
        for task in tasks {
            for family in task.collect().iter() {
                merged
                    .entry(family.name.clone())
                    .or_default()
                    .extend(family.samples.iter().cloned());
            }
        }

        merged
            .into_iter()
            .map(|(name, samples)| SampleFamily { name, samples })
            .collect()
    }
}

impl CollectorRegistry for TaskCollectors {
    fn register(&self, task: Arc<ScrapeTask>) -> Result<(), RegisterError> {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if tasks.contains_key(task.key()) {
            return Err(RegisterError {
                key: task.key().clone(),
                reason: "already registered".to_string(),
            });
        }
        tasks.insert(task.key().clone(), task);

        Ok(())
    }

    fn unregister(&self, key: &ScrapeKey) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}
