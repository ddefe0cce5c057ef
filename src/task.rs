use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwap;
use itertools::Itertools;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::ScrapeError;
use crate::model::{
    AccountRef, IdentifiedQuery, MetricDataRequest, MetricQuery, RateLimitKey, Sample,
    SampleFamily, ScrapeKey, TimeWindow,
};
use crate::provider::{MetricsApi, QueryProvider, SampleBuilder, TimeWindows};
use crate::rate_limit::{CallLabels, RateLimiter};
use crate::tenant::TenantContext;

pub const GET_METRIC_DATA: &str = "GetMetricData";
/// Maximum queries the API accepts in one request.
pub const MAX_BATCH_SIZE: usize = 500;

const DAILY_PERIOD_SECS: u32 = 86_400;
const DAILY_WINDOW_SECS: u64 = 2 * 86_400;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Queries per request, clamped to `1..=MAX_BATCH_SIZE`.
    pub batch_size: usize,
    /// Pages fetched per batch before giving up on the continuation token.
    pub max_pages: usize,
    /// How long samples of daily-resolution metrics are reused before refetching.
    pub daily_refresh: Duration,
}

impl Default for TaskConfig {
    fn default() -> Self {
        TaskConfig {
            batch_size: MAX_BATCH_SIZE,
            max_pages: 100,
            daily_refresh: Duration::from_secs(3600),
        }
    }
}

impl TaskConfig {
    fn batch_size(&self) -> usize {
        self.batch_size.clamp(1, MAX_BATCH_SIZE)
    }
}

/// Collaborators a task needs to run.
#[derive(Clone)]
pub struct TaskDeps {
    pub queries: Arc<dyn QueryProvider>,
    pub api: Arc<dyn MetricsApi>,
    pub samples: Arc<dyn SampleBuilder>,
    pub windows: Arc<dyn TimeWindows>,
    pub limiter: Arc<RateLimiter>,
}

/// Metrics the API only reports once a day, regardless of the configured interval.
#[must_use]
pub fn is_daily_metric(namespace: &str, metric_name: &str) -> bool {
    matches!(
        (namespace, metric_name),
        ("AWS/S3", "BucketSizeBytes" | "NumberOfObjects")
    )
}

/// What one `update()` did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateSummary {
    pub samples: usize,
    pub batches: usize,
    pub failed_batches: usize,
    pub truncated_batches: usize,
    pub pages: usize,
    /// The update did not run (task retired or previous update still running).
    pub skipped: bool,
}

impl UpdateSummary {
    fn skipped() -> Self {
        UpdateSummary { skipped: true, ..UpdateSummary::default() }
    }
}

struct DailyCache {
    fetched_at: Instant,
    queries: Vec<MetricQuery>,
    samples: Vec<Sample>,
}

/// Polls one `(account, region, interval)` and holds its last published samples.
pub struct ScrapeTask {
    key: ScrapeKey,
    account: AccountRef,
    delay: Duration,
    config: TaskConfig,
    deps: TaskDeps,

    snapshot: ArcSwap<Vec<SampleFamily>>,
    daily: Mutex<Option<DailyCache>>,
    running: tokio::sync::Mutex<()>,
    retired: AtomicBool,
}

impl ScrapeTask {
    #[must_use]
    pub fn new(
        key: ScrapeKey,
        account: AccountRef,
        delay: Duration,
        config: TaskConfig,
        deps: TaskDeps,
    ) -> Self {
        ScrapeTask {
            key,
            account,
            delay,
            config,
            deps,

            snapshot: ArcSwap::from_pointee(Vec::new()),
            daily: Mutex::new(None),
            running: tokio::sync::Mutex::new(()),
            retired: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn key(&self) -> &ScrapeKey {
        &self.key
    }

    #[must_use]
    pub fn tenant_context(&self) -> TenantContext {
        TenantContext::new(self.key.account_id.clone(), self.account.tenant.clone())
    }

    /// Stops the task from running again; an update already in progress completes.
    pub fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// The last fully published snapshot. Never waits on a running update.
    #[must_use]
    pub fn collect(&self) -> Arc<Vec<SampleFamily>> {
        self.snapshot.load_full()
    }

    /// Refreshes the snapshot. Batch failures are logged and skipped; whatever succeeded is
    /// published.
    pub async fn update(&self) -> UpdateSummary {
        if self.is_retired() {
            return UpdateSummary::skipped();
        }
        let Ok(_running) = self.running.try_lock() else {
            warn!(key = %self.key, "Previous update still running, skipping");

            return UpdateSummary::skipped();
        };

        let queries = self.deps.queries.queries_for(&self.key);
        if queries.is_empty() {
            *self.daily.lock().unwrap_or_else(PoisonError::into_inner) = None;
            self.snapshot.store(Arc::new(Vec::new()));

            return UpdateSummary::default();
        }

        let interval = Duration::from_secs(u64::from(self.key.interval_secs));
        let window = self.deps.windows.window(&self.key.region, interval, self.delay);
        let (daily, regular): (Vec<_>, Vec<_>) = queries
            .into_iter()
            .partition(|query| is_daily_metric(&query.namespace, &query.metric_name));

        let mut summary = UpdateSummary::default();
        let mut samples = Vec::new();
        self.run_batches(&regular, window, self.key.interval_secs, &mut samples, &mut summary)
            .await;
        self.daily_samples(daily, window, &mut samples, &mut summary)
            .await;

        summary.samples = samples.len();
        self.snapshot.store(Arc::new(into_families(samples)));
        debug!(
            key = %self.key,
            summary.samples,
            summary.batches,
            summary.failed_batches,
            "Update published"
        );

        summary
    }

    /// Daily-resolution queries are refetched only once the cached result is older than
    /// `daily_refresh` or the query set changed.
    async fn daily_samples(
        &self,
        queries: Vec<MetricQuery>,
        window: TimeWindow,
        out: &mut Vec<Sample>,
        summary: &mut UpdateSummary,
    ) {
        if queries.is_empty() {
            *self.daily.lock().unwrap_or_else(PoisonError::into_inner) = None;

            return;
        }

        {
            let daily = self.daily.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(cache) = daily.as_ref() {
                if cache.queries == queries && cache.fetched_at.elapsed() < self.config.daily_refresh
                {
                    out.extend(cache.samples.iter().cloned());

                    return;
                }
            }
        }

        let daily_window = TimeWindow {
            start_secs: window.end_secs.saturating_sub(DAILY_WINDOW_SECS),
            end_secs: window.end_secs,
        };
        let failed_before = summary.failed_batches;
        let mut fetched = Vec::new();
        self.run_batches(&queries, daily_window, DAILY_PERIOD_SECS, &mut fetched, summary)
            .await;

        // Only a complete fetch is reused; partial results are retried next cycle.
        if summary.failed_batches == failed_before {
            *self.daily.lock().unwrap_or_else(PoisonError::into_inner) = Some(DailyCache {
                fetched_at: Instant::now(),
                queries,
                samples: fetched.clone(),
            });
        }
        out.extend(fetched);
    }

    #[allow(clippy::arithmetic_side_effects)]
    async fn run_batches(
        &self,
        queries: &[MetricQuery],
        window: TimeWindow,
        period_secs: u32,
        out: &mut Vec<Sample>,
        summary: &mut UpdateSummary,
    ) {
        for (index, batch) in queries.chunks(self.config.batch_size()).enumerate() {
            summary.batches += 1;

            if let Err(err) = self
                .run_batch(batch, window, period_secs, out, summary)
                .await
            {
                summary.failed_batches += 1;
                warn!(key = %self.key, batch = index, %err, "Batch failed, continuing");
            }
        }
    }

    /// Pages through one batch, appending samples as each page arrives.
    #[allow(clippy::arithmetic_side_effects)]
    async fn run_batch(
        &self,
        batch: &[MetricQuery],
        window: TimeWindow,
        period_secs: u32,
        out: &mut Vec<Sample>,
        summary: &mut UpdateSummary,
    ) -> Result<(), ScrapeError> {
        let queries: Vec<_> = batch
            .iter()
            .enumerate()
            .map(|(index, query)| IdentifiedQuery { id: format!("q{index}"), query: query.clone() })
            .collect();
        let rate_key =
            RateLimitKey::new(self.key.account_id.as_str(), self.key.region.as_str(), GET_METRIC_DATA);
        let labels = CallLabels {
            account_id: self.key.account_id.clone(),
            region: self.key.region.clone(),
            operation: GET_METRIC_DATA.to_string(),
            tenant: self.account.tenant.clone(),
        };

        let mut next_token = None;
        for _ in 0..self.config.max_pages.max(1) {
            let request = MetricDataRequest {
                account_id: self.key.account_id.clone(),
                region: self.key.region.clone(),
                role_arn: self.account.role_arn.clone(),
                window,
                period_secs,
                queries: queries.clone(),
                next_token: next_token.take(),
            };
            let page = self
                .deps
                .limiter
                .guard(&rate_key, &labels, || self.deps.api.get_metric_data(request))
                .await?;
            summary.pages += 1;

            for result in &page.results {
                match query_index(&result.id).and_then(|index| batch.get(index)) {
                    Some(query) => out.extend(self.deps.samples.build(query, result)),
                    None => warn!(key = %self.key, id = %result.id, "Result for unknown query id"),
                }
            }

            match page.next_token {
                Some(token) => next_token = Some(token),
                None => return Ok(()),
            }
        }

        summary.truncated_batches += 1;
        warn!(
            key = %self.key,
            max_pages = self.config.max_pages,
            "Pagination truncated, continuation token dropped"
        );

        Ok(())
    }
}

fn query_index(id: &str) -> Option<usize> {
    id.strip_prefix('q')?.parse().ok()
}

fn into_families(samples: Vec<Sample>) -> Vec<SampleFamily> {
    samples
        .into_iter()
        .sorted_by(|a, b| a.name.cmp(&b.name))
        .chunk_by(|sample| sample.name.clone())
        .into_iter()
        .map(|(name, samples)| SampleFamily { name, samples: samples.collect() })
        .collect()
}
