use std::convert::Infallible;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use serde::Deserialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ApiError, ApiErrorKind, ScrapeError};
use crate::executor::{AwaitSummary, TaskExecutor};
use crate::provider::AccountProvider;
use crate::registry::{desired_intervals, NamespaceConfig, TaskRegistry};
use crate::task::UpdateSummary;
use crate::InstallError;

/// Shortest period the scheduler will tick at.
const MIN_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Time between scheduling ticks, at least one second.
    pub period: Duration,
    /// Time before the first tick.
    pub initial_delay: Duration,
    /// How long a tick waits on the account provider, and a dispatch on each task.
    pub await_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            period: Duration::from_secs(60),
            initial_delay: Duration::from_secs(5),
            await_timeout: Duration::from_secs(30),
        }
    }
}

/// Outcome of dispatching one tick's tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub tasks: usize,
    pub awaited: AwaitSummary,
    pub skipped: usize,
    pub failed_batches: usize,
    pub samples: usize,
}

/// Periodic trigger: reconcile the registry, then fan every live task out to the executor.
pub struct Scheduler {
    cxl: CancellationToken,
    config: SchedulerConfig,
    namespaces: Vec<NamespaceConfig>,

    accounts: Arc<dyn AccountProvider>,
    registry: Arc<TaskRegistry>,
    executor: TaskExecutor,
    pending: FuturesUnordered<BoxFuture<'static, DispatchReport>>,
    consecutive_account_failures: u64,
}

impl Scheduler {
    #[must_use]
    pub fn new(
        cxl: CancellationToken,
        config: SchedulerConfig,
        namespaces: Vec<NamespaceConfig>,
        accounts: Arc<dyn AccountProvider>,
        registry: Arc<TaskRegistry>,
        executor: TaskExecutor,
    ) -> Self {
        Scheduler {
            cxl,
            config,
            namespaces,

            accounts,
            registry,
            executor,
            pending: FuturesUnordered::default(),
            consecutive_account_failures: 0,
        }
    }

    /// Runs the scheduler on a dedicated thread backed by a `workers`-thread runtime.
    pub(crate) fn spawn(self, workers: usize) -> Result<JoinHandle<()>, InstallError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(workers.max(1))
            .thread_name("MetricsScrapeWorker")
            .enable_all()
            .build()
            .map_err(InstallError::Runtime)?;

        std::thread::Builder::new()
            .name("MetricsScrape".to_string())
            .spawn(move || runtime.block_on(self.run()))
            .map_err(InstallError::SpawnThread)
    }

    pub async fn run(mut self) {
        let start = tokio::time::Instant::now()
            .checked_add(self.config.initial_delay)
            .unwrap_or_else(tokio::time::Instant::now);
        let period = match self.config.period {
            period if period < MIN_PERIOD => {
                warn!(period_ms = period.as_millis(), "Scheduler period too short, clamping");

                MIN_PERIOD
            }
            period => period,
        };
        let mut interval = tokio::time::interval_at(start, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                () = self.cxl.cancelled() => break,
                _ = interval.tick() => {
                    self.tick().await;
                }

                Some(report) = self.pending.next() => Self::report(&report),
            }
        }
    }

    /// Reconciles against the current account snapshot and dispatches every live task.
    ///
    /// Returns the number of tasks dispatched.
    pub async fn tick(&mut self) -> usize {
        let accounts =
            match tokio::time::timeout(self.config.await_timeout, self.accounts.accounts()).await {
                Ok(accounts) => accounts.map_err(ScrapeError::Accounts),
                Err(_) => Err(ScrapeError::Accounts(ApiError::new(
                    ApiErrorKind::Timeout,
                    "account provider did not respond",
                ))),
            };
        match accounts {
            Ok(accounts) => {
                self.consecutive_account_failures = 0;
                self.registry
                    .reconcile(&accounts, &desired_intervals(&self.namespaces));
            }
            Err(err) => {
                self.consecutive_account_failures =
                    self.consecutive_account_failures.saturating_add(1);
                warn!(
                    %err,
                    failures = self.consecutive_account_failures,
                    "Account refresh failed, keeping current tasks"
                );
            }
        }

        // Dispatch reads a snapshot taken after reconciliation completed.
        let tasks = self.registry.snapshot();
        let submissions: Vec<_> = tasks
            .into_iter()
            .map(|task| {
                self.executor.submit(task.tenant_context(), async move {
                    Ok::<_, Infallible>(task.update().await)
                })
            })
            .collect();
        let dispatched = submissions.len();

        let timeout = self.config.await_timeout;
        self.pending.push(
            async move {
                let mut updates = Vec::with_capacity(dispatched);
                let awaited =
                    TaskExecutor::await_all(submissions, timeout, |update: UpdateSummary| {
                        updates.push(update);
                    })
                    .await;

                DispatchReport {
                    tasks: dispatched,
                    awaited,
                    skipped: updates.iter().filter(|update| update.skipped).count(),
                    failed_batches: updates.iter().map(|update| update.failed_batches).sum(),
                    samples: updates.iter().map(|update| update.samples).sum(),
                }
            }
            .boxed(),
        );

        dispatched
    }

    fn report(report: &DispatchReport) {
        if report.awaited.timed_out > 0 || report.skipped > 0 || report.failed_batches > 0 {
            warn!(
                tasks = report.tasks,
                timed_out = report.awaited.timed_out,
                skipped = report.skipped,
                failed_batches = report.failed_batches,
                "Scrape dispatch degraded"
            );
        } else {
            debug!(tasks = report.tasks, samples = report.samples, "Scrape dispatch complete");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::error::{ApiError, ApiErrorKind};
    use crate::executor::ExecutorConfig;
    use crate::model::{AccountRef, ScrapeKey};
    use crate::provider::TaskCollectors;
    use crate::recorder::ScrapeRecorder;
    use crate::task::tests::{deps, query, MockApi};
    use crate::task::TaskConfig;

    /// Serves the configured result; `None` never answers.
    struct Accounts(Mutex<Option<Result<Vec<AccountRef>, ApiError>>>);

    impl Accounts {
        fn set(&self, accounts: Result<Vec<AccountRef>, ApiError>) {
            *self.0.lock().unwrap() = Some(accounts);
        }

        fn hang(&self) {
            *self.0.lock().unwrap() = None;
        }
    }

    impl AccountProvider for Accounts {
        fn accounts(&self) -> BoxFuture<'_, Result<Vec<AccountRef>, ApiError>> {
            let accounts = self.0.lock().unwrap().clone();

            async move {
                match accounts {
                    Some(accounts) => accounts,
                    None => std::future::pending().await,
                }
            }
            .boxed()
        }
    }

    fn account(id: &str) -> AccountRef {
        AccountRef {
            account_id: id.to_string(),
            role_arn: None,
            tenant: Some(format!("tenant-{id}")),
            regions: vec!["us-east-1".to_string()],
        }
    }

    struct Harness {
        scheduler: Scheduler,
        accounts: Arc<Accounts>,
        registry: Arc<TaskRegistry>,
        api: Arc<MockApi>,
        cxl: CancellationToken,
    }

    fn harness(initial: Vec<AccountRef>) -> Harness {
        harness_with(initial, SchedulerConfig::default())
    }

    fn harness_with(initial: Vec<AccountRef>, config: SchedulerConfig) -> Harness {
        let cxl = CancellationToken::new();
        let api = Arc::new(MockApi::default());
        let accounts = Arc::new(Accounts(Mutex::new(Some(Ok(initial)))));
        let registry = Arc::new(TaskRegistry::new(
            deps(vec![query("AWS/SQS", "m0")], api.clone(), &ScrapeRecorder::new()),
            TaskConfig::default(),
            Arc::new(TaskCollectors::new()),
        ));
        let scheduler = Scheduler::new(
            cxl.clone(),
            config,
            vec![NamespaceConfig {
                namespace: "AWS/SQS".to_string(),
                interval: Duration::from_secs(60),
                delay: Duration::ZERO,
                enabled: true,
            }],
            accounts.clone(),
            registry.clone(),
            TaskExecutor::new(&ExecutorConfig::default()),
        );

        Harness { scheduler, accounts, registry, api, cxl }
    }

    fn accounts_called(api: &MockApi) -> Vec<String> {
        let mut accounts: Vec<_> = api
            .requests
            .lock()
            .unwrap()
            .iter()
            .map(|request| request.account_id.clone())
            .collect();
        accounts.sort();

        accounts
    }

    #[tokio::test(start_paused = true)]
    async fn tick_reconciles_then_dispatches() {
        let mut h = harness(vec![account("a"), account("b")]);

        assert_eq!(h.scheduler.tick().await, 2);
        let report = h.scheduler.pending.next().await.unwrap();

        assert_eq!(report.awaited.delivered, 2);
        assert_eq!(report.samples, 2);
        assert_eq!(accounts_called(&h.api), vec!["a", "b"]);
        assert_eq!(
            h.registry.keys(),
            vec![ScrapeKey::new("a", "us-east-1", 60), ScrapeKey::new("b", "us-east-1", 60)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn removed_account_is_no_longer_dispatched() {
        let mut h = harness(vec![account("a"), account("b")]);
        h.scheduler.tick().await;
        h.scheduler.pending.next().await;

        h.accounts.set(Ok(vec![account("a")]));
        assert_eq!(h.scheduler.tick().await, 1);
        h.scheduler.pending.next().await;

        assert_eq!(accounts_called(&h.api), vec!["a", "a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn account_failure_keeps_dispatching_existing_tasks() {
        let mut h = harness(vec![account("a")]);
        h.scheduler.tick().await;
        h.scheduler.pending.next().await;

        h.accounts.set(Err(ApiError::new(ApiErrorKind::AccessDenied, "expired")));
        assert_eq!(h.scheduler.tick().await, 1);
        h.scheduler.pending.next().await;

        assert_eq!(h.scheduler.consecutive_account_failures, 1);
        assert_eq!(h.api.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn run_honors_initial_delay_and_period() {
        let h = harness(vec![account("a")]);
        let api = h.api.clone();
        let cxl = h.cxl.clone();
        let running = tokio::spawn(h.scheduler.run());

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(api.calls(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(api.calls(), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(api.calls(), 2);

        cxl.cancel();
        running.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_account_provider_does_not_stall_tick() {
        let mut h = harness(vec![account("a")]);
        h.scheduler.tick().await;
        h.scheduler.pending.next().await;

        h.accounts.hang();
        let started = tokio::time::Instant::now();
        assert_eq!(h.scheduler.tick().await, 1);
        h.scheduler.pending.next().await;

        assert_eq!(started.elapsed(), SchedulerConfig::default().await_timeout);
        assert_eq!(h.scheduler.consecutive_account_failures, 1);
        assert_eq!(h.api.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_period_is_clamped() {
        let h = harness_with(
            vec![account("a")],
            SchedulerConfig { period: Duration::ZERO, ..SchedulerConfig::default() },
        );
        let api = h.api.clone();
        let cxl = h.cxl.clone();
        let running = tokio::spawn(h.scheduler.run());

        tokio::time::sleep(Duration::from_millis(5_500)).await;
        assert_eq!(api.calls(), 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(api.calls(), 2);

        cxl.cancel();
        running.await.unwrap();
    }
}
