use std::any::Any;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::tenant::TenantContext;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Units of work allowed to run at once.
    pub workers: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig { workers: 8 }
    }
}

/// Bounded pool running units of work under their tenant's context.
#[derive(Debug, Clone)]
pub struct TaskExecutor {
    permits: Arc<Semaphore>,
}

/// Handle to one submitted unit of work.
#[derive(Debug)]
pub struct Submission<T> {
    tenant: TenantContext,
    handle: JoinHandle<T>,
}

/// Outcome counts of one [`TaskExecutor::await_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AwaitSummary {
    pub delivered: usize,
    pub timed_out: usize,
    pub failed: usize,
}

impl TaskExecutor {
    #[must_use]
    pub fn new(config: &ExecutorConfig) -> Self {
        TaskExecutor { permits: Arc::new(Semaphore::new(config.workers.max(1))) }
    }

    /// Runs `task` on the pool with `tenant` as the ambient context.
    ///
    /// A failing or panicking task is logged and resolves to `T::default()`, so sibling
    /// submissions are never affected.
    pub fn submit<T, E, F>(&self, tenant: TenantContext, task: F) -> Submission<T>
    where
        T: Default + Send + 'static,
        E: Display + Send + 'static,
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let ctx = tenant.clone();

        let handle = tokio::spawn(async move {
            // The pool's semaphore is never closed.
            let Ok(_permit) = permits.acquire_owned().await else {
                return T::default();
            };
            let account_id = ctx.account_id.clone();

            match AssertUnwindSafe(ctx.scope(task)).catch_unwind().await {
                Ok((Ok(value), calls)) => {
                    debug!(%account_id, ?calls, "Task complete");

                    value
                }
                Ok((Err(err), calls)) => {
                    error!(%account_id, %err, ?calls, "Task failed");

                    T::default()
                }
                Err(panic) => {
                    error!(%account_id, panic = panic_message(panic.as_ref()), "Task panicked");

                    T::default()
                }
            }
        });

        Submission { tenant, handle }
    }

    /// Waits on each submission in turn for at most `per_item`, handing results to `consumer`.
    ///
    /// Timed-out submissions are abandoned, not cancelled; they may still complete later.
    #[allow(clippy::arithmetic_side_effects)]
    pub async fn await_all<T, C>(
        submissions: Vec<Submission<T>>,
        per_item: Duration,
        mut consumer: C,
    ) -> AwaitSummary
    where
        C: FnMut(T),
    {
        let mut summary = AwaitSummary::default();

        for Submission { tenant, handle } in submissions {
            match tokio::time::timeout(per_item, handle).await {
                Ok(Ok(value)) => {
                    summary.delivered += 1;
                    consumer(value);
                }
                Ok(Err(err)) => {
                    summary.failed += 1;
                    warn!(account_id = %tenant.account_id, %err, "Submission did not complete");
                }
                Err(_) => {
                    summary.timed_out += 1;
                    warn!(
                        account_id = %tenant.account_id,
                        timeout_ms = per_item.as_millis(),
                        "Submission timed out, skipping"
                    );
                }
            }
        }

        summary
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic>")
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn tenant(account_id: &str) -> TenantContext {
        TenantContext::new(account_id, Some(format!("tenant-{account_id}")))
    }

    async fn collect<T>(submissions: Vec<Submission<T>>) -> (Vec<T>, AwaitSummary) {
        let mut out = Vec::new();
        let summary =
            TaskExecutor::await_all(submissions, Duration::from_secs(30), |value| out.push(value))
                .await;

        (out, summary)
    }

    #[tokio::test]
    async fn body_runs_under_its_tenant() {
        let executor = TaskExecutor::new(&ExecutorConfig { workers: 1 });

        let submissions = ["a", "b"]
            .into_iter()
            .map(|account| {
                executor.submit(tenant(account), async {
                    Ok::<_, String>(TenantContext::current().map(|ctx| ctx.account_id))
                })
            })
            .collect();
        let (seen, _) = collect(submissions).await;

        assert_eq!(seen, vec![Some("a".to_string()), Some("b".to_string())]);
        assert_eq!(TenantContext::current(), None);
    }

    #[tokio::test]
    async fn failure_resolves_to_default() {
        let executor = TaskExecutor::new(&ExecutorConfig::default());

        let submissions = vec![
            executor.submit(tenant("a"), async { Ok::<u32, String>(7) }),
            executor.submit(tenant("b"), async { Err::<u32, _>("provider down".to_string()) }),
        ];
        let (values, summary) = collect(submissions).await;

        assert_eq!(values, vec![7, 0]);
        assert_eq!(summary, AwaitSummary { delivered: 2, timed_out: 0, failed: 0 });
    }

    #[tokio::test]
    async fn panic_resolves_to_default_and_clears_context() {
        let executor = TaskExecutor::new(&ExecutorConfig { workers: 1 });

        let submissions = vec![
            executor.submit(tenant("a"), async {
                if TenantContext::current().is_some() {
                    panic!("boom");
                }
                Ok::<Option<String>, String>(None)
            }),
            executor.submit(tenant("b"), async {
                Ok::<_, String>(TenantContext::current().map(|ctx| ctx.account_id))
            }),
        ];
        let (values, _) = collect(submissions).await;

        assert_eq!(values, vec![None, Some("b".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn pool_bounds_concurrency() {
        let executor = TaskExecutor::new(&ExecutorConfig { workers: 2 });
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let submissions = (0..6)
            .map(|i| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);

                executor.submit(tenant(&i.to_string()), async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    running.fetch_sub(1, Ordering::SeqCst);

                    Ok::<_, String>(i)
                })
            })
            .collect();
        let (values, _) = collect(submissions).await;

        assert_eq!(values, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_submission_is_skipped() {
        let executor = TaskExecutor::new(&ExecutorConfig::default());

        let submissions = vec![
            executor.submit(tenant("a"), async { Ok::<_, String>(1) }),
            executor.submit(tenant("b"), async {
                std::future::pending::<()>().await;

                Ok::<_, String>(2)
            }),
            executor.submit(tenant("c"), async { Ok::<_, String>(3) }),
        ];
        let (values, summary) = collect(submissions).await;

        assert_eq!(values, vec![1, 3]);
        assert_eq!(summary, AwaitSummary { delivered: 2, timed_out: 1, failed: 0 });
    }
}
