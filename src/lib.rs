//! Scrape orchestration for a monitoring API: per-`(account, region, interval)` polling tasks,
//! token-bucket rate limiting, and a tenant-aware bounded executor.

mod atomic_storage;
pub mod error;
pub mod executor;
pub mod model;
pub mod provider;
pub mod rate_limit;
pub mod recorder;
pub mod registry;
pub mod scheduler;
pub mod task;
pub mod tenant;

use std::sync::Arc;
use std::thread::JoinHandle;

use metrics::SetRecorderError;
use serde::Deserialize;
use thiserror::Error;
pub use tokio_util::sync::CancellationToken;

use crate::executor::{ExecutorConfig, TaskExecutor};
use crate::provider::{
    AccountProvider, CollectorRegistry, MetricsApi, QueryProvider, SampleBuilder, TimeWindows,
};
use crate::rate_limit::{ExternalSink, RateLimitConfig, RateLimiter};
use crate::recorder::ScrapeRecorder;
use crate::registry::{NamespaceConfig, TaskRegistry};
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::task::{TaskConfig, TaskDeps};

/// Starts the scrape scheduler on its own thread and installs [`ScrapeRecorder`] as the global
/// metrics recorder.
///
/// # Errors
///
/// Fails if a global recorder is already set, in which case nothing is started, or if the runtime
/// or thread cannot be created.
pub fn install(
    cxl: CancellationToken,
    config: Config,
    collaborators: Collaborators,
) -> Result<JoinHandle<()>, InstallError> {
    let recorder = ScrapeRecorder::new();
    metrics::set_global_recorder(recorder.clone())?;

    let mut limiter = RateLimiter::new(config.rate_limit, recorder.clone(), cxl.clone());
    if let Some(sink) = collaborators.external {
        limiter = limiter.with_external_sink(sink);
    }
    let deps = TaskDeps {
        queries: collaborators.queries,
        api: collaborators.api,
        samples: collaborators.samples,
        windows: collaborators.windows,
        limiter: Arc::new(limiter),
    };
    let registry = Arc::new(TaskRegistry::new(deps, config.task, collaborators.collectors));

    let scheduler = Scheduler::new(
        cxl,
        config.scheduler,
        config.namespaces,
        collaborators.accounts,
        registry,
        TaskExecutor::new(&config.executor),
    );
    scheduler.spawn(config.executor.workers)
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub rate_limit: RateLimitConfig,
    pub executor: ExecutorConfig,
    pub task: TaskConfig,
    pub namespaces: Vec<NamespaceConfig>,
}

/// External systems the scrape core talks to.
pub struct Collaborators {
    pub accounts: Arc<dyn AccountProvider>,
    pub queries: Arc<dyn QueryProvider>,
    pub api: Arc<dyn MetricsApi>,
    pub samples: Arc<dyn SampleBuilder>,
    pub windows: Arc<dyn TimeWindows>,
    pub collectors: Arc<dyn CollectorRegistry>,
    pub external: Option<Arc<dyn ExternalSink>>,
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("Set recorder; err={0}")]
    SetRecorder(#[from] SetRecorderError<ScrapeRecorder>),
    #[error("Spawn thread; err={0}")]
    SpawnThread(#[source] std::io::Error),
    #[error("Build runtime; err={0}")]
    Runtime(#[source] std::io::Error),
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::future::BoxFuture;
    use futures::FutureExt;

    use super::*;
    use crate::error::ApiError;
    use crate::model::AccountRef;
    use crate::provider::TaskCollectors;
    use crate::task::tests::{FixedWindows, MockApi, NamedSamples, StaticQueries};

    struct NoAccounts;

    impl AccountProvider for NoAccounts {
        fn accounts(&self) -> BoxFuture<'_, Result<Vec<AccountRef>, ApiError>> {
            async { Ok(Vec::new()) }.boxed()
        }
    }

    fn collaborators() -> Collaborators {
        Collaborators {
            accounts: Arc::new(NoAccounts),
            queries: Arc::new(StaticQueries(Vec::new())),
            api: Arc::new(MockApi::default()),
            samples: Arc::new(NamedSamples),
            windows: Arc::new(FixedWindows),
            collectors: Arc::new(TaskCollectors::new()),
            external: None,
        }
    }

    #[test]
    fn second_install_is_refused_before_starting() {
        let cxl = CancellationToken::new();
        let handle = install(cxl.clone(), Config::default(), collaborators()).unwrap();

        let err = install(CancellationToken::new(), Config::default(), collaborators()).unwrap_err();
        assert!(matches!(err, InstallError::SetRecorder(_)));

        cxl.cancel();
        handle.join().unwrap();
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();

        assert_eq!(config.scheduler.period, Duration::from_secs(60));
        assert_eq!(config.scheduler.initial_delay, Duration::from_secs(5));
        assert_eq!(config.executor.workers, 8);
        assert_eq!(config.task.batch_size, 500);
        assert_eq!(config.rate_limit.default_rate, 20.0);
        assert!(config.namespaces.is_empty());
    }

    #[test]
    fn partial_config_overrides() {
        let config: Config = serde_json::from_str(
            r#"{
                "scheduler": { "period": { "secs": 30, "nanos": 0 } },
                "rate_limit": {
                    "operation_rates": { "GetResources": 2.0 },
                    "resource_classes": { "GetMetricData": "metrics" },
                    "concurrency": { "metrics": 4 }
                },
                "namespaces": [
                    { "namespace": "AWS/SQS", "interval": { "secs": 300, "nanos": 0 } },
                    {
                        "namespace": "AWS/ELB",
                        "interval": { "secs": 60, "nanos": 0 },
                        "delay": { "secs": 120, "nanos": 0 },
                        "enabled": false
                    }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.scheduler.period, Duration::from_secs(30));
        assert_eq!(config.scheduler.await_timeout, Duration::from_secs(30));
        assert_eq!(config.rate_limit.operation_rates["GetResources"], 2.0);
        assert_eq!(config.rate_limit.concurrency["metrics"], 4);
        assert_eq!(config.namespaces.len(), 2);
        assert!(config.namespaces[0].enabled);
        assert_eq!(config.namespaces[0].delay, Duration::ZERO);
        assert!(!config.namespaces[1].enabled);
    }
}
