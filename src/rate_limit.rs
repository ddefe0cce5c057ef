use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use hashbrown::HashMap;
use metrics::{Key, Label};
use serde::Deserialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{ApiError, ScrapeError};
use crate::model::RateLimitKey;
use crate::recorder::ScrapeRecorder;
use crate::tenant::{self, TenantContext};

pub const LATENCY_METRIC: &str = "cloudwatch_call_latency_ms";
pub const ERROR_METRIC: &str = "cloudwatch_call_errors_total";

const FALLBACK_RATE: f64 = 20.0;
/// Slower rates are treated as invalid; one permit every ~11.5 days.
const MIN_RATE: f64 = 1e-6;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Permits per second for buckets without an operation override.
    pub default_rate: f64,
    /// Permits per second for buckets of the named operation.
    pub operation_rates: BTreeMap<String, f64>,
    /// Permit waits longer than this are logged.
    pub warn_wait: Duration,
    /// Give up on a permit that would take longer than this to become available.
    pub acquire_timeout: Option<Duration>,
    /// Operation name to resource class.
    pub resource_classes: BTreeMap<String, String>,
    /// Resource class to maximum in-flight calls.
    pub concurrency: BTreeMap<String, usize>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            default_rate: FALLBACK_RATE,
            operation_rates: BTreeMap::new(),
            warn_wait: Duration::from_millis(500),
            acquire_timeout: None,
            resource_classes: BTreeMap::new(),
            concurrency: BTreeMap::new(),
        }
    }
}

/// Outcome of waiting for permission to call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquisition {
    Acquired { waited: Duration },
    TimedOut,
    Cancelled,
}

/// Labels describing one guarded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallLabels {
    pub account_id: String,
    pub region: String,
    pub operation: String,
    /// Tenant owning the account; falls back to the ambient [`TenantContext`].
    pub tenant: Option<String>,
}

impl CallLabels {
    fn internal(&self) -> Vec<Label> {
        vec![
            Label::new("operation", self.operation.clone()),
            Label::new("account", self.account_id.clone()),
            Label::new("region", self.region.clone()),
        ]
    }

    fn customer(&self) -> Option<String> {
        self.tenant
            .clone()
            .or_else(|| TenantContext::current()?.customer().map(ToString::to_string))
    }
}

/// Receives call observations destined for a store outside this process.
///
/// Unlike the process-local recorder, labels passed here carry the resolved `customer`.
pub trait ExternalSink: Send + Sync {
    fn record_latency(&self, labels: &[Label], millis: f64);
    fn record_error(&self, labels: &[Label]);
}

/// Fixed-rate token bucket holding at most one second of unused permits.
#[derive(Debug)]
pub struct TokenBucket {
    permits_per_second: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    stored: f64,
    next_free: Instant,
}

impl TokenBucket {
    fn new(permits_per_second: f64) -> Self {
        TokenBucket {
            permits_per_second,
            state: Mutex::new(BucketState { stored: 0.0, next_free: Instant::now() }),
        }
    }

    #[must_use]
    pub const fn rate(&self) -> f64 {
        self.permits_per_second
    }

    /// Reserves one permit, returning the instant the caller may proceed.
    ///
    /// Returns `None` without reserving if that instant lies beyond `max_wait`, or if the bucket's
    /// next free instant cannot be represented.
    #[allow(clippy::arithmetic_side_effects)]
    fn reserve(&self, now: Instant, max_wait: Option<Duration>) -> Option<Instant> {
        let seconds_per_permit = 1.0 / self.permits_per_second;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        // Refill for the time the bucket sat idle.
        if now > state.next_free {
            let idle = (now - state.next_free).as_secs_f64();
            state.stored = (state.stored + idle / seconds_per_permit).min(self.permits_per_second);
            state.next_free = now;
        }

        let ready_at = state.next_free;
        if max_wait.is_some_and(|max_wait| ready_at.saturating_duration_since(now) > max_wait) {
            return None;
        }

        let from_store = state.stored.min(1.0);
        let fresh = 1.0 - from_store;
        let next_free = Duration::try_from_secs_f64(fresh * seconds_per_permit)
            .ok()
            .and_then(|wait| state.next_free.checked_add(wait))?;
        state.stored -= from_store;
        state.next_free = next_free;

        Some(ready_at)
    }
}

/// Per-key throughput limiter with optional per-resource-class concurrency caps.
pub struct RateLimiter {
    config: RateLimitConfig,
    cxl: CancellationToken,
    recorder: ScrapeRecorder,
    external: Option<Arc<dyn ExternalSink>>,
    buckets: Mutex<HashMap<RateLimitKey, Arc<TokenBucket>>>,
    caps: HashMap<String, Arc<Semaphore>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: RateLimitConfig, recorder: ScrapeRecorder, cxl: CancellationToken) -> Self {
        let caps = config
            .concurrency
            .iter()
            .map(|(class, limit)| (class.clone(), Arc::new(Semaphore::new((*limit).max(1)))))
            .collect();

        RateLimiter {
            config,
            cxl,
            recorder,
            external: None,
            buckets: Mutex::new(HashMap::new()),
            caps,
        }
    }

    #[must_use]
    pub fn with_external_sink(mut self, sink: Arc<dyn ExternalSink>) -> Self {
        self.external = Some(sink);
        self
    }

    /// The bucket for `key`, created on first use and never replaced.
    pub fn bucket(&self, key: &RateLimitKey) -> Arc<TokenBucket> {
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(bucket) = buckets.get(key) {
            return Arc::clone(bucket);
        }

        let bucket = Arc::new(TokenBucket::new(self.rate_for(&key.operation)));
        buckets.insert(key.clone(), Arc::clone(&bucket));

        bucket
    }

    fn rate_for(&self, operation: &str) -> f64 {
        let rate = self
            .config
            .operation_rates
            .get(operation)
            .copied()
            .unwrap_or(self.config.default_rate);
        if rate.is_finite() && rate >= MIN_RATE {
            return rate;
        }

        warn!(operation, rate, "Invalid rate limit, using fallback");
        FALLBACK_RATE
    }

    /// Waits for a throughput permit for `key`.
    pub async fn acquire(&self, key: &RateLimitKey) -> Acquisition {
        let bucket = self.bucket(key);
        let now = Instant::now();
        let Some(ready_at) = bucket.reserve(now, self.config.acquire_timeout) else {
            return Acquisition::TimedOut;
        };

        tokio::select! {
            biased;

            () = self.cxl.cancelled() => Acquisition::Cancelled,
            () = tokio::time::sleep_until(ready_at) => {
                Acquisition::Acquired { waited: ready_at.saturating_duration_since(now) }
            }
        }
    }

    /// Takes an in-flight slot for the operation's resource class, if it has a cap.
    async fn acquire_slot(&self, operation: &str) -> Result<Option<OwnedSemaphorePermit>, Acquisition> {
        let Some(cap) = self
            .config
            .resource_classes
            .get(operation)
            .and_then(|class| self.caps.get(class))
        else {
            return Ok(None);
        };

        let acquire = Arc::clone(cap).acquire_owned();
        let permit = match self.config.acquire_timeout {
            Some(timeout) => tokio::select! {
                biased;

                () = self.cxl.cancelled() => return Err(Acquisition::Cancelled),
                permit = tokio::time::timeout(timeout, acquire) => match permit {
                    Ok(permit) => permit,
                    Err(_) => return Err(Acquisition::TimedOut),
                },
            },
            None => tokio::select! {
                biased;

                () = self.cxl.cancelled() => return Err(Acquisition::Cancelled),
                permit = acquire => permit,
            },
        };

        // Semaphores are never closed.
        permit.map(Some).map_err(|_| Acquisition::Cancelled)
    }

    /// Runs `operation` once permitted, recording one latency observation and, on failure, one
    /// error increment.
    ///
    /// # Errors
    ///
    /// Returns [`ScrapeError::Throttled`] if permission was not granted (the operation is not run
    /// and nothing is recorded), or [`ScrapeError::Call`] wrapping the operation's failure.
    pub async fn guard<T, F, Fut>(
        &self,
        key: &RateLimitKey,
        labels: &CallLabels,
        operation: F,
    ) -> Result<T, ScrapeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        match self.acquire(key).await {
            Acquisition::Acquired { waited } if waited > self.config.warn_wait => {
                warn!(%key, waited_ms = waited.as_millis(), "Slow rate limit acquisition");
            }
            Acquisition::Acquired { .. } => {}
            outcome => return Err(ScrapeError::Throttled { key: key.clone(), outcome }),
        }
        let _slot = self
            .acquire_slot(&key.operation)
            .await
            .map_err(|outcome| ScrapeError::Throttled { key: key.clone(), outcome })?;

        tenant::record_call(&key.region, &key.operation);
        let in_flight = InFlight { limiter: self, labels, start: quanta::Instant::now() };

        let result = operation().await;
        if let Err(err) = &result {
            in_flight.record_error(err);
        }
        drop(in_flight);

        result.map_err(|source| ScrapeError::Call { operation: key.operation.clone(), source })
    }
}

/// Records the call's latency when dropped, whichever way the call ends.
struct InFlight<'a> {
    limiter: &'a RateLimiter,
    labels: &'a CallLabels,
    start: quanta::Instant,
}

impl InFlight<'_> {
    fn record_error(&self, err: &ApiError) {
        let mut labels = self.labels.internal();
        labels.push(Label::new("error_kind", err.kind.as_str()));
        self.limiter
            .recorder
            .counter(&Key::from_parts(ERROR_METRIC, labels.clone()))
            .increment(1);

        if let Some(external) = &self.limiter.external {
            if let Some(customer) = self.labels.customer() {
                labels.push(Label::new("customer", customer));
            }
            external.record_error(&labels);
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let millis = self.start.elapsed().as_secs_f64() * 1000.0;
        let mut labels = self.labels.internal();
        self.limiter
            .recorder
            .histogram(&Key::from_parts(LATENCY_METRIC, labels.clone()))
            .record(millis);

        if let Some(external) = &self.limiter.external {
            if let Some(customer) = self.labels.customer() {
                labels.push(Label::new("customer", customer));
            }
            external.record_latency(&labels, millis);
        }
    }
}
