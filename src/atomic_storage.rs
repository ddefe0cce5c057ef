use std::sync::atomic::Ordering;
use std::sync::Arc;

use metrics::atomics::AtomicU64;
use metrics::HistogramFn;
use metrics_util::storage::AtomicBucket;
use quanta::Instant;

#[derive(Debug)]
pub(crate) struct AtomicStorage;

impl<K> metrics_util::registry::Storage<K> for AtomicStorage {
    type Counter = Arc<AtomicU64>;
    type Gauge = Arc<AtomicU64>;
    type Histogram = Arc<ObservationBucket>;

    fn counter(&self, _: &K) -> Self::Counter {
        Arc::new(AtomicU64::new(0))
    }

    fn gauge(&self, _: &K) -> Self::Gauge {
        Arc::new(AtomicU64::new(0))
    }

    fn histogram(&self, _: &K) -> Self::Histogram {
        Arc::new(ObservationBucket::new())
    }
}

/// Timestamped histogram observations plus a lifetime count.
///
/// The count survives draining so callers can assert on how many
/// observations were ever made.
#[derive(Debug)]
pub(crate) struct ObservationBucket {
    inner: AtomicBucket<(f64, Instant)>,
    recorded: AtomicU64,
}

impl ObservationBucket {
    fn new() -> Self {
        Self { inner: AtomicBucket::new(), recorded: AtomicU64::new(0) }
    }

    pub(crate) fn recorded(&self) -> u64 {
        self.recorded.load(Ordering::Relaxed)
    }

    pub(crate) fn drain_with<F>(&self, f: F)
    where
        F: FnMut(&[(f64, Instant)]),
    {
        self.inner.clear_with(f);
    }
}

impl HistogramFn for ObservationBucket {
    fn record(&self, value: f64) {
        self.inner.push((value, Instant::now()));
        self.recorded.fetch_add(1, Ordering::Relaxed);
    }
}
