use std::sync::atomic::Ordering;
use std::sync::Arc;

use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};
use metrics_util::registry::Registry;

use crate::atomic_storage::AtomicStorage;

/// Process-local metrics store.
///
/// Installed as the global [`Recorder`] by [`crate::install`]; the rate limiter also holds a
/// clone and writes through it directly so recordings do not depend on global state.
#[derive(Debug, Clone)]
pub struct ScrapeRecorder {
    registry: Arc<Registry<Key, AtomicStorage>>,
}

impl Default for ScrapeRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl ScrapeRecorder {
    #[must_use]
    pub fn new() -> Self {
        ScrapeRecorder { registry: Arc::new(Registry::new(AtomicStorage)) }
    }

    pub(crate) fn counter(&self, key: &Key) -> Counter {
        self.registry
            .get_or_create_counter(key, |counter| counter.clone().into())
    }

    pub(crate) fn histogram(&self, key: &Key) -> Histogram {
        self.registry
            .get_or_create_histogram(key, |histogram| histogram.clone().into())
    }

    /// Current value of the counter with exactly this name and label set.
    #[must_use]
    pub fn counter_value(&self, key: &Key) -> u64 {
        let mut value = 0;
        self.registry.visit_counters(|candidate, counter| {
            if candidate == key {
                value = counter.load(Ordering::Relaxed);
            }
        });

        value
    }

    /// Number of observations ever recorded into the histogram with this key.
    #[must_use]
    pub fn histogram_count(&self, key: &Key) -> u64 {
        let mut count = 0;
        self.registry.visit_histograms(|candidate, histogram| {
            if candidate == key {
                count = histogram.recorded();
            }
        });

        count
    }

    /// Sum of the histogram counts across every label set sharing `name`.
    #[must_use]
    pub fn histogram_count_by_name(&self, name: &str) -> u64 {
        let mut count = 0u64;
        self.registry.visit_histograms(|key, histogram| {
            if key.name() == name {
                count = count.saturating_add(histogram.recorded());
            }
        });

        count
    }

    /// Sum of the counter values across every label set sharing `name`.
    #[must_use]
    pub fn counter_value_by_name(&self, name: &str) -> u64 {
        let mut value = 0u64;
        self.registry.visit_counters(|key, counter| {
            if key.name() == name {
                value = value.saturating_add(counter.load(Ordering::Relaxed));
            }
        });

        value
    }

    /// Removes and returns the pending observations for `key`.
    #[must_use]
    pub fn drain_histogram(&self, key: &Key) -> Vec<f64> {
        let mut values = Vec::new();
        self.registry.visit_histograms(|candidate, histogram| {
            if candidate == key {
                histogram.drain_with(|samples| values.extend(samples.iter().map(|(v, _)| *v)));
            }
        });

        values
    }
}

impl Recorder for ScrapeRecorder {
    fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
        self.counter(key)
    }

    fn register_gauge(&self, key: &Key, _: &Metadata<'_>) -> Gauge {
        self.registry
            .get_or_create_gauge(key, |gauge| gauge.clone().into())
    }

    fn register_histogram(&self, key: &Key, _: &Metadata<'_>) -> Histogram {
        self.histogram(key)
    }
}
