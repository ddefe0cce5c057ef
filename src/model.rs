use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies one polling task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScrapeKey {
    pub account_id: String,
    pub region: String,
    pub interval_secs: u32,
}

impl ScrapeKey {
    pub fn new(account_id: impl Into<String>, region: impl Into<String>, interval_secs: u32) -> Self {
        ScrapeKey { account_id: account_id.into(), region: region.into(), interval_secs }
    }
}

impl fmt::Display for ScrapeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}s", self.account_id, self.region, self.interval_secs)
    }
}

/// Identifies one throughput bucket.
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RateLimitKey {
    pub account_id: String,
    pub region: String,
    pub operation: String,
}

impl RateLimitKey {
    pub fn new(
        account_id: impl Into<String>,
        region: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        RateLimitKey {
            account_id: account_id.into(),
            region: region.into(),
            operation: operation.into(),
        }
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.account_id, self.region, self.operation)
    }
}

/// A monitored account as reported by the account provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountRef {
    pub account_id: String,
    /// Role assumed to reach the account, if any.
    #[serde(default)]
    pub role_arn: Option<String>,
    /// Tenant the account belongs to, resolved into the `customer` label.
    #[serde(default)]
    pub tenant: Option<String>,
    pub regions: Vec<String>,
}

/// A provider-side metric identity plus the resource it was derived from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetricQuery {
    pub namespace: String,
    pub metric_name: String,
    pub dimensions: BTreeMap<String, String>,
    pub statistic: String,
    #[serde(default)]
    pub resource: Option<String>,
}

/// One output sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub value: f64,
    pub timestamp_ms: u64,
}

/// All samples sharing a metric name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleFamily {
    pub name: String,
    pub samples: Vec<Sample>,
}

/// Query window in epoch seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start_secs: u64,
    pub end_secs: u64,
}

impl TimeWindow {
    /// `[now - interval - delay, now - delay]`.
    #[must_use]
    pub const fn trailing(now_secs: u64, interval_secs: u64, delay_secs: u64) -> Self {
        let end_secs = now_secs.saturating_sub(delay_secs);

        TimeWindow { start_secs: end_secs.saturating_sub(interval_secs), end_secs }
    }

    #[must_use]
    pub const fn len_secs(&self) -> u64 {
        self.end_secs.saturating_sub(self.start_secs)
    }
}

/// A query tagged with the request-local id the API echoes back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentifiedQuery {
    pub id: String,
    pub query: MetricQuery,
}

/// One page request against the monitoring API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricDataRequest {
    pub account_id: String,
    pub region: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role_arn: Option<String>,
    pub window: TimeWindow,
    pub period_secs: u32,
    pub queries: Vec<IdentifiedQuery>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,
}

/// Per-query result inside one page.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricDataResult {
    pub id: String,
    pub timestamps_ms: Vec<u64>,
    pub values: Vec<f64>,
}

/// One page of results.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricDataPage {
    pub results: Vec<MetricDataResult>,
    pub next_token: Option<String>,
}
