use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use hashbrown::HashMap;
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::ScrapeError;
use crate::model::{AccountRef, ScrapeKey};
use crate::provider::CollectorRegistry;
use crate::task::{ScrapeTask, TaskConfig, TaskDeps};

/// Scrape settings of one metric namespace.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NamespaceConfig {
    pub namespace: String,
    pub interval: Duration,
    #[serde(default)]
    pub delay: Duration,
    #[serde(default = "enabled")]
    pub enabled: bool,
}

const fn enabled() -> bool {
    true
}

/// Distinct intervals (in seconds) across enabled namespaces, each with the longest delay any
/// of those namespaces asks for.
#[must_use]
pub fn desired_intervals(namespaces: &[NamespaceConfig]) -> BTreeMap<u32, Duration> {
    let mut intervals = BTreeMap::new();
    for namespace in namespaces.iter().filter(|namespace| namespace.enabled) {
        let Ok(secs) = u32::try_from(namespace.interval.as_secs()) else {
            warn!(namespace = %namespace.namespace, "Interval out of range, ignoring");
            continue;
        };
        if secs == 0 {
            continue;
        }

        let delay = intervals.entry(secs).or_insert(namespace.delay);
        *delay = (*delay).max(namespace.delay);
    }

    intervals
}

/// Keys touched by one reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileDelta {
    pub added: Vec<ScrapeKey>,
    pub removed: Vec<ScrapeKey>,
    /// Keys that could not be registered; retried on the next reconciliation.
    pub failed: Vec<ScrapeKey>,
}

impl ReconcileDelta {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.failed.is_empty()
    }
}

type Tasks = HashMap<String, HashMap<String, HashMap<u32, Arc<ScrapeTask>>>>;

/// Live `account -> region -> interval -> task` mapping.
///
/// [`TaskRegistry::reconcile`] is the only writer. Readers get point-in-time snapshots.
pub struct TaskRegistry {
    tasks: Mutex<Tasks>,
    deps: TaskDeps,
    config: TaskConfig,
    collectors: Arc<dyn CollectorRegistry>,
}

impl TaskRegistry {
    #[must_use]
    pub fn new(deps: TaskDeps, config: TaskConfig, collectors: Arc<dyn CollectorRegistry>) -> Self {
        TaskRegistry { tasks: Mutex::new(HashMap::new()), deps, config, collectors }
    }

    /// Brings the registry in line with the desired `(account, region, interval)` set.
    ///
    /// Existing tasks are kept as they are; running twice with the same inputs changes nothing.
    pub fn reconcile(
        &self,
        accounts: &[AccountRef],
        intervals: &BTreeMap<u32, Duration>,
    ) -> ReconcileDelta {
        let mut desired: BTreeMap<ScrapeKey, (&AccountRef, Duration)> = BTreeMap::new();
        for account in accounts {
            for region in &account.regions {
                for (interval_secs, delay) in intervals {
                    desired
                        .entry(ScrapeKey::new(account.account_id.as_str(), region.as_str(), *interval_secs))
                        .or_insert((account, *delay));
                }
            }
        }

        let mut delta = ReconcileDelta::default();
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);

        for key in keys_of(&tasks) {
            if desired.contains_key(&key) {
                continue;
            }

            if let Some(task) = remove(&mut tasks, &key) {
                task.retire();
            }
            self.collectors.unregister(&key);
            delta.removed.push(key);
        }

        for (key, (account, delay)) in desired {
            if lookup(&tasks, &key).is_some() {
                continue;
            }

            let task = Arc::new(ScrapeTask::new(
                key.clone(),
                account.clone(),
                delay,
                self.config.clone(),
                self.deps.clone(),
            ));
            match self.collectors.register(Arc::clone(&task)) {
                Ok(()) => {
                    tasks
                        .entry(key.account_id.clone())
                        .or_default()
                        .entry(key.region.clone())
                        .or_default()
                        .insert(key.interval_secs, task);
                    delta.added.push(key);
                }
                Err(err) => {
                    let err = ScrapeError::from(err);
                    warn!(%key, %err, "Task registration failed, will retry");
                    delta.failed.push(key);
                }
            }
        }
        drop(tasks);

        if !delta.is_empty() {
            info!(
                added = delta.added.len(),
                removed = delta.removed.len(),
                failed = delta.failed.len(),
                "Reconciled scrape tasks"
            );
        }

        delta
    }

    /// Every live task at this instant.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<ScrapeTask>> {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .flat_map(|regions| regions.values())
            .flat_map(|intervals| intervals.values())
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn get(&self, key: &ScrapeKey) -> Option<Arc<ScrapeTask>> {
        lookup(&self.tasks.lock().unwrap_or_else(PoisonError::into_inner), key).cloned()
    }

    /// Live keys in sorted order.
    #[must_use]
    pub fn keys(&self) -> Vec<ScrapeKey> {
        let mut keys = keys_of(&self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        keys.sort();

        keys
    }
}

fn keys_of(tasks: &Tasks) -> Vec<ScrapeKey> {
    tasks
        .iter()
        .flat_map(|(account_id, regions)| {
            regions.iter().flat_map(move |(region, intervals)| {
                intervals.keys().map(move |interval_secs| {
                    ScrapeKey::new(account_id.as_str(), region.as_str(), *interval_secs)
                })
            })
        })
        .collect()
}

fn lookup<'a>(tasks: &'a Tasks, key: &ScrapeKey) -> Option<&'a Arc<ScrapeTask>> {
    tasks
        .get(&key.account_id)?
        .get(&key.region)?
        .get(&key.interval_secs)
}

/// Removes `key`, pruning maps left empty.
fn remove(tasks: &mut Tasks, key: &ScrapeKey) -> Option<Arc<ScrapeTask>> {
    let regions = tasks.get_mut(&key.account_id)?;
    let intervals = regions.get_mut(&key.region)?;
    let task = intervals.remove(&key.interval_secs);

    if intervals.is_empty() {
        regions.remove(&key.region);
    }
    if regions.is_empty() {
        tasks.remove(&key.account_id);
    }

    task
}
