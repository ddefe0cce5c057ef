//! Execution-scoped tenant identity.
//!
//! The executor wraps every unit of work in [`TenantContext::scope`]. While the wrapped future is
//! being polled, [`TenantContext::current`] returns its identity and [`record_call`] counts guarded
//! calls. Both are task-local: they are dropped when the future completes, fails, panics or is
//! cancelled, and are never visible to another task sharing the worker thread.

use std::cell::RefCell;
use std::future::Future;

use hashbrown::HashMap;

tokio::task_local! {
    static CURRENT: TenantContext;
    static CALLS: RefCell<CallCounts>;
}

/// Per-unit diagnostic call counts keyed by `(region, operation)`.
pub type CallCounts = HashMap<(String, String), u64>;

/// Identity of the tenant/account a unit of work runs on behalf of.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TenantContext {
    pub account_id: String,
    pub tenant: Option<String>,
}

impl TenantContext {
    pub fn new(account_id: impl Into<String>, tenant: Option<String>) -> Self {
        TenantContext { account_id: account_id.into(), tenant }
    }

    /// The context of the unit of work currently being polled, if any.
    #[must_use]
    pub fn current() -> Option<TenantContext> {
        CURRENT.try_with(Clone::clone).ok()
    }

    /// Customer label value resolved from the tenant.
    #[must_use]
    pub fn customer(&self) -> Option<&str> {
        self.tenant.as_deref()
    }

    /// Runs `fut` with this context installed, returning its output and the calls it made.
    pub(crate) async fn scope<F>(self, fut: F) -> (F::Output, CallCounts)
    where
        F: Future,
    {
        CURRENT
            .scope(
                self,
                CALLS.scope(RefCell::new(CallCounts::new()), async {
                    let output = fut.await;
                    let calls = CALLS.with(RefCell::take);

                    (output, calls)
                }),
            )
            .await
    }
}

/// Counts one guarded call against the current unit of work; no-op outside a scope.
pub(crate) fn record_call(region: &str, operation: &str) {
    let _ = CALLS.try_with(|calls| {
        let mut calls = calls.borrow_mut();
        match calls.get_mut(&(region.to_string(), operation.to_string())) {
            Some(count) => *count = count.saturating_add(1),
            None => {
                calls.insert((region.to_string(), operation.to_string()), 1);
            }
        }
    });
}

/// Calls made so far by the current unit of work for `(region, operation)`.
#[must_use]
pub fn call_count(region: &str, operation: &str) -> u64 {
    CALLS
        .try_with(|calls| {
            calls
                .borrow()
                .get(&(region.to_string(), operation.to_string()))
                .copied()
                .unwrap_or(0)
        })
        .unwrap_or(0)
}
