//! Periodic health checks for protected dependencies.
//!
//! [`HealthMonitor`] owns one background task. [`start`](HealthMonitor::start) spawns it,
//! [`stop`](HealthMonitor::stop) aborts it, and dropping the monitor aborts it as well, so the
//! task never outlives the monitor. Each tick runs every registered check concurrently, bounded
//! by the check timeout, and stores the result as a [`HealthStatus`].
//!
//! Checks are observational only: they never feed circuit accounting.

use crate::clock::{Clock, TokioClock};
use futures::future::{join_all, BoxFuture};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Default pause between two rounds of checks.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(30);
/// Default bound on a single check.
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

type Check = Arc<dyn Fn() -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

/// Last observed health of one dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub healthy: bool,
    /// Clock reading when the check finished.
    pub checked_at_millis: u64,
    pub latency_ms: u64,
    pub consecutive_failures: u32,
    pub error: Option<String>,
}

#[derive(Default)]
struct Registry {
    checks: RwLock<BTreeMap<String, Check>>,
    statuses: RwLock<BTreeMap<String, HealthStatus>>,
}

/// Owner of the periodic health-check task.
pub struct HealthMonitor {
    registry: Arc<Registry>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    check_timeout: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("checks", &self.names())
            .field("interval", &self.interval)
            .field("check_timeout", &self.check_timeout)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_CHECK_INTERVAL)
    }
}

impl HealthMonitor {
    /// Monitor on tokio time running checks every `interval`.
    pub fn new(interval: Duration) -> Self {
        Self::with_shared_clock(interval, Arc::new(TokioClock::default()))
    }

    pub fn with_shared_clock(interval: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry: Arc::new(Registry::default()),
            clock,
            interval,
            check_timeout: DEFAULT_CHECK_TIMEOUT,
            task: Mutex::new(None),
        }
    }

    /// Bound on each individual check; a check still running then is reported unhealthy.
    pub fn with_check_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = timeout;
        self
    }

    /// Add (or replace) the check for `name`. Takes effect from the next tick.
    pub fn register<F, Fut, E>(&self, name: impl Into<String>, check: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + 'static,
    {
        let check: Check = Arc::new(move || -> BoxFuture<'static, Result<(), String>> {
            let fut = check();
            Box::pin(async move { fut.await.map_err(|e| e.to_string()) })
        });
        let name = name.into();
        debug!(target: "breakwater::monitor", check = %name, "health check registered");
        write(&self.registry.checks).insert(name, check);
    }

    /// Remove a check and its last status.
    pub fn unregister(&self, name: &str) -> bool {
        write(&self.registry.statuses).remove(name);
        write(&self.registry.checks).remove(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        read(&self.registry.checks).keys().cloned().collect()
    }

    /// Spawn the periodic task. Returns false when it is already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> bool {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }
        let registry = self.registry.clone();
        let clock = self.clock.clone();
        let interval = self.interval;
        let check_timeout = self.check_timeout;
        *task = Some(tokio::spawn(async move {
            loop {
                run_checks(&registry, clock.as_ref(), check_timeout).await;
                clock.after(interval).await;
            }
        }));
        debug!(target: "breakwater::monitor", ?interval, "health monitor started");
        true
    }

    /// Abort the periodic task. Returns false when it was not running.
    pub fn stop(&self) -> bool {
        let handle = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        match handle {
            Some(handle) => {
                handle.abort();
                debug!(target: "breakwater::monitor", "health monitor stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Run every check once, outside the periodic schedule.
    pub async fn check_now(&self) {
        run_checks(&self.registry, self.clock.as_ref(), self.check_timeout).await;
    }

    /// Last status of `name`; `None` until its first check completes.
    pub fn status(&self, name: &str) -> Option<HealthStatus> {
        read(&self.registry.statuses).get(name).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, HealthStatus> {
        read(&self.registry.statuses).clone()
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
    }
}

async fn run_checks(registry: &Registry, clock: &dyn Clock, check_timeout: Duration) {
    let checks: Vec<(String, Check)> =
        read(&registry.checks).iter().map(|(name, check)| (name.clone(), check.clone())).collect();

    let results = join_all(checks.into_iter().map(|(name, check)| async move {
        let started = clock.now_millis();
        let outcome = tokio::select! {
            biased;
            result = check() => result,
            _ = clock.after(check_timeout) => Err(format!("timed out after {check_timeout:?}")),
        };
        let finished = clock.now_millis();
        (name, outcome, finished, finished.saturating_sub(started))
    }))
    .await;

    let mut statuses = write(&registry.statuses);
    for (name, outcome, finished, latency_ms) in results {
        if !read(&registry.checks).contains_key(&name) {
            continue;
        }
        let previous_failures = statuses.get(&name).map_or(0, |s| s.consecutive_failures);
        let status = match outcome {
            Ok(()) => HealthStatus {
                healthy: true,
                checked_at_millis: finished,
                latency_ms,
                consecutive_failures: 0,
                error: None,
            },
            Err(error) => {
                warn!(target: "breakwater::monitor", check = %name, %error, "health check failed");
                HealthStatus {
                    healthy: false,
                    checked_at_millis: finished,
                    latency_ms,
                    consecutive_failures: previous_failures.saturating_add(1),
                    error: Some(error),
                }
            }
        };
        statuses.insert(name, status);
    }
    debug!(target: "breakwater::monitor", checks = statuses.len(), "health round complete");
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
