//! Background warmup of model sessions.
//!
//! [`WarmupCoordinator::trigger_warm`] hands session construction to tokio's
//! blocking pool and returns immediately. The triggering caller never waits on the
//! result: failures are logged here and readiness simply stays `NotReady` until a
//! later trigger, or a real request, tries again.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio_util::task::TaskTracker;

use crate::errors::{BgRemovalError, Result};
use crate::session::SessionCache;
use crate::traits::SessionFactory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarmupOutcome {
    /// The session already exists; nothing was scheduled.
    AlreadyWarm,
    /// A background construction was scheduled by this call.
    Started,
    /// An earlier trigger is still constructing; nothing new was scheduled.
    InProgress,
}

pub struct WarmupCoordinator<F: SessionFactory> {
    cache: Arc<SessionCache<F>>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    tracker: TaskTracker,
}

/// Clears the in-flight marker when the background task ends, even on panic.
struct InFlightGuard {
    in_flight: Arc<Mutex<HashSet<String>>>,
    model_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.model_id);
    }
}

impl<F: SessionFactory> WarmupCoordinator<F> {
    pub fn new(cache: Arc<SessionCache<F>>) -> Self {
        Self {
            cache,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            tracker: TaskTracker::new(),
        }
    }

    pub fn is_warming(&self, model_id: &str) -> bool {
        self.in_flight.lock().contains(model_id)
    }

    /// Schedules construction of `model_id` on the blocking pool unless it is
    /// already warm or already being warmed.
    ///
    /// Must be called from within a tokio runtime; outside one this returns
    /// [`BgRemovalError::Worker`].
    pub fn trigger_warm(&self, model_id: &str) -> Result<WarmupOutcome> {
        if self.cache.is_ready(model_id) {
            return Ok(WarmupOutcome::AlreadyWarm);
        }

        let handle = Handle::try_current().map_err(|e| BgRemovalError::Worker {
            operation: "warmup scheduling".to_string(),
            reason: e.to_string(),
        })?;

        if !self.in_flight.lock().insert(model_id.to_string()) {
            return Ok(WarmupOutcome::InProgress);
        }
        let guard = InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
            model_id: model_id.to_string(),
        };

        let cache = Arc::clone(&self.cache);
        let target = model_id.to_string();
        self.tracker.spawn_blocking_on(
            move || {
                let _guard = guard;
                let started = Instant::now();
                match cache.get_or_create(&target) {
                    Ok(_) => tracing::info!(
                        model = %target,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "warmup finished"
                    ),
                    Err(e) => tracing::error!(
                        model = %target,
                        error = %e,
                        "warmup failed, session stays cold"
                    ),
                }
            },
            &handle,
        );

        tracing::info!(model = model_id, "warmup started");
        Ok(WarmupOutcome::Started)
    }

    /// Waits until every warmup scheduled so far has finished.
    ///
    /// Not for concurrent use: it closes and reopens the shared tracker, so one
    /// caller's reopen can cut another caller's wait short. Call it from a single
    /// task, such as the shutdown path.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockSessionFactory;
    use std::time::Duration;

    fn coordinator(factory: MockSessionFactory) -> WarmupCoordinator<MockSessionFactory> {
        WarmupCoordinator::new(Arc::new(SessionCache::new(factory)))
    }

    #[tokio::test]
    async fn test_trigger_returns_before_construction_finishes() -> Result<()> {
        let warmup = coordinator(MockSessionFactory::new().with_delay(Duration::from_millis(200)));

        let started = Instant::now();
        assert_eq!(warmup.trigger_warm("u2net")?, WarmupOutcome::Started);
        assert!(started.elapsed() < Duration::from_millis(150));
        assert!(!warmup.cache.is_ready("u2net"));

        warmup.wait_idle().await;
        assert!(warmup.cache.is_ready("u2net"));
        assert!(!warmup.is_warming("u2net"));
        Ok(())
    }

    #[tokio::test]
    async fn test_double_trigger_constructs_once() -> Result<()> {
        let warmup = coordinator(MockSessionFactory::new().with_delay(Duration::from_millis(100)));

        assert_eq!(warmup.trigger_warm("u2net")?, WarmupOutcome::Started);
        let second = warmup.trigger_warm("u2net")?;
        assert!(matches!(
            second,
            WarmupOutcome::InProgress | WarmupOutcome::AlreadyWarm
        ));

        warmup.wait_idle().await;
        assert_eq!(warmup.trigger_warm("u2net")?, WarmupOutcome::AlreadyWarm);
        assert_eq!(warmup.cache.factory().constructions(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_warmup_is_swallowed_and_retryable() -> Result<()> {
        let warmup = coordinator(MockSessionFactory::new().failing_first(1));

        assert_eq!(warmup.trigger_warm("u2net")?, WarmupOutcome::Started);
        warmup.wait_idle().await;
        assert!(!warmup.cache.is_ready("u2net"));
        assert!(!warmup.is_warming("u2net"));

        assert_eq!(warmup.trigger_warm("u2net")?, WarmupOutcome::Started);
        warmup.wait_idle().await;
        assert!(warmup.cache.is_ready("u2net"));
        assert_eq!(warmup.cache.factory().constructions(), 2);
        Ok(())
    }

    #[test]
    fn test_trigger_outside_runtime_fails() {
        let warmup = coordinator(MockSessionFactory::new());
        assert!(matches!(
            warmup.trigger_warm("u2net"),
            Err(BgRemovalError::Worker { .. })
        ));
        assert!(!warmup.is_warming("u2net"));
    }
}
