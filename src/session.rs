//! Process-wide cache of loaded segmentation sessions.
//!
//! A [`Session`] wraps an engine that takes seconds to build. [`SessionCache`]
//! guarantees that each model id is built at most once, no matter how many
//! callers race for it, and lets anyone ask whether a session exists without
//! blocking on a construction in progress. Nothing is built until
//! [`SessionCache::get_or_create`] is called explicitly.
//!
//! Each model id owns a slot: a [`OnceLock`] holding the finished session and a
//! mutex serializing the check-then-create sequence. Readers only ever touch the
//! `OnceLock`, so they never observe a half-built session.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use chrono::{DateTime, Utc};
use image::DynamicImage;
use parking_lot::{Mutex, RwLock};

use crate::errors::{BgRemovalError, Result};
use crate::traits::{ImageSegmentationModel, SessionFactory};

/// A loaded segmentation engine bound to one model id.
///
/// The engine itself is private; callers can only run segmentations through it.
pub struct Session<M> {
    model_id: String,
    created_at: DateTime<Utc>,
    model: M,
}

impl<M: ImageSegmentationModel> Session<M> {
    pub(crate) fn new(model_id: impl Into<String>, model: M) -> Self {
        Self {
            model_id: model_id.into(),
            created_at: Utc::now(),
            model,
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn input_size(&self) -> u32 {
        self.model.get_image_size()
    }

    pub fn segment(&self, image: &DynamicImage) -> Result<DynamicImage> {
        self.model.segment_image(image)
    }
}

impl<M> std::fmt::Debug for Session<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("model_id", &self.model_id)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    NotReady,
    Ready,
}

impl Readiness {
    pub const fn is_ready(self) -> bool {
        matches!(self, Self::Ready)
    }
}

struct Slot<M> {
    session: OnceLock<Arc<Session<M>>>,
    init: Mutex<()>,
}

impl<M> Default for Slot<M> {
    fn default() -> Self {
        Self {
            session: OnceLock::new(),
            init: Mutex::new(()),
        }
    }
}

pub struct SessionCache<F: SessionFactory> {
    factory: F,
    slots: RwLock<HashMap<String, Arc<Slot<F::Model>>>>,
}

impl<F: SessionFactory> SessionCache<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            slots: RwLock::new(HashMap::new()),
        }
    }

    pub const fn factory(&self) -> &F {
        &self.factory
    }

    fn slot(&self, model_id: &str) -> Arc<Slot<F::Model>> {
        if let Some(slot) = self.slots.read().get(model_id) {
            return Arc::clone(slot);
        }
        Arc::clone(self.slots.write().entry(model_id.to_string()).or_default())
    }

    /// Returns the session for `model_id`, building it on first use.
    ///
    /// Concurrent callers for the same id block until the first construction
    /// finishes and then share its result. If construction fails, nothing is
    /// cached: the error goes to the caller that ran it, and each waiting caller
    /// makes its own attempt in turn.
    ///
    /// This blocks for as long as construction takes; call it from a blocking
    /// context.
    pub fn get_or_create(&self, model_id: &str) -> Result<Arc<Session<F::Model>>> {
        let slot = self.slot(model_id);
        if let Some(session) = slot.session.get() {
            return Ok(Arc::clone(session));
        }

        let _guard = slot.init.lock();
        if let Some(session) = slot.session.get() {
            return Ok(Arc::clone(session));
        }

        tracing::info!(model = model_id, "creating model session");
        let started = Instant::now();
        let model = self.factory.create(model_id).inspect_err(|e| {
            tracing::error!(model = model_id, error = %e, "model session creation failed");
        })?;

        let session = Arc::new(Session::new(model_id, model));
        // the init guard is held, so no other value can have been stored
        let _ = slot.session.set(Arc::clone(&session));
        tracing::info!(
            model = model_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "model session ready"
        );
        Ok(session)
    }

    /// Reports whether a session for `model_id` has been built.
    ///
    /// Never triggers construction and never waits, neither for a construction in
    /// progress nor for the slot registry. Fails when the registry is write-locked
    /// at the moment of the call.
    pub fn readiness(&self, model_id: &str) -> Result<Readiness> {
        let slots = self
            .slots
            .try_read()
            .ok_or_else(|| BgRemovalError::ReadinessProbe {
                model_id: model_id.to_string(),
                reason: "session registry is busy".to_string(),
            })?;

        let ready = slots
            .get(model_id)
            .is_some_and(|slot| slot.session.get().is_some());
        Ok(if ready {
            Readiness::Ready
        } else {
            Readiness::NotReady
        })
    }

    pub fn is_ready(&self, model_id: &str) -> bool {
        self.readiness(model_id).is_ok_and(Readiness::is_ready)
    }

    /// Returns the cached session without building it.
    pub fn session(&self, model_id: &str) -> Option<Arc<Session<F::Model>>> {
        self.slots
            .read()
            .get(model_id)
            .and_then(|slot| slot.session.get().cloned())
    }

    /// Holds the registry write lock so probes fail.
    #[cfg(test)]
    pub(crate) fn lock_registry(&self) -> impl Sized + '_ {
        self.slots.write()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockSessionFactory;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_new_cache_builds_nothing() {
        let cache = SessionCache::new(MockSessionFactory::new());
        assert_eq!(cache.factory().constructions(), 0);
        assert_eq!(cache.readiness("u2net").unwrap(), Readiness::NotReady);
        assert!(cache.session("u2net").is_none());
        assert_eq!(cache.factory().constructions(), 0);
    }

    #[test]
    fn test_concurrent_callers_share_one_construction() {
        const CALLERS: usize = 16;
        let cache = SessionCache::new(
            MockSessionFactory::new().with_delay(Duration::from_millis(100)),
        );
        let barrier = Barrier::new(CALLERS);

        let sessions: Vec<_> = thread::scope(|scope| {
            let handles: Vec<_> = (0..CALLERS)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        cache.get_or_create("u2net").unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(cache.factory().constructions(), 1);
        assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
    }

    #[test]
    fn test_failed_construction_is_not_cached() -> Result<()> {
        let cache = SessionCache::new(MockSessionFactory::new().failing_first(1));

        assert!(matches!(
            cache.get_or_create("u2net"),
            Err(BgRemovalError::Model { .. })
        ));
        assert!(!cache.is_ready("u2net"));

        let session = cache.get_or_create("u2net")?;
        assert_eq!(session.model_id(), "u2net");
        assert!(cache.is_ready("u2net"));
        assert_eq!(cache.factory().constructions(), 2);
        Ok(())
    }

    #[test]
    fn test_waiters_retry_after_failure() {
        const CALLERS: usize = 4;
        let cache = SessionCache::new(
            MockSessionFactory::new()
                .with_delay(Duration::from_millis(50))
                .failing_first(1),
        );
        let barrier = Barrier::new(CALLERS);

        let results: Vec<_> = thread::scope(|scope| {
            let handles: Vec<_> = (0..CALLERS)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        cache.get_or_create("u2net")
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|r| r.is_err()).count(), 1);
        assert_eq!(cache.factory().constructions(), 2);
        assert!(cache.is_ready("u2net"));
    }

    #[test]
    fn test_readiness_is_monotonic() -> Result<()> {
        let cache = SessionCache::new(MockSessionFactory::new());
        assert!(!cache.is_ready("u2net"));

        cache.get_or_create("u2net")?;
        for _ in 0..100 {
            assert_eq!(cache.readiness("u2net")?, Readiness::Ready);
        }
        Ok(())
    }

    #[test]
    fn test_model_ids_are_independent() -> Result<()> {
        let cache = SessionCache::new(MockSessionFactory::new());
        let a = cache.get_or_create("u2net")?;
        let b = cache.get_or_create("u2netp")?;

        assert!(!Arc::ptr_eq(&a, &b));
        assert!(cache.is_ready("u2net"));
        assert!(cache.is_ready("u2netp"));
        assert!(!cache.is_ready("isnet-general-use"));
        assert_eq!(cache.factory().constructions(), 2);
        Ok(())
    }

    #[test]
    fn test_probe_fails_immediately_when_registry_is_busy() {
        let cache = SessionCache::new(MockSessionFactory::new());
        let registry = cache.lock_registry();

        let started = Instant::now();
        assert!(matches!(
            cache.readiness("u2net"),
            Err(BgRemovalError::ReadinessProbe { .. })
        ));
        assert!(started.elapsed() < Duration::from_millis(5));
        assert!(!cache.is_ready("u2net"));

        drop(registry);
        assert_eq!(cache.readiness("u2net").unwrap(), Readiness::NotReady);
    }

    #[test]
    fn test_session_exposes_metadata() -> Result<()> {
        let before = Utc::now();
        let cache = SessionCache::new(MockSessionFactory::new());
        let session = cache.get_or_create("u2net")?;

        assert_eq!(session.input_size(), 320);
        assert!(session.created_at() >= before);
        assert!(Arc::ptr_eq(&session, &cache.session("u2net").unwrap()));
        Ok(())
    }
}
