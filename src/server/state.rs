use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::session::SessionCache;
use crate::traits::SessionFactory;
use crate::warmup::WarmupCoordinator;

/// State shared by every handler.
pub struct AppState<F: SessionFactory> {
    pub config: Config,
    pub cache: Arc<SessionCache<F>>,
    pub warmup: WarmupCoordinator<F>,
    pub started_at: DateTime<Utc>,
}

pub type SharedState<F> = Arc<AppState<F>>;

impl<F: SessionFactory> AppState<F> {
    /// Builds the state without constructing any model session.
    pub fn new(config: Config, factory: F) -> Self {
        let cache = Arc::new(SessionCache::new(factory));
        let warmup = WarmupCoordinator::new(Arc::clone(&cache));
        Self {
            config,
            cache,
            warmup,
            started_at: Utc::now(),
        }
    }

    pub fn model_id(&self) -> &str {
        &self.config.model_name
    }

    pub fn uptime_seconds(&self) -> u64 {
        (Utc::now() - self.started_at).num_seconds().max(0) as u64
    }
}
