//! Background removal over HTTP.
//!
//! A U2-Net segmentation session is built lazily, at most once per model id, and
//! shared by every request. The HTTP layer refuses uploads until that session is
//! ready, and warmup runs on the blocking pool so neither startup nor request
//! handling waits for it.

pub mod config;
pub mod errors;
pub mod image_processor;
pub mod model;
pub mod server;
pub mod session;
pub mod telemetry;
pub mod traits;
pub mod validator;
pub mod warmup;

pub mod mocks;

pub use config::Config;
pub use errors::{BgRemovalError, Result};
pub use image_processor::{ImageProcessor, ProcessedImage};
pub use model::{Model, OnnxSessionFactory};
pub use session::{Readiness, Session, SessionCache};
pub use traits::*;
pub use warmup::{WarmupCoordinator, WarmupOutcome};
