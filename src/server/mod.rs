//! HTTP surface of the service.
//!
//! | Method | Path                 | Purpose                                   |
//! |--------|----------------------|-------------------------------------------|
//! | GET    | `/`                  | service metadata                          |
//! | GET    | `/health`            | liveness                                  |
//! | GET    | `/ready`             | 200 once the model session exists, or 503 |
//! | POST   | `/warm`              | start building the session in background  |
//! | POST   | `/remove-background` | multipart upload, returns a PNG           |

pub mod error;
pub mod routes;
pub mod state;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderName, Method},
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::errors::Result;
use crate::traits::SessionFactory;

pub use error::ApiError;
pub use routes::remove_background::{derived_filename, FILE_FIELD, PROCESSING_TIME_HEADER};
pub use state::{AppState, SharedState};

/// An upload as received, owned by the request handling it.
#[derive(Debug, Clone)]
pub struct UploadedImage {
    pub filename: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

pub fn router<F: SessionFactory>(state: SharedState<F>) -> Result<Router> {
    let cors = cors_layer(&state.config)?;
    let body_limit = DefaultBodyLimit::max(state.config.body_limit());

    Ok(Router::new()
        .route("/", get(routes::info::root::<F>))
        .route("/health", get(routes::info::health::<F>))
        .route("/ready", get(routes::info::ready::<F>))
        .route("/warm", post(routes::warm::warm::<F>))
        .route(
            "/remove-background",
            post(routes::remove_background::remove_background::<F>).layer(body_limit),
        )
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors))
}

fn cors_layer(config: &Config) -> Result<CorsLayer> {
    let exposed = [
        HeaderName::from_static(PROCESSING_TIME_HEADER),
        header::CONTENT_DISPOSITION,
    ];

    if config.allows_any_origin() {
        return Ok(CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
            .expose_headers(exposed));
    }

    // credentialed CORS cannot use wildcards
    Ok(CorsLayer::new()
        .allow_origin(config.explicit_cors_origins()?)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT, header::AUTHORIZATION])
        .allow_credentials(true)
        .expose_headers(exposed))
}
