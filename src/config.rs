use std::net::SocketAddr;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use axum::http::HeaderValue;
use clap::{ArgAction, Parser};

use crate::errors::{BgRemovalError, Result};

pub const DEFAULT_SERVICE_NAME: &str = "Background Removal API";
pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Room for multipart boundaries and part headers on top of the file itself.
pub const MULTIPART_OVERHEAD: u64 = 64 * 1024;

/// Service configuration. Every option can also be set through its environment
/// variable.
#[derive(Parser, Clone, Debug)]
#[command(version, about, long_about = None)]
pub struct Config {
    #[arg(long, env = "APP_NAME", default_value = DEFAULT_SERVICE_NAME)]
    pub service_name: String,

    #[arg(long, env = "APP_VERSION", default_value = env!("CARGO_PKG_VERSION"))]
    pub service_version: String,

    #[arg(long, env = "API_HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(short, long, env = "API_PORT", default_value_t = 8000)]
    pub port: u16,

    /// Allowed CORS origins, comma separated. `*` allows any origin.
    #[arg(long, env = "CORS_ORIGINS", value_delimiter = ',', default_value = "*")]
    pub cors_origins: Vec<String>,

    /// Maximum accepted upload size in bytes.
    #[arg(long, env = "MAX_FILE_SIZE", default_value_t = DEFAULT_MAX_FILE_SIZE)]
    pub max_file_size: u64,

    /// Default log filter; a `RUST_LOG` directive takes precedence.
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(short, long, env = "MODEL_NAME", default_value = "u2net")]
    pub model_name: String,

    /// Directory holding `<model-name>.onnx`.
    #[arg(long, env = "MODEL_DIR", default_value = "models")]
    pub model_dir: PathBuf,

    #[arg(short, long, env = "DEVICE_ID", default_value_t = 0)]
    pub device_id: i32,

    #[arg(short, long, env = "NUM_THREADS", default_value_t = default_num_threads())]
    pub num_threads: usize,

    #[arg(long, env = "UPLOAD_TIMEOUT_SECS", default_value_t = 30)]
    pub upload_timeout_secs: u64,

    #[arg(long, env = "INFERENCE_TIMEOUT_SECS", default_value_t = 120)]
    pub inference_timeout_secs: u64,

    /// Let requests through when the readiness probe itself errors.
    #[arg(long, env = "ADMISSION_FAIL_OPEN", default_value_t = true, action = ArgAction::Set)]
    pub admission_fail_open: bool,

    #[arg(long, env = "WARM_ON_STARTUP", default_value_t = true, action = ArgAction::Set)]
    pub warm_on_startup: bool,
}

fn default_num_threads() -> usize {
    thread::available_parallelism().map_or(1, |n| n.get())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            host: "0.0.0.0".to_string(),
            port: 8000,
            cors_origins: vec!["*".to_string()],
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            log_level: "info".to_string(),
            model_name: "u2net".to_string(),
            model_dir: PathBuf::from("models"),
            device_id: 0,
            num_threads: default_num_threads(),
            upload_timeout_secs: 30,
            inference_timeout_secs: 120,
            admission_fail_open: true,
            warm_on_startup: true,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(BgRemovalError::configuration("port must be non-zero"));
        }
        if self.max_file_size == 0 {
            return Err(BgRemovalError::configuration(
                "max_file_size must be greater than zero",
            ));
        }
        if self.model_name.trim().is_empty() {
            return Err(BgRemovalError::configuration("model_name must not be empty"));
        }
        if self.upload_timeout_secs == 0 || self.inference_timeout_secs == 0 {
            return Err(BgRemovalError::configuration(
                "timeouts must be greater than zero",
            ));
        }
        self.explicit_cors_origins()?;
        Ok(())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| BgRemovalError::configuration(format!("invalid bind address: {e}")))
    }

    pub fn allows_any_origin(&self) -> bool {
        self.cors_origins.iter().any(|o| o.trim() == "*")
    }

    /// Parses the configured origins as header values. Empty when any origin is
    /// allowed.
    pub fn explicit_cors_origins(&self) -> Result<Vec<HeaderValue>> {
        if self.allows_any_origin() {
            return Ok(Vec::new());
        }
        self.cors_origins
            .iter()
            .map(|origin| origin.trim())
            .filter(|origin| !origin.is_empty())
            .map(|origin| {
                HeaderValue::from_str(origin).map_err(|e| {
                    BgRemovalError::configuration(format!("invalid CORS origin `{origin}`: {e}"))
                })
            })
            .collect()
    }

    /// Request body limit for the upload route.
    pub fn body_limit(&self) -> usize {
        usize::try_from(self.max_file_size.saturating_add(MULTIPART_OVERHEAD))
            .unwrap_or(usize::MAX)
    }

    pub const fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    pub const fn inference_timeout(&self) -> Duration {
        Duration::from_secs(self.inference_timeout_secs)
    }
}
