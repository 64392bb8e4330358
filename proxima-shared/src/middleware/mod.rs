//! Request-path plumbing shared by every Proxima binary: bearer-token
//! extractors, log subscriber setup and the Prometheus recorder.

mod auth_extractor;
mod extract;
mod metrics_layer;
mod tracing_layer;

pub use auth_extractor::{issue_session_token, validate_jwt, OptionalAuthUser};
pub use extract::{ApiJson, ApiPath, ApiQuery};
pub use metrics_layer::{init_metrics, metrics_middleware};
pub use tracing_layer::{init_tracing, LogFormat};
