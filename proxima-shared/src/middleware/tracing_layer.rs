use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    /// JSON lines when `PROXIMA_ENV=production`, human-readable otherwise.
    pub fn from_env() -> Self {
        match std::env::var("PROXIMA_ENV").as_deref() {
            Ok("production") => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

/// Filter used when `RUST_LOG` is unset: the service's own crate at debug,
/// everything else at info.
pub fn default_filter(service_name: &str) -> String {
    let crate_target = service_name.replace('-', "_");
    format!("info,{crate_target}=debug,tower_http=debug")
}

pub fn init_tracing(service_name: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(service_name)));
    let format = LogFormat::from_env();

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = match format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_line_number(true),
            )
            .try_init(),
    };

    match installed {
        Ok(()) => tracing::info!(service = service_name, format = ?format, "tracing initialized"),
        Err(e) => tracing::debug!(error = %e, "tracing subscriber already installed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_targets_the_service_crate() {
        let filter = default_filter("proxima-server");
        assert!(filter.contains("proxima_server=debug"));
        assert!(filter.starts_with("info,"));
    }
}
