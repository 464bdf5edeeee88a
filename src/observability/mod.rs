//! Logging setup
//!
//! Filter and format come from [`LogConfig`], which environment variables can
//! override (`KV_SCAN_LOG`, `KV_SCAN_LOG_FORMAT`).

use crate::config::{LogConfig, LogFormat};
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// Returns false if a subscriber was already installed (e.g. by a test), in
/// which case the existing one stays in place.
pub fn init_tracing(config: &LogConfig) -> bool {
    let filter = EnvFilter::try_new(&config.filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let installed = match config.format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().with_current_span(false).try_init(),
    };
    installed.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_rejected() {
        let config = LogConfig {
            filter: "kv_scan=debug".to_string(),
            format: LogFormat::Pretty,
        };
        init_tracing(&config);
        assert!(!init_tracing(&config));
    }
}
