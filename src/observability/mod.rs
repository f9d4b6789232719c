use tracing_subscriber::EnvFilter;

use crate::config::{FeaturesConfig, LogFormat};

/// Initialize the tracing subscriber with the configured log level.
///
/// Maps config log levels to tracing levels:
/// - "DISABLED" -> no subscriber installed
/// - "WARNING" -> WARN
/// - "CRITICAL" -> ERROR
/// - Others map directly (DEBUG, INFO, ERROR)
///
/// Logs go to stderr so they never interleave with the streamed reply.
pub fn init_tracing(features: &FeaturesConfig) {
    let Some(directive) = tracing_directive(&features.log_level) else {
        return;
    };

    let filter = EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("INFO"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);

    match features.log_format {
        LogFormat::Text => builder.with_thread_ids(false).init(),
        LogFormat::Json => builder.json().flatten_event(true).init(),
    }
}

fn tracing_directive(log_level: &str) -> Option<String> {
    let level = log_level.to_uppercase();
    match level.as_str() {
        "DISABLED" => None,
        "WARNING" => Some("WARN".to_string()),
        "CRITICAL" => Some("ERROR".to_string()),
        _ => Some(level),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_mapping() {
        assert_eq!(tracing_directive("disabled"), None);
        assert_eq!(tracing_directive("warning").as_deref(), Some("WARN"));
        assert_eq!(tracing_directive("CRITICAL").as_deref(), Some("ERROR"));
        assert_eq!(tracing_directive("debug").as_deref(), Some("DEBUG"));
    }
}
