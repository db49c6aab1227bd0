// ABOUTME: Process-wide tracing setup.
// ABOUTME: Human-readable output by default, JSON when asked for.
use std::sync::Once;
use tracing_subscriber::EnvFilter;

static SUBSCRIBER: Once = Once::new();

/// Install the global subscriber. Filtering comes from `RUST_LOG` with an
/// `info` fallback; repeated calls are no-ops so tests can set up freely.
pub fn init(service: &str, json_output: bool) {
    SUBSCRIBER.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info"));

        if json_output {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .init();
        } else {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }

        tracing::info!(service, json_output, "Logging ready");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init("cronhub-test", false);
        // A second call, even with different settings, must not panic
        init("cronhub-test", true);
    }
}
