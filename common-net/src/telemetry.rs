use std::sync::Once;

use tracing::info;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Installs the global subscriber once per process.
///
/// `RUST_LOG` drives the filter (default `info`); `LOG_FORMAT=json` switches
/// the output to JSON lines for log shippers.
pub fn init(service_name: &str) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let json = std::env::var("LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let builder = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_names(true);

        // try_init: tests in the same binary may race a second subscriber
        let result = if json {
            builder.json().try_init()
        } else {
            builder.compact().try_init()
        };
        if let Err(err) = result {
            eprintln!("telemetry: subscriber already installed: {err}");
        }
    });

    info!(service = service_name, "telemetry initialized");
}
